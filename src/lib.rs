//! # unit-supervisor
//!
//! `unit-supervisor` keeps a directory full of processes alive.
//! Every subdirectory of the root that contains an executable `run` file is a
//! *unit*. Units are launched, their output is captured into per-run log
//! files, crashed units are relaunched after a delay, and units that stop
//! sending heartbeats are restarted.
//!
//! ## Quick example
//!
//! ```rust,no_run
//! use unit_supervisor::SupervisorBuilder;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let handle = SupervisorBuilder::new("/srv/units").build()?.run();
//!
//!     for status in handle.statuses().await? {
//!         println!("{} is {}", status.name, status.state);
//!     }
//!
//!     handle.shutdown()?;
//!     let report = handle.wait().await?;
//!     println!("shutdown: {:?}", report.outcome);
//!     Ok(())
//! }
//! ```
//!
//! ## Unit directory layout
//!
//! ```text
//! <root>/<unit>/run          executable entrypoint (required)
//! <root>/<unit>/run.conf     YAML settings (optional)
//! <root>/<unit>/logs/        one log file per run
//! <root>/<unit>/current.log  symlink to the latest run log
//! ```
//!
//! `run.conf` keys: `heartbeat_timeout` (seconds), `autostart`, `autorestart`,
//! `crash_limit`, `restart_delay` (seconds), `actions` (name → shell command),
//! `filter` (regex of output lines to keep out of the logs), `multiplexed`.
//!
//! ## What you get
//!
//! * **Crash recovery** – unexpected exits are relaunched after `restart_delay`
//!   until `crash_limit` consecutive crashes park the unit as `crashed`.
//! * **Heartbeats** – a unit printing `THUMP`, `heartbeat` or `don't kill me`
//!   is restarted once it goes quiet for longer than `heartbeat_timeout`.
//! * **Exclusive groups** – at most one `multiplexed` unit runs at a time;
//!   starting one stops the others.
//! * **Bounded shutdown** – every unit is asked to stop, then the supervisor
//!   waits a fixed number of polls before giving up.
//!
//! ## API overview
//!
//! | SupervisorHandle method     | Purpose                                         |
//! | --------------------------- | ----------------------------------------------- |
//! | `unit_names().await`        | Every unit, in discovery order                  |
//! | `status(name).await`        | `UnitStatus` (state, pid, actions, crashes, …)  |
//! | `invoke(name, action).await`| `start`, `stop`, `restart`, `kill!` or custom   |
//! | `tail(name, query).await`   | Lines of the current or a historical run log    |
//! | `list_runs(name).await`     | Historical run logs, newest first               |
//! | `status_tuples().await`     | `(hostname, unit, state)` for broadcasting      |
//! | `shutdown()`                | Stop every unit and end the supervisor          |
//! | `wait().await`              | `ShutdownReport` once the supervisor has ended  |

pub use channel::{
    ChannelEvent, ChannelEvents, ChannelMessage, ExitInfo, OutputLineCodec, ProcessChannel,
};
pub use log_store::{LogError, LogQuery, LogStore, RunFile, RunLog, TailDirection};
pub use os_info::{OsFamily, OsInfo};
pub use signals::ShutdownSignals;
pub use supervisor::{
    builder::SupervisorBuilder,
    discover,
    handle::{SupervisorHandle, SupervisorHandleError},
    ShutdownOutcome, ShutdownReport, Supervisor, SupervisorError,
};
pub use unit::{
    action::{Action, ActionError, Invocation},
    config::{ConfigError, UnitConfig},
    is_heartbeat, ProcessUnit, UnitError, UnitState, UnitStatus, RESTART_ACTION_DELAY,
};

mod channel;
mod log_store;
mod os_info;
mod signals;
mod supervisor;
mod unit;

pub type UnitName = String;

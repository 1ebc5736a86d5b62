pub(crate) mod action;
pub(crate) mod config;

use std::{
    fmt, io,
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};

use regex::Regex;
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, error, info, warn};

use crate::{
    channel::{ChannelEvent, ChannelEvents, ExitInfo, ProcessChannel},
    log_store::{LogStore, RunLog},
    supervisor::SupervisedUnitMessage,
    UnitName,
};
use action::{Action, ActionError, Invocation};
use config::UnitConfig;

/// Delay between stopping and relaunching for an explicit restart.
///
/// Unrelated to the configurable `restart_delay`, which only applies to
/// relaunches after a crash.
pub const RESTART_ACTION_DELAY: Duration = Duration::from_secs(3);

static HEARTBEAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(THUMP|heartbeat|don't kill me)\b").expect("heartbeat pattern is valid")
});

/// Whether an output line is a liveness marker rather than log content.
pub fn is_heartbeat(line: &str) -> bool {
    HEARTBEAT.is_match(line)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitState {
    Stopped,
    Running,
    /// A termination signal was sent; waiting for the process to exit.
    Waiting,
    /// A relaunch is scheduled.
    Restarting,
    /// Crash limit reached; stays here until started explicitly.
    Crashed,
}

impl UnitState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// States the shutdown sequence waits for.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed)
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
            Self::Waiting => write!(f, "waiting"),
            Self::Restarting => write!(f, "restarting"),
            Self::Crashed => write!(f, "crashed"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UnitError {
    #[error("failed to launch {unit}: {source}")]
    Spawn {
        unit: UnitName,
        #[source]
        source: io::Error,
    },
}

/// Point-in-time view of a unit for the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitStatus {
    pub name: UnitName,
    pub state: UnitState,
    pub pid: Option<u32>,
    pub actions: Vec<String>,
    pub crashes: u32,
    pub multiplexed: bool,
    pub current_log: Option<PathBuf>,
}

/// One supervised process and everything the supervisor knows about it.
///
/// All mutation happens on the supervisor loop. Timers never touch the
/// unit directly: they post a message back to the loop, tagged with the
/// generation they were scheduled under, and the loop drops them if the
/// unit has moved on since.
pub struct ProcessUnit {
    name: UnitName,
    dir: PathBuf,
    config: UnitConfig,
    state: UnitState,
    crashes: u32,
    last_heartbeat: Option<Instant>,
    heartbeat_restart_pending: bool,
    channel: Option<ProcessChannel>,
    intentional_stop: bool,
    start_on_exit: Option<bool>,
    generation: u64,
    runs: u64,
    logs: LogStore,
    run_log: Option<RunLog>,
    verbose: bool,
    tx: mpsc::UnboundedSender<SupervisedUnitMessage>,
}

impl ProcessUnit {
    pub(crate) fn new(
        name: UnitName,
        dir: PathBuf,
        config: UnitConfig,
        verbose: bool,
        tx: mpsc::UnboundedSender<SupervisedUnitMessage>,
    ) -> Self {
        let logs = LogStore::new(name.clone(), dir.clone());
        Self {
            name,
            dir,
            config,
            state: UnitState::Stopped,
            crashes: 0,
            last_heartbeat: None,
            heartbeat_restart_pending: false,
            channel: None,
            intentional_stop: false,
            start_on_exit: None,
            generation: 0,
            runs: 0,
            logs,
            run_log: None,
            verbose,
            tx,
        }
    }

    pub fn name(&self) -> &UnitName {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &UnitConfig {
        &self.config
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    pub fn crashes(&self) -> u32 {
        self.crashes
    }

    pub fn pid(&self) -> Option<u32> {
        self.channel.as_ref().map(ProcessChannel::pid)
    }

    /// Whether a process is launched or running and has not been asked to stop.
    pub fn is_live(&self) -> bool {
        self.channel.as_ref().is_some_and(|channel| !channel.is_signalled())
    }

    pub fn is_multiplexed(&self) -> bool {
        self.config.multiplexed
    }

    pub fn logs(&self) -> &LogStore {
        &self.logs
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Built-in actions legal in the current state, then custom actions.
    pub fn actions(&self) -> Vec<String> {
        let mut names: Vec<String> = Action::allowed_in(self.state)
            .iter()
            .map(|action| action.name().to_owned())
            .collect();
        for custom in self.config.custom_actions.keys() {
            if !names.contains(custom) {
                names.push(custom.clone());
            }
        }
        names
    }

    /// Resolves an action name: custom actions first, then built-ins legal
    /// in the current state.
    pub fn resolve(&self, name: &str) -> Result<Invocation, ActionError> {
        if let Some(command) = self.config.custom_actions.get(name) {
            return Ok(Invocation::Custom {
                name: name.to_owned(),
                command: command.clone(),
            });
        }
        let action: Action = name.parse()?;
        if !action.is_allowed_in(self.state) {
            return Err(ActionError::Rejected {
                action,
                state: self.state,
            });
        }
        Ok(Invocation::Builtin(action))
    }

    pub fn status(&self) -> UnitStatus {
        UnitStatus {
            name: self.name.clone(),
            state: self.state,
            pid: self.pid(),
            actions: self.actions(),
            crashes: self.crashes,
            multiplexed: self.config.multiplexed,
            current_log: self.run_log.as_ref().map(|log| log.path().to_path_buf()),
        }
    }

    /// Launches the process. Exclusivity with multiplexed siblings is the
    /// supervisor's job and must happen before this is called.
    pub(crate) fn start(&mut self, intentional: bool) -> Result<(), UnitError> {
        self.generation += 1;

        match self.channel.as_ref().map(ProcessChannel::is_signalled) {
            Some(true) => {
                info!(unit = %self.name, "previous process still exiting, starting once it is gone");
                self.start_on_exit = Some(intentional);
                return Ok(());
            }
            Some(false) => return Ok(()),
            None => {}
        }

        if intentional {
            self.crashes = 0;
        }
        self.runs += 1;
        info!(unit = %self.name, "starting");

        match ProcessChannel::spawn(&self.name, &self.dir, self.runs, self.tx.clone()) {
            Ok(channel) => {
                debug!(unit = %self.name, pid = channel.pid(), run = self.runs, "spawned");
                self.channel = Some(channel);
                Ok(())
            }
            Err(source) => {
                error!(unit = %self.name, error = %source, "failed to launch");
                self.state = UnitState::Stopped;
                Err(UnitError::Spawn {
                    unit: self.name.clone(),
                    source,
                })
            }
        }
    }

    /// Asks the process to terminate. Also cancels a pending relaunch.
    pub(crate) fn stop(&mut self, intentional: bool) {
        self.generation += 1;
        self.start_on_exit = None;

        match self.channel.as_ref().map(ProcessChannel::is_signalled) {
            Some(false) => {
                info!(unit = %self.name, "stopping");
                self.intentional_stop = intentional;
                self.send_signal("TERM", ProcessChannel::terminate);
            }
            Some(true) => {
                if self.state == UnitState::Restarting {
                    self.intentional_stop = intentional;
                    self.state = UnitState::Waiting;
                }
            }
            None => {
                if self.state == UnitState::Restarting {
                    info!(unit = %self.name, "pending relaunch cancelled");
                    self.state = UnitState::Stopped;
                }
            }
        }
    }

    /// Stops now and starts again after [`RESTART_ACTION_DELAY`].
    pub(crate) fn restart(&mut self, intentional: bool) {
        info!(unit = %self.name, "restarting");
        self.stop(intentional);
        self.state = UnitState::Restarting;
        self.schedule_start(RESTART_ACTION_DELAY, intentional);
    }

    /// Forcefully terminates the process (SIGKILL).
    pub(crate) fn kill(&mut self) {
        if self.channel.is_some() {
            info!(unit = %self.name, "killing");
            self.send_signal("KILL", ProcessChannel::kill);
        }
    }

    fn send_signal(&mut self, label: &str, send: fn(&mut ProcessChannel) -> nix::Result<()>) {
        let Some(channel) = self.channel.as_mut() else {
            return;
        };
        let pid = channel.pid();
        match send(channel) {
            Ok(()) => self.state = UnitState::Waiting,
            Err(e) => {
                self.log(&format!(
                    "Couldn't kill pid {pid} with signal {label} ({e}). Process already dead?"
                ));
                self.channel = None;
                self.intentional_stop = false;
                self.state = UnitState::Stopped;
            }
        }
    }

    fn schedule_start(&mut self, delay: Duration, intentional: bool) {
        self.generation += 1;
        let msg = SupervisedUnitMessage::DeferredStart {
            unit: self.name.clone(),
            intentional,
            generation: self.generation,
        };
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(msg);
        });
    }

    /// Flags a heartbeat timeout. Returns `true` once per breach; the
    /// caller is expected to queue the restart rather than run it inline.
    pub(crate) fn check_heartbeat(&mut self, now: Instant) -> bool {
        let (Some(timeout), Some(last)) = (self.config.heartbeat_timeout, self.last_heartbeat)
        else {
            return false;
        };
        if self.state != UnitState::Running || self.heartbeat_restart_pending {
            return false;
        }
        if now.saturating_duration_since(last) <= timeout {
            return false;
        }

        self.heartbeat_restart_pending = true;
        warn!(unit = %self.name, ?timeout, "heartbeat timed out");
        self.log("---------- TIMEOUT! Restarting... ----------------------");
        true
    }

    /// Consumes a flagged heartbeat timeout; `true` if the restart should
    /// still go ahead.
    pub(crate) fn take_heartbeat_restart(&mut self) -> bool {
        std::mem::take(&mut self.heartbeat_restart_pending) && self.state == UnitState::Running
    }

    /// Routes an event from the unit's channel, dropping events from
    /// processes the unit no longer tracks.
    pub(crate) fn handle_channel_event(&mut self, run: u64, event: ChannelEvent) {
        if self.channel.as_ref().map(ProcessChannel::run) != Some(run) {
            debug!(unit = %self.name, run, "dropping event from a previous run");
            return;
        }
        event.dispatch(self);
    }

    /// Writes to the current run log. Failures are reported and otherwise ignored.
    fn log(&mut self, message: &str) {
        if let Some(run_log) = self.run_log.as_mut() {
            if let Err(e) = run_log.append(message) {
                warn!(unit = %self.name, error = %e, "failed to write run log");
            }
        }
        if self.verbose || self.run_log.is_none() {
            info!(target: "unit_output", unit = %self.name, "{message}");
        }
    }
}

impl ChannelEvents for ProcessUnit {
    fn on_start(&mut self, pid: u32) {
        self.run_log = match self.logs.open_run() {
            Ok(run_log) => Some(run_log),
            Err(e) => {
                warn!(unit = %self.name, error = %e, "failed to open run log");
                None
            }
        };
        self.last_heartbeat = None;
        self.heartbeat_restart_pending = false;

        // A stop may have been requested before the launch was confirmed.
        let stopping = self.channel.as_ref().is_some_and(ProcessChannel::is_signalled);
        if !stopping {
            self.state = UnitState::Running;
        }
        self.log(&format!("--- Process started (pid {pid}). -----------------"));
    }

    fn on_line(&mut self, line: String) {
        if is_heartbeat(&line) {
            self.last_heartbeat = Some(Instant::now());
            return;
        }
        if self
            .config
            .output_filter
            .as_ref()
            .is_some_and(|filter| filter.is_match(&line))
        {
            return;
        }
        self.log(&line);
    }

    fn on_exit(&mut self, exit: ExitInfo) {
        let Some(channel) = self.channel.take() else {
            self.log("--- process closed (unknown cause -- the channel disappeared!)");
            return;
        };

        if std::mem::take(&mut self.intentional_stop) {
            self.log("--- Process STOPPED on purpose -----------------");
            info!(unit = %self.name, %exit, "stopped");
            if let Some(intentional) = self.start_on_exit.take() {
                self.state = UnitState::Stopped;
                let _ = self.start(intentional);
            } else if self.state != UnitState::Restarting {
                self.state = UnitState::Stopped;
            }
            return;
        }

        self.start_on_exit = None;
        if !self.config.autorestart {
            self.log(&format!("--- Process exited ({exit}); autorestart is off"));
            info!(unit = %self.name, %exit, "exited");
            self.state = UnitState::Stopped;
            return;
        }

        self.crashes += 1;
        self.log("--- CRASH!!!! -----------------");
        if self.crashes >= self.config.crash_limit {
            self.log(&format!(
                "--- process #{} terminated ({exit}), {} crashes in a row. Giving up.",
                channel.pid(),
                self.crashes
            ));
            error!(unit = %self.name, crashes = self.crashes, "crash limit reached");
            self.state = UnitState::Crashed;
        } else {
            let delay = self.config.restart_delay;
            self.log(&format!(
                "--- process #{} terminated ({exit}), {} crashes in a row... restarting in {delay:?}",
                channel.pid(),
                self.crashes
            ));
            warn!(unit = %self.name, crashes = self.crashes, %exit, "crashed");
            self.state = UnitState::Restarting;
            self.schedule_start(delay, false);
        }
    }
}

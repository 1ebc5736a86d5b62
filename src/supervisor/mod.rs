pub(crate) mod builder;
pub(crate) mod handle;

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use handle::{SupervisorHandleError, SupervisorMessage};
use tokio::{
    sync::{mpsc, watch},
    time::{interval_at, Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    channel::{ChannelMessage, ENTRYPOINT},
    os_info::OsInfo,
    supervisor::handle::SupervisorHandle,
    unit::{
        action::{self, Action, ActionError, Invocation},
        ProcessUnit, UnitError,
    },
    UnitName,
};

/// Internal messages, posted by channels and timers back to the supervisor loop.
#[derive(Debug)]
pub(crate) enum SupervisedUnitMessage {
    /// Output or lifecycle event from a unit's process.
    Channel(ChannelMessage),
    /// A relaunch scheduled earlier; ignored if the unit has moved on.
    DeferredStart {
        unit: UnitName,
        intentional: bool,
        generation: u64,
    },
    /// Raised by the health sweep; handled on a later loop turn.
    HeartbeatExpired(UnitName),
}

impl From<ChannelMessage> for SupervisedUnitMessage {
    fn from(msg: ChannelMessage) -> Self {
        Self::Channel(msg)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("supplied directory {0} does not exist")]
    RootNotFound(PathBuf),
    #[error("no runnable directories found in {0}")]
    NoRunnableUnits(PathBuf),
    #[error("failed to scan {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every unit reached a terminal state.
    Graceful,
    /// The poll budget ran out; some processes may still be alive.
    Forced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub outcome: ShutdownOutcome,
    pub polls: u32,
    /// Units that had not reached a terminal state when the loop ended.
    pub remaining: Vec<UnitName>,
}

struct ShutdownProgress {
    polls: u32,
    interval: Interval,
}

/// Lists the unit directories under `root`.
///
/// A directory qualifies if it holds a `run` file. With `only`, the scan is
/// limited to those names.
pub fn discover(root: &Path, only: Option<&[String]>) -> Result<Vec<PathBuf>, SupervisorError> {
    if !root.is_dir() {
        return Err(SupervisorError::RootNotFound(root.to_path_buf()));
    }

    let candidates: Vec<PathBuf> = match only {
        Some(names) => names
            .iter()
            .filter(|name| {
                let plain = !name.is_empty() && *name != "." && *name != ".." && !name.contains('/');
                if !plain {
                    warn!(name = %name, "ignoring unit name that is not a plain directory name");
                }
                plain
            })
            .map(|name| root.join(name))
            .collect(),
        None => fs::read_dir(root)
            .map_err(|source| SupervisorError::Io {
                path: root.to_path_buf(),
                source,
            })?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .collect(),
    };

    let mut dirs: Vec<PathBuf> = candidates
        .into_iter()
        .filter(|dir| dir.is_dir() && dir.join(ENTRYPOINT).is_file())
        .collect();
    dirs.sort();
    dirs.dedup();

    if dirs.is_empty() {
        return Err(SupervisorError::NoRunnableUnits(root.to_path_buf()));
    }
    Ok(dirs)
}

/// Owns every unit and is the only place unit state changes.
///
/// Channel events, timer callbacks, health sweeps and user requests all
/// arrive as messages and are handled one at a time by a single task.
pub struct Supervisor {
    root: PathBuf,
    os: OsInfo,
    units: Vec<ProcessUnit>,
    index: HashMap<UnitName, usize>,
    health_check_interval: Duration,
    shutdown_poll_interval: Duration,
    shutdown_attempts: u32,
    shutdown: Option<ShutdownProgress>,
    internal_tx: mpsc::UnboundedSender<SupervisedUnitMessage>,
    internal_rx: mpsc::UnboundedReceiver<SupervisedUnitMessage>,
    external_tx: mpsc::UnboundedSender<SupervisorMessage>,
    external_rx: mpsc::UnboundedReceiver<SupervisorMessage>,
}

impl Supervisor {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn os_info(&self) -> &OsInfo {
        &self.os
    }

    pub fn unit_names(&self) -> Vec<UnitName> {
        self.units.iter().map(|unit| unit.name().clone()).collect()
    }

    pub fn lookup(&self, name: &str) -> Option<&ProcessUnit> {
        self.index.get(name).map(|&i| &self.units[i])
    }

    fn lookup_mut(&mut self, name: &str) -> Option<&mut ProcessUnit> {
        self.index.get(name).map(|&i| &mut self.units[i])
    }

    /// Runs the supervisor on its own task and returns a handle to control it.
    pub fn run(self) -> SupervisorHandle {
        let (done_tx, done_rx) = watch::channel(None);
        let handle = SupervisorHandle::new(
            self.external_tx.clone(),
            done_rx,
            self.os.hostname.clone(),
        );
        tokio::spawn(async move {
            let report = self.run_and_supervise().await;
            let _ = done_tx.send(Some(report));
        });
        handle
    }

    async fn run_and_supervise(mut self) -> ShutdownReport {
        info!(root = %self.root.display(), host = %self.os.hostname, os = %self.os.family, "launching units");
        self.start_all_units();
        self.supervise_all_units().await
    }

    /// Starts every autostart unit. Multiplexed units are left for an
    /// explicit start.
    fn start_all_units(&mut self) {
        for i in 0..self.units.len() {
            let unit = &self.units[i];
            let name = unit.name().clone();
            if unit.config().autostart && !unit.is_multiplexed() {
                info!(unit = %name, "launching");
                let _ = self.start_unit(&name, true);
            } else {
                info!(unit = %name, "skipping");
            }
        }
    }

    async fn supervise_all_units(&mut self) -> ShutdownReport {
        let mut health_check = interval_at(
            Instant::now() + self.health_check_interval,
            self.health_check_interval,
        );
        health_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(msg) = self.internal_rx.recv() => {
                    self.handle_unit_message(msg);
                },
                Some(msg) = self.external_rx.recv() => {
                    self.handle_user_message(msg);
                },
                _ = health_check.tick() => {
                    self.check_all_heartbeats();
                },
                _ = next_shutdown_poll(&mut self.shutdown) => {
                    if let Some(report) = self.poll_shutdown() {
                        return report;
                    }
                }
            }
        }
    }

    fn handle_unit_message(&mut self, msg: SupervisedUnitMessage) {
        let shutting_down = self.shutdown.is_some();
        match msg {
            SupervisedUnitMessage::Channel(ChannelMessage { unit, run, event }) => {
                let Some(unit) = self.lookup_mut(&unit) else {
                    return;
                };
                unit.handle_channel_event(run, event);
                if shutting_down && !unit.state().is_terminal() && unit.pid().is_none() {
                    unit.stop(true);
                }
            }
            SupervisedUnitMessage::DeferredStart {
                unit,
                intentional,
                generation,
            } => {
                if shutting_down {
                    debug!(unit = %unit, "shutting down, dropping scheduled start");
                    return;
                }
                match self.lookup(&unit).map(ProcessUnit::generation) {
                    Some(current) if current == generation => {
                        let _ = self.start_unit(&unit, intentional);
                    }
                    Some(_) => debug!(unit = %unit, "dropping stale scheduled start"),
                    None => {}
                }
            }
            SupervisedUnitMessage::HeartbeatExpired(unit) => {
                let Some(unit) = self.lookup_mut(&unit) else {
                    return;
                };
                if unit.take_heartbeat_restart() && !shutting_down {
                    unit.restart(true);
                }
            }
        }
    }

    fn handle_user_message(&mut self, msg: SupervisorMessage) {
        match msg {
            SupervisorMessage::UnitNames(reply) => {
                let _ = reply.send(self.unit_names());
            }
            SupervisorMessage::Status(name, reply) => {
                let _ = reply.send(self.lookup(&name).map(ProcessUnit::status));
            }
            SupervisorMessage::Statuses(reply) => {
                let _ = reply.send(self.units.iter().map(ProcessUnit::status).collect());
            }
            SupervisorMessage::Logs(name, reply) => {
                let _ = reply.send(self.lookup(&name).map(|unit| unit.logs().clone()));
            }
            SupervisorMessage::Invoke {
                unit,
                action,
                reply,
            } => self.invoke(unit, action, reply),
            SupervisorMessage::Shutdown => self.begin_shutdown(),
        }
    }

    fn invoke(
        &mut self,
        name: UnitName,
        action_name: String,
        reply: tokio::sync::oneshot::Sender<Result<Option<String>, SupervisorHandleError>>,
    ) {
        if self.shutdown.is_some() {
            let _ = reply.send(Err(ActionError::ShuttingDown.into()));
            return;
        }
        let Some(unit) = self.lookup(&name) else {
            let _ = reply.send(Err(SupervisorHandleError::UnitNotFound(name)));
            return;
        };

        let dir = unit.dir().to_path_buf();
        match unit.resolve(&action_name) {
            Err(e) => {
                info!(unit = %name, action = %action_name, error = %e, "action refused");
                let _ = reply.send(Err(e.into()));
            }
            Ok(Invocation::Custom { name: action, command }) => {
                info!(unit = %name, action = %action, command = %command, "running custom action");
                tokio::spawn(async move {
                    let result = action::run_custom(&dir, &action, &command)
                        .await
                        .map(Some)
                        .map_err(SupervisorHandleError::from);
                    let _ = reply.send(result);
                });
            }
            Ok(Invocation::Builtin(action)) => {
                info!(unit = %name, action = %action, "action requested");
                let result = self
                    .apply(&name, action)
                    .map(|()| None)
                    .map_err(SupervisorHandleError::from);
                let _ = reply.send(result);
            }
        }
    }

    fn apply(&mut self, name: &str, action: Action) -> Result<(), UnitError> {
        if action == Action::Start {
            return self.start_unit(name, true);
        }
        let Some(unit) = self.lookup_mut(name) else {
            return Ok(());
        };
        match action {
            Action::Start => {}
            Action::Stop => unit.stop(true),
            Action::Restart => unit.restart(true),
            Action::Kill => unit.kill(),
        }
        Ok(())
    }

    /// Starts a unit, first stopping any other live member of the
    /// multiplexed group.
    fn start_unit(&mut self, name: &str, intentional: bool) -> Result<(), UnitError> {
        let Some(&idx) = self.index.get(name) else {
            return Ok(());
        };
        let unit = &self.units[idx];
        if unit.state().is_running() {
            return Ok(());
        }

        if unit.is_multiplexed() {
            for (i, sibling) in self.units.iter_mut().enumerate() {
                if i != idx && sibling.is_multiplexed() && sibling.is_live() {
                    info!(unit = %sibling.name(), taking_over = %name, "stopping multiplexed sibling");
                    sibling.stop(true);
                }
            }
        }
        self.units[idx].start(intentional)
    }

    /// Flags timed-out units; the restarts run on a later loop turn.
    fn check_all_heartbeats(&mut self) {
        let now = Instant::now();
        for unit in &mut self.units {
            if unit.check_heartbeat(now) {
                let _ = self
                    .internal_tx
                    .send(SupervisedUnitMessage::HeartbeatExpired(unit.name().clone()));
            }
        }
    }

    fn begin_shutdown(&mut self) {
        if self.shutdown.is_some() {
            info!("shutdown already in progress");
            return;
        }
        info!("stopping all units");
        for unit in &mut self.units {
            unit.stop(true);
        }
        self.shutdown = Some(ShutdownProgress {
            polls: 0,
            interval: interval_at(
                Instant::now() + self.shutdown_poll_interval,
                self.shutdown_poll_interval,
            ),
        });
    }

    fn poll_shutdown(&mut self) -> Option<ShutdownReport> {
        let progress = self.shutdown.as_mut()?;
        progress.polls += 1;

        let remaining: Vec<UnitName> = self
            .units
            .iter()
            .filter(|unit| !unit.state().is_terminal())
            .map(|unit| unit.name().clone())
            .collect();

        if remaining.is_empty() {
            info!(polls = progress.polls, "all units stopped");
            return Some(ShutdownReport {
                outcome: ShutdownOutcome::Graceful,
                polls: progress.polls,
                remaining,
            });
        }
        if progress.polls >= self.shutdown_attempts {
            warn!(polls = progress.polls, ?remaining, "done waiting for units to stop");
            return Some(ShutdownReport {
                outcome: ShutdownOutcome::Forced,
                polls: progress.polls,
                remaining,
            });
        }
        debug!(polls = progress.polls, ?remaining, "waiting for units to stop");
        None
    }
}

async fn next_shutdown_poll(progress: &mut Option<ShutdownProgress>) {
    match progress {
        Some(progress) => {
            progress.interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn make_unit(root: &Path, name: &str) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(ENTRYPOINT), "#!/bin/sh\n").unwrap();
    }

    #[test]
    fn discovers_only_directories_with_entrypoint() {
        let root = tempfile::tempdir().unwrap();
        make_unit(root.path(), "b");
        make_unit(root.path(), "a");
        fs::create_dir(root.path().join("no-entrypoint")).unwrap();
        fs::write(root.path().join("stray-file"), "").unwrap();

        let dirs = discover(root.path(), None).unwrap();
        assert_eq!(dirs, [root.path().join("a"), root.path().join("b")]);
    }

    #[test]
    fn explicit_subset_is_intersected() {
        let root = tempfile::tempdir().unwrap();
        make_unit(root.path(), "a");
        make_unit(root.path(), "b");
        fs::create_dir(root.path().join("c")).unwrap();

        let only = ["b".to_string(), "c".to_string(), "missing".to_string(), "../a".to_string()];
        let dirs = discover(root.path(), Some(&only)).unwrap();
        assert_eq!(dirs, [root.path().join("b")]);
    }

    #[test]
    fn empty_or_missing_roots_fail() {
        let root = tempfile::tempdir().unwrap();
        assert!(matches!(
            discover(root.path(), None),
            Err(SupervisorError::NoRunnableUnits(_))
        ));
        assert!(matches!(
            discover(&root.path().join("nope"), None),
            Err(SupervisorError::RootNotFound(_))
        ));
    }
}

use std::{collections::HashMap, fs, io, path::PathBuf, time::Duration};

use tokio::sync::mpsc;
use tracing::{error, info};

use crate::{
    os_info::OsInfo,
    supervisor::{discover, Supervisor, SupervisorError},
    unit::{config::UnitConfig, ProcessUnit},
};

/// Builds a `Supervisor` for the units found under a root directory.
///
/// Discovery and `run.conf` parsing happen in [`SupervisorBuilder::build`].
pub struct SupervisorBuilder {
    root: PathBuf,
    only: Option<Vec<String>>,
    verbose: bool,
    os_info: Option<OsInfo>,
    health_check_interval: Duration,
    shutdown_poll_interval: Duration,
    shutdown_attempts: u32,
}

impl SupervisorBuilder {
    /// Creates a new builder with default configuration values.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            only: None,
            verbose: false,
            os_info: None,
            health_check_interval: Duration::from_secs(5),
            shutdown_poll_interval: Duration::from_secs(1),
            shutdown_attempts: 10,
        }
    }

    /// Restricts supervision to these unit names.
    pub fn with_units<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.only = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Echoes unit output to the console as well as to the run logs.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Uses these host facts instead of querying the OS.
    pub fn with_os_info(mut self, os_info: OsInfo) -> Self {
        self.os_info = Some(os_info);
        self
    }

    /// Sets the interval between heartbeat sweeps.
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Sets how often shutdown checks whether every unit has stopped.
    pub fn with_shutdown_poll_interval(mut self, interval: Duration) -> Self {
        self.shutdown_poll_interval = interval;
        self
    }

    /// Sets how many shutdown polls happen before giving up on stragglers.
    pub fn with_shutdown_attempts(mut self, attempts: u32) -> Self {
        self.shutdown_attempts = attempts.max(1);
        self
    }

    /// Discovers units and loads their settings.
    ///
    /// A unit with an unreadable or malformed `run.conf` is skipped. Fails if
    /// nothing runnable is left.
    pub fn build(self) -> Result<Supervisor, SupervisorError> {
        let root = fs::canonicalize(&self.root).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => SupervisorError::RootNotFound(self.root.clone()),
            _ => SupervisorError::Io {
                path: self.root.clone(),
                source,
            },
        })?;
        let dirs = discover(&root, self.only.as_deref())?;

        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (external_tx, external_rx) = mpsc::unbounded_channel();

        let mut units = Vec::with_capacity(dirs.len());
        for dir in dirs {
            let name = dir
                .strip_prefix(&root)
                .unwrap_or(&dir)
                .to_string_lossy()
                .into_owned();
            let config = match UnitConfig::load(&dir) {
                Ok(config) => config,
                Err(e) => {
                    error!(unit = %name, error = %e, "skipping unit");
                    continue;
                }
            };
            if config.is_customized() {
                info!(unit = %name, ?config, "run.conf loaded");
            }
            units.push(ProcessUnit::new(
                name,
                dir,
                config,
                self.verbose,
                internal_tx.clone(),
            ));
        }
        if units.is_empty() {
            return Err(SupervisorError::NoRunnableUnits(root));
        }

        let index: HashMap<_, _> = units
            .iter()
            .enumerate()
            .map(|(i, unit)| (unit.name().clone(), i))
            .collect();

        Ok(Supervisor {
            root,
            os: self.os_info.unwrap_or_else(OsInfo::detect),
            units,
            index,
            health_check_interval: self.health_check_interval,
            shutdown_poll_interval: self.shutdown_poll_interval,
            shutdown_attempts: self.shutdown_attempts,
            shutdown: None,
            internal_tx,
            internal_rx,
            external_tx,
            external_rx,
        })
    }
}

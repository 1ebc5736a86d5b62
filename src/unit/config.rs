use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use regex::Regex;
use serde::Deserialize;

/// Optional per-unit settings file, next to the entrypoint.
pub const RUN_CONF: &str = "run.conf";

pub const DEFAULT_CRASH_LIMIT: u32 = 4;
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid filter pattern {pattern:?}: {source}")]
    InvalidFilter {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("{field} must be a non-negative number of seconds, got {value}")]
    InvalidDuration { field: &'static str, value: f64 },
    #[error("crash_limit must be at least 1")]
    InvalidCrashLimit,
}

/// Raw shape of `run.conf`. Unknown keys are ignored.
#[derive(Debug, Default, Deserialize)]
struct RunConf {
    heartbeat_timeout: Option<f64>,
    autostart: Option<bool>,
    autorestart: Option<bool>,
    crash_limit: Option<u32>,
    restart_delay: Option<f64>,
    actions: Option<BTreeMap<String, String>>,
    filter: Option<String>,
    multiplexed: Option<bool>,
}

/// Settings of one unit, fixed for the supervisor's lifetime.
#[derive(Debug, Clone)]
pub struct UnitConfig {
    pub heartbeat_timeout: Option<Duration>,
    pub autostart: bool,
    pub autorestart: bool,
    pub crash_limit: u32,
    pub restart_delay: Duration,
    pub custom_actions: BTreeMap<String, String>,
    pub output_filter: Option<Regex>,
    pub multiplexed: bool,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: None,
            autostart: true,
            autorestart: true,
            crash_limit: DEFAULT_CRASH_LIMIT,
            restart_delay: DEFAULT_RESTART_DELAY,
            custom_actions: BTreeMap::new(),
            output_filter: None,
            multiplexed: false,
        }
    }
}

impl UnitConfig {
    /// Loads `<dir>/run.conf`, falling back to defaults when it is absent.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(RUN_CONF);
        match fs::read_to_string(&path) {
            Ok(text) => Self::parse(&text, &path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Read { path, source }),
        }
    }

    fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let blank = text.lines().all(|line| {
            let line = line.trim();
            line.is_empty() || line.starts_with('#')
        });
        if blank {
            return Ok(Self::default());
        }
        let raw: Option<RunConf> =
            serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::try_from(raw.unwrap_or_default())
    }

    /// Whether any setting differs from the defaults.
    pub fn is_customized(&self) -> bool {
        self.heartbeat_timeout.is_some()
            || !self.autostart
            || !self.autorestart
            || self.crash_limit != DEFAULT_CRASH_LIMIT
            || self.restart_delay != DEFAULT_RESTART_DELAY
            || !self.custom_actions.is_empty()
            || self.output_filter.is_some()
            || self.multiplexed
    }
}

impl TryFrom<RunConf> for UnitConfig {
    type Error = ConfigError;

    fn try_from(raw: RunConf) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let output_filter = raw
            .filter
            .map(|pattern| {
                Regex::new(&pattern).map_err(|source| ConfigError::InvalidFilter { pattern, source })
            })
            .transpose()?;
        let crash_limit = raw.crash_limit.unwrap_or(defaults.crash_limit);
        if crash_limit == 0 {
            return Err(ConfigError::InvalidCrashLimit);
        }

        Ok(Self {
            heartbeat_timeout: raw
                .heartbeat_timeout
                .map(|secs| seconds("heartbeat_timeout", secs))
                .transpose()?,
            autostart: raw.autostart.unwrap_or(defaults.autostart),
            autorestart: raw.autorestart.unwrap_or(defaults.autorestart),
            crash_limit,
            restart_delay: raw
                .restart_delay
                .map(|secs| seconds("restart_delay", secs))
                .transpose()?
                .unwrap_or(defaults.restart_delay),
            custom_actions: raw.actions.unwrap_or_default(),
            output_filter,
            multiplexed: raw.multiplexed.unwrap_or(defaults.multiplexed),
        })
    }
}

fn seconds(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::InvalidDuration { field, value })
}

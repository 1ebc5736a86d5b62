//! Host facts looked up once at startup and handed to whoever needs them.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Linux,
    MacOs,
    OtherUnix,
}

impl OsFamily {
    fn current() -> Self {
        match std::env::consts::OS {
            "linux" => Self::Linux,
            "macos" => Self::MacOs,
            _ => Self::OtherUnix,
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linux => write!(f, "linux"),
            Self::MacOs => write!(f, "macos"),
            Self::OtherUnix => write!(f, "unix"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsInfo {
    pub hostname: String,
    pub family: OsFamily,
}

impl OsInfo {
    pub fn new(hostname: impl Into<String>, family: OsFamily) -> Self {
        Self {
            hostname: hostname.into(),
            family,
        }
    }

    /// Queries the host. Falls back to `localhost` if the hostname is unavailable.
    pub fn detect() -> Self {
        let hostname = nix::unistd::gethostname()
            .ok()
            .and_then(|name| name.into_string().ok())
            .map(|name| name.trim().to_owned())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "localhost".to_owned());
        Self::new(hostname, OsFamily::current())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_finds_a_hostname() {
        let info = OsInfo::detect();
        assert!(!info.hostname.is_empty());
        assert!(!info.hostname.ends_with('\n'));
    }
}

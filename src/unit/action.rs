use std::{fmt, io, path::Path, str::FromStr};

use tokio::process::Command;

use super::UnitState;

/// Built-in control actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Start,
    Stop,
    Restart,
    Kill,
}

impl Action {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Kill => "kill!",
        }
    }

    /// Built-in actions a user may invoke in `state`.
    pub const fn allowed_in(state: UnitState) -> &'static [Action] {
        match state {
            UnitState::Running => &[Self::Restart, Self::Stop],
            UnitState::Stopped | UnitState::Crashed => &[Self::Start],
            UnitState::Restarting => &[Self::Stop],
            UnitState::Waiting => &[Self::Kill],
        }
    }

    pub fn is_allowed_in(self, state: UnitState) -> bool {
        Self::allowed_in(state).contains(&self)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Action {
    type Err = ActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "restart" => Ok(Self::Restart),
            "kill!" | "kill" => Ok(Self::Kill),
            other => Err(ActionError::Unknown(other.to_owned())),
        }
    }
}

/// What an action name resolves to for a given unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Builtin(Action),
    Custom { name: String, command: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("action {action} is not available while {state}")]
    Rejected { action: Action, state: UnitState },
    #[error("unknown action {0:?}")]
    Unknown(String),
    #[error("custom action {action:?} failed to run: {source}")]
    CustomFailed {
        action: String,
        #[source]
        source: io::Error,
    },
    #[error("supervisor is shutting down")]
    ShuttingDown,
}

/// Runs a custom action through the shell in the unit directory and
/// returns what it printed.
pub async fn run_custom(dir: &Path, name: &str, command: &str) -> Result<String, ActionError> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(dir)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| ActionError::CustomFailed {
            action: name.to_owned(),
            source,
        })?;

    let mut text = format!("Executing: {command:?}\n");
    text.push_str(&String::from_utf8_lossy(&output.stdout));
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_table() {
        assert_eq!(
            Action::allowed_in(UnitState::Running),
            [Action::Restart, Action::Stop]
        );
        assert_eq!(Action::allowed_in(UnitState::Stopped), [Action::Start]);
        assert_eq!(Action::allowed_in(UnitState::Crashed), [Action::Start]);
        assert_eq!(Action::allowed_in(UnitState::Restarting), [Action::Stop]);
        assert_eq!(Action::allowed_in(UnitState::Waiting), [Action::Kill]);

        assert!(!Action::Start.is_allowed_in(UnitState::Running));
        assert!(!Action::Kill.is_allowed_in(UnitState::Running));
    }

    #[test]
    fn names_round_trip() {
        for action in [Action::Start, Action::Stop, Action::Restart, Action::Kill] {
            assert_eq!(action.name().parse::<Action>().unwrap(), action);
        }
        assert_eq!("kill".parse::<Action>().unwrap(), Action::Kill);
        assert!(matches!(
            "explode".parse::<Action>(),
            Err(ActionError::Unknown(name)) if name == "explode"
        ));
    }

    #[tokio::test]
    async fn custom_action_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "").unwrap();

        let out = run_custom(dir.path(), "list", "ls; echo oops >&2").await.unwrap();
        assert!(out.starts_with("Executing: \"ls; echo oops >&2\"\n"));
        assert!(out.contains("marker"));
        assert!(out.contains("oops"));
    }
}

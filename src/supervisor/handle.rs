use tokio::sync::{mpsc, oneshot, watch};

use crate::{
    log_store::{LogError, LogQuery, LogStore, RunFile},
    supervisor::ShutdownReport,
    unit::{action::ActionError, UnitError, UnitStatus},
    UnitName,
};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorHandleError {
    #[error("supervisor is no longer accepting messages")]
    SendError,
    #[error("supervisor dropped the reply: {0}")]
    RecvError(#[from] oneshot::error::RecvError),
    #[error("supervisor stopped without a shutdown report")]
    Terminated,
    #[error("no unit named {0:?}")]
    UnitNotFound(UnitName),
    #[error(transparent)]
    Action(#[from] ActionError),
    #[error(transparent)]
    Unit(#[from] UnitError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error("log reader failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Requests from a `SupervisorHandle` to the supervisor loop.
#[derive(Debug)]
pub(crate) enum SupervisorMessage {
    UnitNames(oneshot::Sender<Vec<UnitName>>),
    Status(UnitName, oneshot::Sender<Option<UnitStatus>>),
    Statuses(oneshot::Sender<Vec<UnitStatus>>),
    Logs(UnitName, oneshot::Sender<Option<LogStore>>),
    Invoke {
        unit: UnitName,
        action: String,
        reply: oneshot::Sender<Result<Option<String>, SupervisorHandleError>>,
    },
    Shutdown,
}

/// Control plane of a running supervisor.
///
/// Cheap to clone; every clone talks to the same supervisor loop. This is
/// what a dashboard, a status broadcaster or a CLI is built on.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<SupervisorMessage>,
    done: watch::Receiver<Option<ShutdownReport>>,
    hostname: String,
}

impl SupervisorHandle {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<SupervisorMessage>,
        done: watch::Receiver<Option<ShutdownReport>>,
        hostname: String,
    ) -> Self {
        Self { tx, done, hostname }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    async fn request<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<T>) -> SupervisorMessage,
    ) -> Result<T, SupervisorHandleError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(message(reply_tx))
            .map_err(|_| SupervisorHandleError::SendError)?;
        Ok(reply_rx.await?)
    }

    /// Names of all units, in discovery order.
    pub async fn unit_names(&self) -> Result<Vec<UnitName>, SupervisorHandleError> {
        self.request(SupervisorMessage::UnitNames).await
    }

    pub async fn status(&self, unit: &str) -> Result<UnitStatus, SupervisorHandleError> {
        self.request(|reply| SupervisorMessage::Status(unit.to_owned(), reply))
            .await?
            .ok_or_else(|| SupervisorHandleError::UnitNotFound(unit.to_owned()))
    }

    pub async fn statuses(&self) -> Result<Vec<UnitStatus>, SupervisorHandleError> {
        self.request(SupervisorMessage::Statuses).await
    }

    /// `(hostname, unit, state)` for every unit, as published by a status
    /// broadcaster.
    pub async fn status_tuples(
        &self,
    ) -> Result<Vec<(String, UnitName, String)>, SupervisorHandleError> {
        Ok(self
            .statuses()
            .await?
            .into_iter()
            .map(|status| (self.hostname.clone(), status.name, status.state.to_string()))
            .collect())
    }

    /// Runs a built-in or custom action. Custom actions return their output.
    pub async fn invoke(
        &self,
        unit: &str,
        action: &str,
    ) -> Result<Option<String>, SupervisorHandleError> {
        self.request(|reply| SupervisorMessage::Invoke {
            unit: unit.to_owned(),
            action: action.to_owned(),
            reply,
        })
        .await?
    }

    async fn logs(&self, unit: &str) -> Result<LogStore, SupervisorHandleError> {
        self.request(|reply| SupervisorMessage::Logs(unit.to_owned(), reply))
            .await?
            .ok_or_else(|| SupervisorHandleError::UnitNotFound(unit.to_owned()))
    }

    /// Reads run log lines. File I/O happens off the supervisor loop.
    pub async fn tail(
        &self,
        unit: &str,
        query: LogQuery,
    ) -> Result<Vec<String>, SupervisorHandleError> {
        let logs = self.logs(unit).await?;
        Ok(tokio::task::spawn_blocking(move || logs.tail(&query)).await??)
    }

    /// Historical run logs of a unit, most recent first.
    pub async fn list_runs(&self, unit: &str) -> Result<Vec<RunFile>, SupervisorHandleError> {
        let logs = self.logs(unit).await?;
        Ok(tokio::task::spawn_blocking(move || logs.list_runs()).await??)
    }

    /// Starts the shutdown sequence. Repeated calls are harmless.
    pub fn shutdown(&self) -> Result<(), SupervisorHandleError> {
        self.tx
            .send(SupervisorMessage::Shutdown)
            .map_err(|_| SupervisorHandleError::SendError)
    }

    /// Waits until the supervisor loop has finished shutting down.
    pub async fn wait(&self) -> Result<ShutdownReport, SupervisorHandleError> {
        let mut done = self.done.clone();
        let report = done
            .wait_for(Option::is_some)
            .await
            .map_err(|_| SupervisorHandleError::Terminated)?;
        (*report).clone().ok_or(SupervisorHandleError::Terminated)
    }
}

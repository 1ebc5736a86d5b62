//! Process-wide termination signals.
//!
//! SIGHUP, SIGINT, SIGQUIT and SIGTERM all mean "shut down". Listeners are
//! installed once and can be awaited repeatedly, so a second signal is seen
//! as a second request rather than killing the process outright.

use std::io;

use tokio::signal::unix::{signal, Signal, SignalKind};

pub struct ShutdownSignals {
    hangup: Signal,
    interrupt: Signal,
    quit: Signal,
    terminate: Signal,
}

impl ShutdownSignals {
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            hangup: signal(SignalKind::hangup())?,
            interrupt: signal(SignalKind::interrupt())?,
            quit: signal(SignalKind::quit())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Waits for the next termination signal and returns its name.
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.hangup.recv() => "SIGHUP",
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.quit.recv() => "SIGQUIT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use nix::sys::signal::{raise, Signal as NixSignal};

    use super::*;

    #[tokio::test]
    async fn hangup_is_a_shutdown_request() {
        let mut signals = ShutdownSignals::install().unwrap();
        raise(NixSignal::SIGHUP).unwrap();
        let name = tokio::time::timeout(Duration::from_secs(5), signals.recv())
            .await
            .unwrap();
        assert_eq!(name, "SIGHUP");
    }
}

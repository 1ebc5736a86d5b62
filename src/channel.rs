use std::{
    fmt, io,
    os::unix::process::ExitStatusExt,
    path::Path,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use bytes::BytesMut;
use futures::{stream, StreamExt};
use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tokio::{process::Command, sync::mpsc, time};
use tokio_util::codec::{Decoder, FramedRead};
use tracing::debug;

use crate::UnitName;

/// The executable every unit directory must contain.
pub const ENTRYPOINT: &str = "run";

/// Lines longer than this are split rather than buffered without bound.
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// How long output is still collected, in total, once the process has exited.
const EXIT_DRAIN: Duration = Duration::from_millis(100);

/// How a process ended, as far as the OS told us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "killed by signal {signal}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Something that happened to a unit's process, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Started { pid: u32 },
    Line(String),
    Exited(ExitInfo),
}

impl ChannelEvent {
    /// Hands the event to the matching callback of its owner.
    pub fn dispatch<T: ChannelEvents + ?Sized>(self, owner: &mut T) {
        match self {
            Self::Started { pid } => owner.on_start(pid),
            Self::Line(line) => owner.on_line(line),
            Self::Exited(exit) => owner.on_exit(exit),
        }
    }
}

/// Callbacks implemented by whoever owns a [`ProcessChannel`].
pub trait ChannelEvents {
    fn on_start(&mut self, pid: u32);
    fn on_line(&mut self, line: String);
    fn on_exit(&mut self, exit: ExitInfo);
}

/// An event tagged with the unit and run it belongs to.
///
/// `run` lets the receiver drop events from a process it has already
/// written off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub unit: UnitName,
    pub run: u64,
    pub event: ChannelEvent,
}

/// Splits a byte stream into lines.
///
/// `\n` and `\r\n` terminate a line, invalid UTF-8 is replaced, and an
/// unterminated tail is emitted as a final line when the stream closes.
#[derive(Debug, Default)]
pub struct OutputLineCodec {
    scanned: usize,
}

impl OutputLineCodec {
    fn take_line(&mut self, buf: &mut BytesMut, len: usize) -> String {
        self.scanned = 0;
        let raw = buf.split_to(len);
        let mut line = raw.as_ref();
        if let Some(stripped) = line.strip_suffix(b"\n") {
            line = stripped;
        }
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }
        String::from_utf8_lossy(line).into_owned()
    }
}

impl Decoder for OutputLineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        match buf[self.scanned..].iter().position(|b| *b == b'\n') {
            Some(offset) => {
                let len = self.scanned + offset + 1;
                Ok(Some(self.take_line(buf, len)))
            }
            None if buf.len() >= MAX_LINE_LENGTH => Ok(Some(self.take_line(buf, MAX_LINE_LENGTH))),
            None => {
                self.scanned = buf.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        let len = buf.len();
        Ok(Some(self.take_line(buf, len)))
    }
}

/// One live OS process belonging to one unit.
///
/// A background task forwards `Started`, every output line (stdout and
/// stderr merged), then exactly one `Exited` to the sender given at spawn.
#[derive(Debug)]
pub struct ProcessChannel {
    run: u64,
    pid: u32,
    signalled: bool,
}

impl ProcessChannel {
    /// Launches `<dir>/run` with `dir` as its working directory.
    pub fn spawn<M>(
        unit: &UnitName,
        dir: &Path,
        run: u64,
        tx: mpsc::UnboundedSender<M>,
    ) -> io::Result<Self>
    where
        M: From<ChannelMessage> + Send + 'static,
    {
        let mut child = Command::new(dir.join(ENTRYPOINT))
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let (Some(pid), Some(stdout), Some(stderr)) =
            (child.id(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.start_kill();
            return Err(io::Error::other("child process pipes unavailable"));
        };

        let unit = unit.clone();
        tokio::spawn(async move {
            let send = |event: ChannelEvent| {
                tx.send(M::from(ChannelMessage {
                    unit: unit.clone(),
                    run,
                    event,
                }))
                .is_ok()
            };

            send(ChannelEvent::Started { pid });

            let mut lines = stream::select(
                FramedRead::new(stdout, OutputLineCodec::default()),
                FramedRead::new(stderr, OutputLineCodec::default()),
            );
            let forward = |line: io::Result<String>| match line {
                Ok(line) => {
                    send(ChannelEvent::Line(line));
                }
                Err(e) => debug!(unit = %unit, error = %e, "output stream error"),
            };

            let status = loop {
                tokio::select! {
                    Some(line) = lines.next() => forward(line),
                    status = child.wait() => break status,
                }
            };
            // Descendants can hold the pipes open after the process itself is gone.
            let deadline = time::Instant::now() + EXIT_DRAIN;
            while let Ok(Some(line)) = time::timeout_at(deadline, lines.next()).await {
                forward(line);
            }

            let exit = match status {
                Ok(status) => ExitInfo::from(status),
                Err(e) => {
                    debug!(unit = %unit, error = %e, "failed to collect exit status");
                    ExitInfo::default()
                }
            };
            send(ChannelEvent::Exited(exit));
        });

        Ok(Self {
            run,
            pid,
            signalled: false,
        })
    }

    pub fn run(&self) -> u64 {
        self.run
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether a termination signal has already been sent.
    pub fn is_signalled(&self) -> bool {
        self.signalled
    }

    /// Asks the process to stop (SIGTERM).
    pub fn terminate(&mut self) -> nix::Result<()> {
        self.send_signal(Signal::SIGTERM)
    }

    /// Forces the process to stop (SIGKILL).
    pub fn kill(&mut self) -> nix::Result<()> {
        self.send_signal(Signal::SIGKILL)
    }

    fn send_signal(&mut self, sig: Signal) -> nix::Result<()> {
        self.signalled = true;
        let pid = i32::try_from(self.pid).map_err(|_| Errno::ESRCH)?;
        signal::kill(Pid::from_raw(pid), sig)
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, os::unix::fs::PermissionsExt, time::Duration};

    use super::*;

    fn decode_all(chunks: &[&[u8]]) -> Vec<String> {
        let mut codec = OutputLineCodec::default();
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        for chunk in chunks {
            buf.extend_from_slice(chunk);
            while let Some(line) = codec.decode(&mut buf).unwrap() {
                out.push(line);
            }
        }
        while let Some(line) = codec.decode_eof(&mut buf).unwrap() {
            out.push(line);
        }
        out
    }

    #[test]
    fn several_lines_in_one_read() {
        assert_eq!(decode_all(&[b"a\nb\r\nc\n"]), ["a", "b", "c"]);
    }

    #[test]
    fn line_split_across_reads() {
        assert_eq!(decode_all(&[b"hel", b"", b"lo wo", b"rld\nnext\n"]), ["hello world", "next"]);
    }

    #[test]
    fn unterminated_tail_is_flushed_at_eof() {
        assert_eq!(decode_all(&[b"done\npartial"]), ["done", "partial"]);
        assert!(decode_all(&[b""]).is_empty());
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        assert_eq!(decode_all(&[b"ok \xff\n"]), ["ok \u{fffd}"]);
    }

    #[test]
    fn overlong_lines_are_split() {
        let long = vec![b'x'; MAX_LINE_LENGTH + 10];
        let lines = decode_all(&[&long]);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), MAX_LINE_LENGTH);
        assert_eq!(lines[1].len(), 10);
    }

    #[tokio::test]
    async fn events_arrive_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join(ENTRYPOINT);
        fs::write(&script, "#!/bin/sh\necho one\necho two\nprintf three\nexit 3\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel::<ChannelMessage>();
        let channel = ProcessChannel::spawn(&"echo".to_string(), dir.path(), 7, tx).unwrap();
        assert!(channel.pid() > 0);

        let mut events = Vec::new();
        while let Ok(Some(msg)) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            assert_eq!(msg.run, 7);
            assert_eq!(msg.unit, "echo");
            let done = matches!(msg.event, ChannelEvent::Exited(_));
            events.push(msg.event);
            if done {
                break;
            }
        }

        assert_eq!(
            events,
            [
                ChannelEvent::Started { pid: channel.pid() },
                ChannelEvent::Line("one".into()),
                ChannelEvent::Line("two".into()),
                ChannelEvent::Line("three".into()),
                ChannelEvent::Exited(ExitInfo {
                    code: Some(3),
                    signal: None
                }),
            ]
        );
    }

    #[tokio::test]
    async fn missing_entrypoint_fails_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel::<ChannelMessage>();
        assert!(ProcessChannel::spawn(&"ghost".to_string(), dir.path(), 1, tx).is_err());
    }
}

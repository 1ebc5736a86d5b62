//! Per-run output logs for a unit.
//!
//! Every run of a unit gets its own timestamp-named file under
//! `<unit dir>/logs/`. A `current.log` symlink in the unit directory always
//! points at the most recent run.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    time::SystemTime,
};

use chrono::Local;

use crate::UnitName;

/// Subdirectory of a unit directory holding run logs.
pub const LOG_DIR: &str = "logs";
/// Name of the pointer to the most recent run log.
pub const CURRENT_LOG: &str = "current.log";
/// Lines returned by a [`LogQuery`] unless told otherwise.
pub const DEFAULT_TAIL_LINES: usize = 200;

const LINE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %I:%M:%S%p";
const FILE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S%.3f";
const TAIL_BLOCK: u64 = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("log file not found: {0}")]
    NotFound(PathBuf),
    #[error("invalid log file name: {0:?}")]
    InvalidName(String),
    #[error("unit {0:?} has no current run log")]
    NoCurrentRun(UnitName),
    #[error("log I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LogError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Timestamp prefix used for every line written to a run log.
pub fn timestamp() -> String {
    Local::now().format(LINE_TIMESTAMP_FORMAT).to_string()
}

/// Which part of which run log to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    /// Bare file name inside `logs/`; `None` reads the current run.
    pub file: Option<String>,
    pub direction: TailDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailDirection {
    /// The last `n` lines, in file order.
    Backward(usize),
    /// The first `n` lines.
    Forward(usize),
}

impl LogQuery {
    pub fn current() -> Self {
        Self::default()
    }

    pub fn run(file: impl Into<String>) -> Self {
        Self {
            file: Some(file.into()),
            ..Self::default()
        }
    }

    pub fn backward(mut self, lines: usize) -> Self {
        self.direction = TailDirection::Backward(lines);
        self
    }

    pub fn forward(mut self, lines: usize) -> Self {
        self.direction = TailDirection::Forward(lines);
        self
    }
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            file: None,
            direction: TailDirection::Backward(DEFAULT_TAIL_LINES),
        }
    }
}

/// A historical run log as listed by [`LogStore::list_runs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFile {
    pub name: String,
    pub path: PathBuf,
    pub modified: SystemTime,
    pub len: u64,
}

/// Locates and reads the run logs of one unit.
///
/// Cheap to clone: it only holds paths, so readers can take a copy off the
/// supervisor loop and do their file I/O elsewhere.
#[derive(Debug, Clone)]
pub struct LogStore {
    unit: UnitName,
    unit_dir: PathBuf,
}

impl LogStore {
    pub fn new(unit: impl Into<UnitName>, unit_dir: impl Into<PathBuf>) -> Self {
        Self {
            unit: unit.into(),
            unit_dir: unit_dir.into(),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.unit_dir.join(LOG_DIR)
    }

    pub fn current_pointer(&self) -> PathBuf {
        self.unit_dir.join(CURRENT_LOG)
    }

    /// Creates the log file for a new run and repoints `current.log` at it.
    pub fn open_run(&self) -> Result<RunLog, LogError> {
        let dir = self.log_dir();
        fs::create_dir_all(&dir).map_err(|e| LogError::io(&dir, e))?;

        let file_name = format!(
            "{}-{}.log",
            self.unit,
            Local::now().format(FILE_TIMESTAMP_FORMAT)
        );
        let path = dir.join(&file_name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| LogError::io(&path, e))?;

        self.repoint_current(&file_name)?;
        Ok(RunLog { path, file })
    }

    /// Swaps the `current.log` symlink in one rename so readers never see it missing.
    fn repoint_current(&self, file_name: &str) -> Result<(), LogError> {
        let pointer = self.current_pointer();
        let staging = self.unit_dir.join(format!(".{CURRENT_LOG}.tmp"));
        let target = Path::new(LOG_DIR).join(file_name);

        match fs::remove_file(&staging) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(LogError::io(&staging, e)),
        }
        std::os::unix::fs::symlink(&target, &staging).map_err(|e| LogError::io(&staging, e))?;
        fs::rename(&staging, &pointer).map_err(|e| LogError::io(&pointer, e))
    }

    /// Reads lines from the current run or a named historical run.
    pub fn tail(&self, query: &LogQuery) -> Result<Vec<String>, LogError> {
        let path = match &query.file {
            Some(name) => self.resolve_run(name)?,
            None => self.current_pointer(),
        };

        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(match query.file {
                    Some(_) => LogError::NotFound(path),
                    None => LogError::NoCurrentRun(self.unit.clone()),
                });
            }
            Err(e) => return Err(LogError::io(&path, e)),
        };

        match query.direction {
            TailDirection::Forward(n) => BufReader::new(file)
                .split(b'\n')
                .take(n)
                .map(|line| line.map(|line| decode_line(&line)))
                .collect::<io::Result<_>>()
                .map_err(|e| LogError::io(&path, e)),
            TailDirection::Backward(0) => Ok(Vec::new()),
            TailDirection::Backward(n) => {
                let bytes = read_tail(&mut file, n).map_err(|e| LogError::io(&path, e))?;
                if bytes.is_empty() {
                    return Ok(Vec::new());
                }
                let mut lines: Vec<String> = bytes
                    .split(|b| *b == b'\n')
                    .map(decode_line)
                    .collect();
                // A trailing newline leaves an empty piece behind.
                if bytes.ends_with(b"\n") {
                    lines.pop();
                }
                Ok(lines.split_off(lines.len().saturating_sub(n)))
            }
        }
    }

    /// Lists run logs, most recent first.
    pub fn list_runs(&self) -> Result<Vec<RunFile>, LogError> {
        let dir = self.log_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(LogError::io(&dir, e)),
        };

        let mut runs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| LogError::io(&dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("log") {
                continue;
            }
            let meta = entry.metadata().map_err(|e| LogError::io(&path, e))?;
            if !meta.is_file() {
                continue;
            }
            runs.push(RunFile {
                name: entry.file_name().to_string_lossy().into_owned(),
                modified: meta.modified().map_err(|e| LogError::io(&path, e))?,
                len: meta.len(),
                path,
            });
        }
        runs.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.name.cmp(&a.name)));
        Ok(runs)
    }

    fn resolve_run(&self, name: &str) -> Result<PathBuf, LogError> {
        let bare = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains('/')
            && !name.contains('\\');
        if !bare {
            return Err(LogError::InvalidName(name.to_owned()));
        }
        Ok(self.log_dir().join(name))
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Reads blocks backwards from the end of `file` until the last `lines`
/// lines are covered, so large logs are never loaded whole.
fn read_tail(file: &mut File, lines: usize) -> io::Result<Vec<u8>> {
    let mut pos = file.metadata()?.len();
    let mut tail = Vec::new();
    let mut newlines = 0;

    while pos > 0 && newlines <= lines {
        let step = TAIL_BLOCK.min(pos);
        pos -= step;
        file.seek(SeekFrom::Start(pos))?;
        let mut block = vec![0; step as usize];
        file.read_exact(&mut block)?;
        newlines += block.iter().filter(|b| **b == b'\n').count();
        block.extend_from_slice(&tail);
        tail = block;
    }

    // The first piece is partial unless the whole file was read.
    if pos > 0 {
        if let Some(first) = tail.iter().position(|b| *b == b'\n') {
            tail.drain(..=first);
        }
    }
    Ok(tail)
}

/// Writable log of a single run. Each line is flushed as soon as it is written.
#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    file: File,
}

impl RunLog {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, line: &str) -> Result<(), LogError> {
        writeln!(self.file, "[{}] {}", timestamp(), line.trim_end_matches(['\r', '\n']))
            .and_then(|()| self.file.flush())
            .map_err(|e| LogError::io(&self.path, e))
    }
}

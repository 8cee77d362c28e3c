//! Append-only, line-flushed log sinks for traffic tool output.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;

/// Written as the last line of every log of a phase that was cancelled.
pub const INTERRUPTED_MARKER: &str = "Process Interrupted by User.";

#[derive(Debug)]
enum Target {
    File { path: PathBuf, file: File },
    Discard,
}

/// A log file, or a sink that drops everything when logging is disabled.
///
/// Closing consumes the sink, so each one is closed at most once; dropping
/// an unclosed sink still releases the file.
#[derive(Debug)]
pub struct LogSink {
    target: Target,
}

impl LogSink {
    /// Create (or truncate) the log file at `path`.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            target: Target::File {
                path: path.to_path_buf(),
                file,
            },
        })
    }

    pub fn discard() -> Self {
        Self {
            target: Target::Discard,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.target {
            Target::File { path, .. } => Some(path),
            Target::Discard => None,
        }
    }

    /// Write one line and flush it, so it lands before anything a child
    /// process writes to the same file afterwards.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        match &mut self.target {
            Target::File { file, .. } => {
                writeln!(file, "{}", line)?;
                file.flush()
            }
            Target::Discard => Ok(()),
        }
    }

    /// Banner naming the exact command whose output follows.
    pub fn write_header(&mut self, command: &str) -> io::Result<()> {
        self.write_line(&format!(
            "\n-----------Executing command - {}--------------\n",
            command
        ))
    }

    /// A handle a child process can write its stdout or stderr into.
    pub fn stdio(&self) -> io::Result<Stdio> {
        match &self.target {
            Target::File { file, .. } => Ok(Stdio::from(file.try_clone()?)),
            Target::Discard => Ok(Stdio::null()),
        }
    }

    pub fn close(self) -> io::Result<()> {
        match self.target {
            Target::File { file, .. } => file.sync_all(),
            Target::Discard => Ok(()),
        }
    }
}

//! On-disk log layout for a run.
//!
//! ```text
//! <log_dir>/LoadTestLogs_<stamp>/<device>_<stamp>/<prefix><device>_Phase<N>_<dl|ul>_<client|server>.log
//! ```

pub mod sink;

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::debug;

pub use sink::{LogSink, INTERRUPTED_MARKER};

pub const RUN_DIR_PREFIX: &str = "LoadTestLogs_";

/// `dd-mm-YYYY_HHMMSS`
pub fn timestamp(now: &DateTime<Local>) -> String {
    now.format("%d-%m-%Y_%H%M%S").to_string()
}

/// The run directory of one test run.
#[derive(Debug, Clone)]
pub struct LogLayout {
    run_dir: PathBuf,
}

impl LogLayout {
    /// Create `<base>/LoadTestLogs_<stamp>`, creating `base` if needed.
    ///
    /// Two runs started within the same second get a numeric suffix rather
    /// than sharing a directory.
    pub fn create(base: &Path, now: &DateTime<Local>) -> io::Result<Self> {
        std::fs::create_dir_all(base)?;
        let stem = format!("{}{}", RUN_DIR_PREFIX, timestamp(now));
        let run_dir = create_unique_dir(base, &stem)?;
        debug!(path = %run_dir.display(), "created run log directory");
        Ok(Self { run_dir })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Create the directory holding one device's logs.
    pub fn device_dir(&self, device: &str, now: &DateTime<Local>) -> io::Result<PathBuf> {
        let stem = format!("{}_{}", sanitize(device), timestamp(now));
        create_unique_dir(&self.run_dir, &stem)
    }
}

fn create_unique_dir(parent: &Path, stem: &str) -> io::Result<PathBuf> {
    let mut candidate = parent.join(stem);
    let mut attempt = 1;
    loop {
        match std::fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempt < 100 => {
                candidate = parent.join(format!("{}_{}", stem, attempt));
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Adapter names can contain characters that are not valid in a single
/// path component.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect()
}

//! Local traffic tool processes.
//!
//! [`TokioLauncher`] spawns the command with stdout and stderr pointed at
//! the phase's log sink. Children are killed on drop, so a handle that is
//! never explicitly stopped still does not outlive its phase.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::storage::LogSink;

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("empty command line")]
    Empty,

    #[error("failed to attach log for '{command}': {source}")]
    Redirect {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// A running local process owned by a phase.
#[async_trait]
pub trait LocalProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Whether the process has already exited on its own.
    fn has_exited(&mut self) -> bool;

    /// SIGKILL and reap.
    async fn kill(&mut self);

    /// SIGTERM, then SIGKILL if still alive after `grace`.
    async fn terminate(&mut self, grace: Duration);
}

/// Starts local processes.
pub trait ProcessLauncher: Send + Sync {
    fn spawn(&self, command: &str, sink: &LogSink) -> Result<Box<dyn LocalProcess>, SpawnError>;
}

/// Production launcher backed by `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioLauncher;

impl ProcessLauncher for TokioLauncher {
    fn spawn(&self, command: &str, sink: &LogSink) -> Result<Box<dyn LocalProcess>, SpawnError> {
        let mut parts = command.split_whitespace();
        let program = parts.next().ok_or(SpawnError::Empty)?;

        let redirect = |source| SpawnError::Redirect {
            command: command.to_string(),
            source,
        };
        let stdout = sink.stdio().map_err(redirect)?;
        let stderr = sink.stdio().map_err(redirect)?;

        let child = Command::new(program)
            .args(parts)
            .stdin(std::process::Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SpawnError::Spawn {
                command: command.to_string(),
                source,
            })?;

        debug!(pid = child.id(), %command, "spawned local process");

        Ok(Box::new(TokioProcess {
            child,
            command: command.to_string(),
        }))
    }
}

struct TokioProcess {
    child: Child,
    command: String,
}

#[async_trait]
impl LocalProcess for TokioProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn has_exited(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                warn!(command = %self.command, error = %e, "failed to poll local process");
                false
            }
        }
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(command = %self.command, error = %e, "failed to kill local process");
        }
    }

    async fn terminate(&mut self, grace: Duration) {
        terminate_child(&mut self.child, grace).await;
    }
}

/// Gracefully terminate a child process.
///
/// Sends SIGTERM first, waits up to `grace`, then sends SIGKILL if the
/// process is still running.
async fn terminate_child(child: &mut Child, grace: Duration) {
    // Try SIGTERM first (Unix only).
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: plain kill(2) on a pid we spawned and have not reaped yet.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(exit_code = status.code(), "child exited after SIGTERM");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "error waiting for child after SIGTERM");
        }
        Err(_) => {
            warn!("child did not exit after SIGTERM, sending SIGKILL");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to SIGKILL child");
            }
        }
    }
}

//! Remote command execution on the peer host of each device.
//!
//! A [`RemoteSession`] is opened per phase and never shared between phases,
//! so commands from different phases cannot interleave on one connection.

pub mod ssh;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::RemoteEndpoint;

pub use ssh::OpenSshConnector;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("failed to connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("failed to run '{command}' on {host}: {reason}")]
    Exec {
        host: String,
        command: String,
        reason: String,
    },

    #[error("'{command}' on {host} did not finish within {}s", .timeout.as_secs())]
    Timeout {
        host: String,
        command: String,
        timeout: Duration,
    },
}

/// Opens sessions to remote endpoints.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &RemoteEndpoint,
    ) -> Result<Box<dyn RemoteSession>, RemoteError>;
}

/// An open session on one remote host.
#[async_trait]
pub trait RemoteSession: Send {
    fn host(&self) -> &str;

    /// Start `command` and return a handle on its captured output. The
    /// command keeps running until it exits or the session closes.
    async fn exec(&mut self, command: &str) -> Result<RemoteCommand, RemoteError>;

    /// Run `command` to completion, waiting at most `timeout`.
    async fn run(&mut self, command: &str, timeout: Duration) -> Result<(), RemoteError>;

    /// Tear the session down. Anything still running under it is stopped.
    async fn close(&mut self);
}

/// Captured output of a command started with [`RemoteSession::exec`].
///
/// Lines are collected in the background as they arrive, so a chatty
/// command never stalls on a full pipe while the phase is waiting.
#[derive(Debug)]
pub struct RemoteCommand {
    command: String,
    lines: mpsc::UnboundedReceiver<String>,
}

impl RemoteCommand {
    /// Collect from a single output stream.
    pub fn from_reader<R>(command: &str, reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(reader, tx));
        Self {
            command: command.to_string(),
            lines: rx,
        }
    }

    /// Collect stdout and stderr into one stream.
    pub fn from_readers<O, E>(command: &str, stdout: O, stderr: E) -> Self
    where
        O: AsyncRead + Send + Unpin + 'static,
        E: AsyncRead + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(stdout, tx.clone()));
        tokio::spawn(pump(stderr, tx));
        Self {
            command: command.to_string(),
            lines: rx,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Everything the command printed, waiting at most `timeout` for the
    /// streams to end. Lines received before the deadline are kept.
    pub async fn drain(mut self, timeout: Duration) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut out = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, self.lines.recv()).await {
                Ok(Some(line)) => out.push(line),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        command = %self.command,
                        lines = out.len(),
                        "remote output still open at drain deadline"
                    );
                    break;
                }
            }
        }
        out
    }
}

async fn pump<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "remote output stream ended with error");
                break;
            }
        }
    }
}

//! OpenSSH-backed remote sessions.
//!
//! Each session starts a control master (`ssh -M -S <socket> -N`) and runs
//! every command through that socket, so a phase authenticates once and all
//! of its commands share one connection. Password credentials go through
//! `sshpass -e`; without one, ssh runs in batch mode and relies on keys.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RemoteEndpoint;

use super::{RemoteCommand, RemoteConnector, RemoteError, RemoteSession};

/// How often readiness of a new control master is polled.
const READY_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct OpenSshConnector {
    ssh: String,
    sshpass: String,
    control_dir: PathBuf,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl OpenSshConnector {
    pub fn new(command_timeout: Duration) -> Self {
        Self {
            ssh: "ssh".to_string(),
            sshpass: "sshpass".to_string(),
            control_dir: std::env::temp_dir(),
            connect_timeout: command_timeout,
            command_timeout,
        }
    }

    /// Use a different ssh binary.
    pub fn with_ssh(mut self, ssh: impl Into<String>) -> Self {
        self.ssh = ssh.into();
        self
    }

    /// Directory for control sockets. Socket paths are length-limited, so
    /// this should be short.
    pub fn with_control_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.control_dir = dir.into();
        self
    }

    fn master_args(&self, endpoint: &RemoteEndpoint, socket: &Path) -> Vec<String> {
        let mut args = vec![
            "-M".to_string(),
            "-S".to_string(),
            socket.display().to_string(),
            "-N".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "ServerAliveInterval=5".to_string(),
        ];
        if endpoint.password.is_none() {
            args.push("-o".to_string());
            args.push("BatchMode=yes".to_string());
        }
        args.push(endpoint.destination());
        args
    }

    fn master_command(&self, endpoint: &RemoteEndpoint, socket: &Path) -> Command {
        let mut cmd = match &endpoint.password {
            Some(password) => {
                let mut cmd = Command::new(&self.sshpass);
                cmd.arg("-e").arg(&self.ssh).env("SSHPASS", password);
                cmd
            }
            None => Command::new(&self.ssh),
        };
        cmd.args(self.master_args(endpoint, socket))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RemoteConnector for OpenSshConnector {
    async fn connect(
        &self,
        endpoint: &RemoteEndpoint,
    ) -> Result<Box<dyn RemoteSession>, RemoteError> {
        let host = endpoint.address.clone();
        let connect_err = |reason: String| RemoteError::Connect {
            host: host.clone(),
            reason,
        };

        if endpoint.address.starts_with('-') || endpoint.username.starts_with('-') {
            return Err(connect_err("endpoint cannot start with a hyphen".to_string()));
        }

        let socket = self
            .control_dir
            .join(format!("loadtest-{}.sock", Uuid::new_v4().simple()));

        let master = self
            .master_command(endpoint, &socket)
            .spawn()
            .map_err(|e| connect_err(format!("failed to start ssh: {}", e)))?;

        let mut session = OpenSshSession {
            ssh: self.ssh.clone(),
            socket,
            destination: endpoint.destination(),
            host: host.clone(),
            master,
            children: Vec::new(),
            command_timeout: self.command_timeout,
            closed: false,
        };

        let deadline = tokio::time::Instant::now() + self.connect_timeout + READY_POLL;
        loop {
            match session.master.try_wait() {
                Ok(Some(status)) => {
                    let stderr = read_stderr(&mut session.master).await;
                    return Err(connect_err(format!(
                        "ssh exited with {}: {}",
                        status,
                        stderr.trim()
                    )));
                }
                Ok(None) => {}
                Err(e) => return Err(connect_err(format!("failed to poll ssh: {}", e))),
            }

            if session.master_ready().await {
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                if let Err(e) = session.master.kill().await {
                    warn!(%host, error = %e, "failed to kill ssh master");
                }
                return Err(connect_err(format!(
                    "no connection after {}s",
                    self.connect_timeout.as_secs()
                )));
            }
            tokio::time::sleep(READY_POLL).await;
        }

        info!(%host, user = %endpoint.username, "remote session open");
        Ok(Box::new(session))
    }
}

async fn read_stderr(child: &mut Child) -> String {
    let mut out = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        let read = stderr.read_to_string(&mut out);
        if tokio::time::timeout(Duration::from_secs(1), read).await.is_err() {
            debug!("ssh stderr did not close");
        }
    }
    out
}

/// One control-master connection to a remote host.
pub struct OpenSshSession {
    ssh: String,
    socket: PathBuf,
    destination: String,
    host: String,
    master: Child,
    /// Commands started with `exec`; stopped when the session closes.
    children: Vec<Child>,
    command_timeout: Duration,
    closed: bool,
}

impl OpenSshSession {
    /// An ssh invocation that rides on the control master.
    fn client_command(&self) -> Command {
        let mut cmd = Command::new(&self.ssh);
        cmd.arg("-S")
            .arg(&self.socket)
            .args(["-o", "BatchMode=yes"])
            .arg(&self.destination)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    fn control(&self, op: &str) -> Command {
        let mut cmd = Command::new(&self.ssh);
        cmd.arg("-S")
            .arg(&self.socket)
            .args(["-O", op])
            .arg(&self.destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    async fn master_ready(&self) -> bool {
        let check = self.control("check").status();
        matches!(
            tokio::time::timeout(self.command_timeout, check).await,
            Ok(Ok(status)) if status.success()
        )
    }
}

#[async_trait]
impl RemoteSession for OpenSshSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn exec(&mut self, command: &str) -> Result<RemoteCommand, RemoteError> {
        let exec_err = |reason: String| RemoteError::Exec {
            host: self.host.clone(),
            command: command.to_string(),
            reason,
        };

        let mut child = self
            .client_command()
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| exec_err(e.to_string()))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let output = match (stdout, stderr) {
            (Some(out), Some(err)) => RemoteCommand::from_readers(command, out, err),
            _ => return Err(exec_err("output pipes unavailable".to_string())),
        };

        debug!(host = %self.host, %command, "remote command started");
        self.children.push(child);
        Ok(output)
    }

    async fn run(&mut self, command: &str, timeout: Duration) -> Result<(), RemoteError> {
        let output = self
            .client_command()
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        match tokio::time::timeout(timeout, output).await {
            Err(_) => Err(RemoteError::Timeout {
                host: self.host.clone(),
                command: command.to_string(),
                timeout,
            }),
            Ok(Err(e)) => Err(RemoteError::Exec {
                host: self.host.clone(),
                command: command.to_string(),
                reason: e.to_string(),
            }),
            Ok(Ok(out)) if !out.status.success() => Err(RemoteError::Exec {
                host: self.host.clone(),
                command: command.to_string(),
                reason: format!(
                    "exited with {}: {}",
                    out.status,
                    String::from_utf8_lossy(&out.stderr).trim()
                ),
            }),
            Ok(Ok(_)) => {
                debug!(host = %self.host, %command, "remote command finished");
                Ok(())
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let exit = self.control("exit").status();
        if tokio::time::timeout(self.command_timeout, exit).await.is_err() {
            warn!(host = %self.host, "ssh control exit timed out");
        }

        if tokio::time::timeout(self.command_timeout, self.master.wait())
            .await
            .is_err()
        {
            warn!(host = %self.host, "ssh master still running, killing");
            if let Err(e) = self.master.kill().await {
                warn!(host = %self.host, error = %e, "failed to kill ssh master");
            }
        }

        for mut child in self.children.drain(..) {
            if let Ok(None) = child.try_wait() {
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "failed to kill remote command client");
                }
            }
        }

        if let Err(e) = remove_socket(&self.socket) {
            debug!(
                host = %self.host,
                socket = %self.socket.display(),
                error = %e,
                "failed to remove control socket"
            );
        }
        debug!(host = %self.host, "remote session closed");
    }
}

/// The master normally removes its socket on exit, so a missing one is fine.
fn remove_socket(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(password: Option<&str>) -> RemoteEndpoint {
        RemoteEndpoint {
            address: "10.0.0.1".into(),
            username: "tester".into(),
            password: password.map(String::from),
        }
    }

    #[test]
    fn test_master_args_key_auth_uses_batch_mode() {
        let connector = OpenSshConnector::new(Duration::from_secs(7));
        let args = connector.master_args(&endpoint(None), Path::new("/tmp/x.sock"));

        assert_eq!(&args[..4], &["-M", "-S", "/tmp/x.sock", "-N"]);
        assert!(args.contains(&"ConnectTimeout=7".to_string()));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert_eq!(args.last().unwrap(), "tester@10.0.0.1");
    }

    #[test]
    fn test_remove_socket_reports_only_real_failures() {
        let dir = tempfile::TempDir::new().unwrap();

        let socket = dir.path().join("ctl.sock");
        std::fs::write(&socket, b"").unwrap();
        remove_socket(&socket).unwrap();
        assert!(!socket.exists());

        // Already gone after the master exited.
        remove_socket(&socket).unwrap();

        let err = remove_socket(dir.path()).unwrap_err();
        assert_ne!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_master_args_password_auth_is_interactive() {
        let connector = OpenSshConnector::new(Duration::from_secs(7));
        let args = connector.master_args(&endpoint(Some("pw")), Path::new("/tmp/x.sock"));

        assert!(!args.contains(&"BatchMode=yes".to_string()));
        assert!(!args.iter().any(|a| a.contains("pw")));
    }

    #[tokio::test]
    async fn test_connect_fails_when_master_exits() {
        // `false` ignores its arguments and exits 1, like an ssh that could
        // not authenticate.
        let connector = OpenSshConnector::new(Duration::from_secs(2)).with_ssh("false");
        let result = connector.connect(&endpoint(None)).await;
        assert!(matches!(result, Err(RemoteError::Connect { ref host, .. }) if host == "10.0.0.1"));
    }

    #[tokio::test]
    async fn test_connect_fails_when_ssh_missing() {
        let connector =
            OpenSshConnector::new(Duration::from_secs(2)).with_ssh("definitely-not-ssh-xyz");
        let result = connector.connect(&endpoint(None)).await;
        assert!(matches!(result, Err(RemoteError::Connect { .. })));
    }

    #[tokio::test]
    async fn test_connect_rejects_option_like_host() {
        let connector = OpenSshConnector::new(Duration::from_secs(2));
        let mut ep = endpoint(None);
        ep.address = "-oProxyCommand=evil".into();
        assert!(matches!(
            connector.connect(&ep).await,
            Err(RemoteError::Connect { .. })
        ));
    }
}

//! Process pair controller.
//!
//! Runs one phase: a local iperf process and a remote one per active
//! direction, a bounded wait for the phase to play out, then teardown. Every
//! log sink handed in is closed exactly once, whichever way the phase ends.

use std::io;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Timing;
use crate::remote::{RemoteCommand, RemoteConnector, RemoteError, RemoteSession};
use crate::scheduler::{CancellationSignal, WaitOutcome};
use crate::storage::{LogSink, INTERRUPTED_MARKER};

use super::local::{LocalProcess, ProcessLauncher, SpawnError};
use super::phase::{DirectionCommands, PhaseDescriptor, PhaseLogs};
use super::{Direction, Role};

const TCP_UPLINK_NOTE: &str =
    "\n-----------NOTE: IF RUNNING UPLINK TCP TEST, VALUES MAY BE ZERO DUE TO SERVER PERMISSIONS--------------\n";

/// How a phase that started cleanly came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairOutcome {
    /// Everything finished inside the phase window.
    Completed,
    /// The run was interrupted while the phase was running.
    Cancelled,
    /// The local uplink client was still running when the window closed
    /// and had to be killed.
    DurationExpired,
}

#[derive(Debug, Error)]
pub enum PairError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("failed to write phase log: {0}")]
    Sink(#[from] io::Error),
}

/// Client and server logs of one direction.
#[derive(Debug)]
pub struct DirectionSinks {
    pub client: LogSink,
    pub server: LogSink,
}

impl DirectionSinks {
    pub fn discard() -> Self {
        Self {
            client: LogSink::discard(),
            server: LogSink::discard(),
        }
    }

    fn open(logs: &PhaseLogs, direction: Direction) -> io::Result<Self> {
        Ok(Self {
            client: LogSink::create(&logs.path(direction, Role::Client))?,
            server: LogSink::create(&logs.path(direction, Role::Server))?,
        })
    }

    /// Append `line` to both logs. Failures are logged, not returned, since
    /// this only runs during teardown.
    fn append(&mut self, line: &str) {
        for sink in [&mut self.client, &mut self.server] {
            if let Err(e) = sink.write_line(line) {
                warn!(path = ?sink.path(), error = %e, "failed to append to phase log");
            }
        }
    }

    fn close(self) {
        for sink in [self.client, self.server] {
            let path = sink.path().map(|p| p.to_path_buf());
            if let Err(e) = sink.close() {
                warn!(?path, error = %e, "failed to close phase log");
            }
        }
    }
}

/// All logs of one phase, for whichever directions it runs.
#[derive(Debug, Default)]
pub struct PhaseSinks {
    pub downlink: Option<DirectionSinks>,
    pub uplink: Option<DirectionSinks>,
}

impl PhaseSinks {
    /// Open the log files named by the descriptor, or discard sinks when it
    /// carries no log identifiers.
    pub fn open(desc: &PhaseDescriptor) -> io::Result<Self> {
        let open = |active: bool, direction| -> io::Result<Option<DirectionSinks>> {
            if !active {
                return Ok(None);
            }
            match &desc.logs {
                Some(logs) => DirectionSinks::open(logs, direction).map(Some),
                None => Ok(Some(DirectionSinks::discard())),
            }
        };
        Ok(Self {
            downlink: open(desc.downlink.is_some(), Direction::Downlink)?,
            uplink: open(desc.uplink.is_some(), Direction::Uplink)?,
        })
    }

    pub fn discard(desc: &PhaseDescriptor) -> Self {
        Self {
            downlink: desc.downlink.as_ref().map(|_| DirectionSinks::discard()),
            uplink: desc.uplink.as_ref().map(|_| DirectionSinks::discard()),
        }
    }
}

/// Local server, remote client.
struct DownlinkPair<'a> {
    commands: &'a DirectionCommands,
    sinks: DirectionSinks,
    server: Option<Box<dyn LocalProcess>>,
    client: Option<RemoteCommand>,
}

/// Remote server, local client.
struct UplinkPair<'a> {
    commands: &'a DirectionCommands,
    sinks: DirectionSinks,
    server: Option<RemoteCommand>,
    client: Option<Box<dyn LocalProcess>>,
}

/// Pair the active directions with their sinks. Sinks for a direction the
/// descriptor does not run are closed straight away.
fn bind<'a>(
    commands: Option<&'a DirectionCommands>,
    sinks: Option<DirectionSinks>,
) -> Option<(&'a DirectionCommands, DirectionSinks)> {
    match (commands, sinks) {
        (Some(commands), sinks) => Some((commands, sinks.unwrap_or_else(DirectionSinks::discard))),
        (None, Some(unused)) => {
            unused.close();
            None
        }
        (None, None) => None,
    }
}

/// Runs phases. Cheap to share across phase tasks.
pub struct PairController {
    launcher: Arc<dyn ProcessLauncher>,
    connector: Arc<dyn RemoteConnector>,
    timing: Timing,
}

impl PairController {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        connector: Arc<dyn RemoteConnector>,
        timing: Timing,
    ) -> Self {
        Self {
            launcher,
            connector,
            timing,
        }
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    /// Run one phase to completion or cancellation and tear it down.
    ///
    /// A start failure (connect, spawn, remote exec) still tears down
    /// whatever did start, records the failure in every log and closes them
    /// before the error is returned.
    pub async fn run(
        &self,
        desc: &PhaseDescriptor,
        signal: &CancellationSignal,
        sinks: PhaseSinks,
    ) -> Result<PairOutcome, PairError> {
        let PhaseSinks {
            downlink: dl_sinks,
            uplink: ul_sinks,
        } = sinks;
        let mut downlink =
            bind(desc.downlink.as_ref(), dl_sinks).map(|(commands, sinks)| DownlinkPair {
                commands,
                sinks,
                server: None,
                client: None,
            });
        let mut uplink =
            bind(desc.uplink.as_ref(), ul_sinks).map(|(commands, sinks)| UplinkPair {
                commands,
                sinks,
                server: None,
                client: None,
            });

        let connected = tokio::select! {
            biased;
            _ = signal.cancelled() => None,
            result = self.connector.connect(&desc.remote) => Some(result),
        };
        let mut session = match connected {
            None => {
                info!(host = %desc.remote.address, "cancelled while connecting");
                finish_logs(downlink.map(|p| p.sinks), uplink.map(|p| p.sinks), true, None);
                return Ok(PairOutcome::Cancelled);
            }
            Some(Ok(session)) => session,
            Some(Err(e)) => {
                warn!(host = %desc.remote.address, error = %e, "remote connect failed");
                let line = failure_line(&e);
                finish_logs(downlink.map(|p| p.sinks), uplink.map(|p| p.sinks), false, Some(&line));
                return Err(e.into());
            }
        };

        let started = self
            .start(session.as_mut(), signal, downlink.as_mut(), uplink.as_mut())
            .await;

        let cancelled = match &started {
            Ok(()) if signal.is_cancelled() => true,
            Ok(()) => {
                info!(
                    duration_secs = desc.duration_secs,
                    dl_port = ?desc.downlink.as_ref().map(|c| c.port),
                    ul_port = ?desc.uplink.as_ref().map(|c| c.port),
                    "phase running"
                );
                let window = desc.duration() + self.timing.phase_grace;
                signal.wait_for(window).await == WaitOutcome::Cancelled
            }
            Err(e) => {
                warn!(error = %e, "phase failed to start, tearing down");
                signal.is_cancelled()
            }
        };
        let abort = cancelled || started.is_err();

        let expired = self
            .stop(session.as_mut(), downlink.as_mut(), uplink.as_mut(), abort)
            .await;
        session.close().await;

        let failure = started.as_ref().err().map(failure_line);
        finish_logs(
            downlink.map(|p| p.sinks),
            uplink.map(|p| p.sinks),
            cancelled,
            failure.as_deref(),
        );
        started?;

        let outcome = if cancelled {
            PairOutcome::Cancelled
        } else if expired {
            PairOutcome::DurationExpired
        } else {
            PairOutcome::Completed
        };
        debug!(?outcome, "phase torn down");
        Ok(outcome)
    }

    /// Servers go up before clients in each direction so the listener
    /// exists when the client connects. Nothing new is launched once the
    /// signal is set; the caller sees the signal and tears down what exists.
    async fn start(
        &self,
        session: &mut dyn RemoteSession,
        signal: &CancellationSignal,
        downlink: Option<&mut DownlinkPair<'_>>,
        uplink: Option<&mut UplinkPair<'_>>,
    ) -> Result<(), PairError> {
        if let Some(dl) = downlink {
            if signal.is_cancelled() {
                return Ok(());
            }
            dl.sinks.server.write_header(&dl.commands.server)?;
            dl.server = Some(self.launcher.spawn(&dl.commands.server, &dl.sinks.server)?);
            debug!(pid = dl.server.as_ref().and_then(|p| p.pid()), "downlink server started");

            if signal.is_cancelled() {
                return Ok(());
            }
            dl.sinks.client.write_header(&dl.commands.client)?;
            dl.client = Some(session.exec(&dl.commands.client).await?);
            debug!("downlink client started");
        }

        if let Some(ul) = uplink {
            if signal.is_cancelled() {
                return Ok(());
            }
            ul.sinks.server.write_header(&ul.commands.server)?;
            ul.sinks.server.write_line(TCP_UPLINK_NOTE)?;
            ul.server = Some(session.exec(&ul.commands.server).await?);
            debug!("uplink server started");

            if signal.is_cancelled() {
                return Ok(());
            }
            ul.sinks.client.write_header(&ul.commands.client)?;
            ul.client = Some(self.launcher.spawn(&ul.commands.client, &ul.sinks.client)?);
            debug!(pid = ul.client.as_ref().and_then(|p| p.pid()), "uplink client started");
        }

        Ok(())
    }

    /// Stop everything that started. Returns whether the local uplink
    /// client outlived the phase window.
    async fn stop(
        &self,
        session: &mut dyn RemoteSession,
        mut downlink: Option<&mut DownlinkPair<'_>>,
        mut uplink: Option<&mut UplinkPair<'_>>,
        abort: bool,
    ) -> bool {
        let mut expired = false;

        if let Some(client) = uplink.as_mut().and_then(|ul| ul.client.as_mut()) {
            if abort {
                client.kill().await;
            } else if !client.has_exited() {
                warn!("uplink client still running after phase window, killing");
                client.kill().await;
                expired = true;
            }
        }

        if abort {
            if let Some(dl) = downlink.as_deref().filter(|dl| dl.client.is_some()) {
                self.remote_kill(session, &dl.commands.remote_kill).await;
            }
        }

        if let Some(ul) = uplink.as_mut() {
            if let Some(server) = ul.server.take() {
                self.remote_kill(session, &ul.commands.remote_kill).await;
                let lines = server.drain(self.timing.drain_timeout).await;
                write_captured(&mut ul.sinks.server, &lines);
            }
        }

        if let Some(dl) = downlink.as_mut() {
            if let Some(server) = dl.server.as_mut() {
                server.terminate(self.timing.terminate_timeout).await;
            }
            if let Some(client) = dl.client.take() {
                let lines = client.drain(self.timing.drain_timeout).await;
                write_captured(&mut dl.sinks.client, &lines);
            }
        }

        expired
    }

    /// Kill strings are best-effort. A failure leaves at worst an orphaned
    /// remote iperf, which is not worth failing the phase over.
    async fn remote_kill(&self, session: &mut dyn RemoteSession, command: &str) {
        if let Err(e) = session.run(command, self.timing.command_timeout).await {
            warn!(host = session.host(), error = %e, "remote kill failed");
        }
    }
}

fn failure_line(err: &impl std::fmt::Display) -> String {
    format!("\nPhase failed: {}\n", err)
}

fn write_captured(sink: &mut LogSink, lines: &[String]) {
    for line in lines {
        if let Err(e) = sink.write_line(line) {
            warn!(path = ?sink.path(), error = %e, "failed to write captured remote output");
            return;
        }
    }
}

fn finish_logs(
    downlink: Option<DirectionSinks>,
    uplink: Option<DirectionSinks>,
    cancelled: bool,
    failure: Option<&str>,
) {
    for mut sinks in downlink.into_iter().chain(uplink) {
        if cancelled {
            sinks.append(&format!("\n{}", INTERRUPTED_MARKER));
        }
        if let Some(line) = failure {
            sinks.append(line);
        }
        sinks.close();
    }
}

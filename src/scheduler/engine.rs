use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use futures::future::join_all;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{ConfigError, DeviceConfig, DeviceSection, Globals, LoadTestConfig, Timing};
use crate::storage::LogLayout;
use crate::system::InterfaceResolver;
use crate::throughput::{compile_device, PairController, PhaseDescriptor, PhaseSinks};

use super::cancel::{CancellationSignal, WaitOutcome};
use super::report::{DeviceFailure, PhaseReport, PhaseStatus, RunReport};

/// Everything the scheduler needs from the `[globals]` table.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub log_dir: PathBuf,
    pub logging: bool,
    pub log_prefix: String,
    pub iperf: String,
    pub timing: Timing,
}

impl From<&Globals> for RunSettings {
    fn from(globals: &Globals) -> Self {
        Self {
            log_dir: globals.log_dir.clone(),
            logging: globals.logging,
            log_prefix: globals.log_prefix.clone(),
            iperf: globals.iperf.clone(),
            timing: globals.timing(),
        }
    }
}

/// A planned run, ready to execute.
#[derive(Debug)]
pub struct TestRun {
    pub id: Uuid,
    pub started_at: DateTime<Local>,
    pub devices: Vec<DeviceConfig>,
    pub phases: Vec<PhaseDescriptor>,
    /// Device sections that failed to plan. The rest of the run goes ahead.
    pub failures: Vec<DeviceFailure>,
    pub layout: Option<LogLayout>,
    pub signal: CancellationSignal,
    pub max_duration: Duration,
}

pub struct Scheduler {
    settings: RunSettings,
    resolver: Arc<dyn InterfaceResolver>,
    controller: Arc<PairController>,
}

impl Scheduler {
    pub fn new(
        settings: RunSettings,
        resolver: Arc<dyn InterfaceResolver>,
        controller: Arc<PairController>,
    ) -> Self {
        Self {
            settings,
            resolver,
            controller,
        }
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Validate, resolve and compile every device section.
    ///
    /// A device that fails is recorded and left out; planning only fails
    /// when no device at all can run.
    pub fn plan(&self, config: &LoadTestConfig) -> Result<TestRun> {
        if config.devices.is_empty() {
            bail!("config has no device sections");
        }

        let started_at = Local::now();
        let mut layout: Option<LogLayout> = None;
        let mut devices = Vec::new();
        let mut phases = Vec::new();
        let mut failures = Vec::new();
        let mut ids: HashMap<u32, String> = HashMap::new();
        let mut ports: HashMap<u16, String> = HashMap::new();

        for section in &config.devices {
            let planned = self.plan_device(section, &ids, &ports).and_then(|(device, compiled)| {
                if !self.settings.logging {
                    return Ok((device, compiled));
                }
                let layout = match &mut layout {
                    Some(layout) => layout,
                    slot => slot.insert(
                        LogLayout::create(&self.settings.log_dir, &started_at).with_context(
                            || {
                                format!(
                                    "failed to create log directory under {}",
                                    self.settings.log_dir.display()
                                )
                            },
                        )?,
                    ),
                };
                let dir = layout
                    .device_dir(&device.adapter, &started_at)
                    .with_context(|| {
                        format!("failed to create log directory for {}", device.adapter)
                    })?;
                let compiled = compiled
                    .into_iter()
                    .map(|p| p.with_logs(&dir, &self.settings.log_prefix))
                    .collect();
                Ok((device, compiled))
            });

            match planned {
                Ok((device, compiled)) => {
                    ids.insert(device.device_id, section.name.clone());
                    for p in &compiled {
                        for port in p.ports() {
                            ports.insert(port, section.name.clone());
                        }
                    }
                    info!(
                        section = %section.name,
                        device = %device.adapter,
                        phases = compiled.len(),
                        "device planned"
                    );
                    devices.push(device);
                    phases.extend(compiled);
                }
                Err(e) => {
                    error!(section = %section.name, error = %format!("{:#}", e), "device skipped");
                    failures.push(DeviceFailure {
                        section: section.name.clone(),
                        error: format!("{:#}", e),
                    });
                }
            }
        }

        if devices.is_empty() {
            bail!(
                "no device could be planned ({} section{} failed)",
                failures.len(),
                if failures.len() == 1 { "" } else { "s" }
            );
        }

        let max_duration = devices
            .iter()
            .map(DeviceConfig::total_duration_secs)
            .max()
            .map(Duration::from_secs)
            .unwrap_or_default();

        Ok(TestRun {
            id: Uuid::new_v4(),
            started_at,
            devices,
            phases,
            failures,
            layout,
            signal: CancellationSignal::new(),
            max_duration,
        })
    }

    fn plan_device(
        &self,
        section: &DeviceSection,
        ids: &HashMap<u32, String>,
        ports: &HashMap<u16, String>,
    ) -> Result<(DeviceConfig, Vec<PhaseDescriptor>)> {
        let device = section.to_device()?;

        if let Some(other) = ids.get(&device.device_id) {
            return Err(ConfigError::DuplicateDeviceId {
                section: section.name.clone(),
                id: device.device_id,
                other: other.clone(),
            }
            .into());
        }

        let local_ip = match device.address {
            Some(addr) => addr,
            None => self
                .resolver
                .resolve(&device.adapter)
                .with_context(|| format!("[{}] cannot resolve local address", section.name))?,
        };

        let compiled = compile_device(&device, local_ip, &self.settings.iperf)?;

        for port in compiled.iter().flat_map(PhaseDescriptor::ports) {
            if let Some(other) = ports.get(&port) {
                return Err(ConfigError::PortCollision {
                    section: section.name.clone(),
                    port,
                    other: other.clone(),
                }
                .into());
            }
        }

        Ok((device, compiled))
    }

    /// Launch every phase and wait for the run to end.
    ///
    /// The run ends when all phases finish. When `interrupt` resolves the
    /// signal is set and every phase is still joined, so its teardown is
    /// done by the time this returns. Passing the run deadline only logs:
    /// each phase bounds its own lifetime and the signal stays reserved for
    /// operator interrupts.
    pub async fn run_all<F>(&self, run: TestRun, interrupt: F) -> RunReport
    where
        F: Future<Output = ()>,
    {
        let TestRun {
            id,
            phases,
            failures,
            signal,
            max_duration,
            ..
        } = run;

        let deadline = run_deadline(&phases, &self.settings.timing);
        info!(
            run_id = %id,
            phases = phases.len(),
            max_duration_secs = max_duration.as_secs(),
            deadline_secs = deadline.as_secs(),
            "load test starting"
        );

        let mut labels = Vec::with_capacity(phases.len());
        let mut handles = Vec::with_capacity(phases.len());
        for desc in phases {
            labels.push((desc.device.clone(), desc.phase));
            let span = info_span!("phase", device = %desc.device, phase = desc.phase);
            let controller = Arc::clone(&self.controller);
            let signal = signal.clone();
            handles.push(tokio::spawn(
                run_phase(controller, desc, signal).instrument(span),
            ));
        }

        let joined = join_all(handles);
        let overrun = tokio::time::sleep(deadline);
        tokio::pin!(joined);
        tokio::pin!(interrupt);
        tokio::pin!(overrun);

        let mut interrupted = false;
        let mut overran = false;
        let results = loop {
            tokio::select! {
                results = &mut joined => break results,
                _ = &mut interrupt, if !interrupted => {
                    interrupted = true;
                    if signal.cancel() {
                        warn!("Process interrupted by user.");
                        warn!("Tearing down processes and closing logs...");
                    }
                }
                _ = &mut overrun, if !overran => {
                    overran = true;
                    warn!(
                        deadline_secs = deadline.as_secs(),
                        "run deadline passed with phases still running, waiting for them"
                    );
                }
            }
        };

        let phases = labels
            .into_iter()
            .zip(results)
            .map(|((device, phase), joined)| {
                let status = joined.unwrap_or_else(|e| {
                    error!(%device, phase, error = %e, "phase task panicked");
                    PhaseStatus::Failed(format!("phase task failed: {}", e))
                });
                PhaseReport {
                    device,
                    phase,
                    status,
                }
            })
            .collect();

        let report = RunReport {
            run_id: id,
            interrupted,
            phases,
            failures,
        };
        info!(
            run_id = %id,
            interrupted,
            failures = report.failed_count(),
            "load test finished"
        );
        report
    }
}

/// Latest point any phase can still be running: its delay and duration plus
/// the phase grace, with the run grace on top.
fn run_deadline(phases: &[PhaseDescriptor], timing: &Timing) -> Duration {
    let last_end = phases
        .iter()
        .map(|p| p.delay() + p.duration())
        .max()
        .unwrap_or_default();
    last_end + timing.phase_grace + timing.run_grace
}

async fn run_phase(
    controller: Arc<PairController>,
    desc: PhaseDescriptor,
    signal: CancellationSignal,
) -> PhaseStatus {
    if signal.wait_for(desc.delay()).await == WaitOutcome::Cancelled {
        info!("phase skipped, run cancelled before start");
        return PhaseStatus::Skipped;
    }

    let sinks = match PhaseSinks::open(&desc) {
        Ok(sinks) => sinks,
        Err(e) => {
            error!(error = %e, "failed to open phase logs");
            return PhaseStatus::Failed(format!("failed to open phase logs: {}", e));
        }
    };

    info!(remote = %desc.remote.address, "phase starting");
    match controller.run(&desc, &signal, sinks).await {
        Ok(outcome) => {
            info!(?outcome, "phase finished");
            PhaseStatus::Finished(outcome)
        }
        Err(e) => {
            error!(error = %e, "phase failed");
            PhaseStatus::Failed(e.to_string())
        }
    }
}

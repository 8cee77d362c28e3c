//! loadtest -- multi-device, multi-phase iperf load test orchestrator.
//!
//! Each device under test is a local interface paired with a remote peer
//! reachable over SSH. A run compiles every device into timed phases, starts
//! a local/remote iperf pair per active direction at each phase's offset,
//! and writes the tool output into a per-run log tree.

pub mod config;
pub mod remote;
pub mod scheduler;
pub mod storage;
pub mod system;
pub mod throughput;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use config::LoadTestConfig;
use remote::OpenSshConnector;
use scheduler::{RunReport, RunSettings, Scheduler};
use system::SystemResolver;
use throughput::{PairController, TokioLauncher};

/// A scheduler wired to the real host: `ip` for interface lookup, local
/// processes via tokio, remote commands over OpenSSH.
pub fn system_scheduler(settings: RunSettings) -> Scheduler {
    let connector = OpenSshConnector::new(settings.timing.command_timeout);
    let controller = PairController::new(
        Arc::new(TokioLauncher),
        Arc::new(connector),
        settings.timing,
    );
    Scheduler::new(settings, Arc::new(SystemResolver), Arc::new(controller))
}

/// Load `config_path`, run every device until done or Ctrl-C, and return
/// the report.
pub async fn run(config_path: &Path) -> Result<RunReport> {
    let config = LoadTestConfig::load(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let scheduler = system_scheduler(RunSettings::from(&config.globals));
    let run = scheduler.plan(&config)?;

    if let Some(layout) = &run.layout {
        tracing::info!(path = %layout.run_dir().display(), "writing logs");
    }

    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for Ctrl-C, run will not be interruptible");
            std::future::pending::<()>().await;
        }
    };

    Ok(scheduler.run_all(run, interrupt).await)
}

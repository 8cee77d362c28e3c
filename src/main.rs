use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use loadtest::config::LoadTestConfig;
use loadtest::scheduler::RunSettings;

#[derive(Parser)]
#[command(
    name = "loadtest",
    about = "Run timed iperf load tests across several devices at once",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML test configuration
    config: PathBuf,

    /// Print the compiled phases as JSON and exit without running anything
    #[arg(long)]
    dry_run: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing. stdout is kept for the summary and dry-run output.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match cli.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }

    if cli.dry_run {
        return dry_run(&cli.config);
    }

    tracing::info!(config = %cli.config.display(), "starting load test");
    let report = loadtest::run(&cli.config).await?;
    print!("{}", report.format_summary());

    Ok(())
}

fn dry_run(path: &std::path::Path) -> Result<()> {
    let config = LoadTestConfig::load(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    let mut settings = RunSettings::from(&config.globals);
    settings.logging = false;

    let scheduler = loadtest::system_scheduler(settings);
    let run = scheduler.plan(&config)?;

    let listing = serde_json::json!({
        "max_duration_secs": run.max_duration.as_secs(),
        "phases": run.phases,
        "failures": run.failures,
    });
    println!("{}", serde_json::to_string_pretty(&listing)?);
    Ok(())
}

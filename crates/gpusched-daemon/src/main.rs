//! gpusched daemon
//!
//! Admits jobs, dispatches them by priority, preempts on GPU shortage and
//! accounts GPU usage of running jobs.

mod daemon;

use anyhow::{Context, Result};
use clap::Parser;
use gpusched_core::{DaemonConfig, LoggingConfig};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::daemon::Daemon;

/// gpusched daemon - priority scheduler and GPU usage accounting
#[derive(Parser, Debug, Default)]
#[command(name = "gpuschedd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Log level, overrides [logging].level
    #[arg(long)]
    log_level: Option<String>,

    /// Seconds between dispatch attempts
    #[arg(long)]
    tick_interval_secs: Option<u64>,

    /// Prometheus base URL for GPU metrics
    #[arg(long)]
    prometheus_url: Option<String>,
}

fn load_config(args: &Args) -> Result<DaemonConfig> {
    let config = match &args.config {
        Some(path) => DaemonConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => DaemonConfig::default(),
    };
    Ok(apply_args(config, args))
}

/// Command-line flags win over the configuration file
fn apply_args(mut config: DaemonConfig, args: &Args) -> DaemonConfig {
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if let Some(secs) = args.tick_interval_secs {
        config.scheduler.tick_interval_secs = secs;
    }
    if let Some(url) = &args.prometheus_url {
        config.telemetry.prometheus_url = Some(url.clone());
    }
    config
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let builder = FmtSubscriber::builder()
        .with_max_level(parse_level(&logging.level))
        .with_target(false);

    match &logging.filter {
        Some(filter) => {
            let filter = EnvFilter::try_new(filter)
                .with_context(|| format!("Invalid log filter '{}'", filter))?;
            tracing::subscriber::set_global_default(builder.with_env_filter(filter).finish())
        }
        None => tracing::subscriber::set_global_default(builder.finish()),
    }
    .context("Failed to set subscriber")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging(&config.logging)?;

    info!("Starting gpusched daemon v{}", env!("CARGO_PKG_VERSION"));
    info!(
        tick_interval_secs = config.scheduler.tick_interval_secs,
        strategy = %config.preemption.active_strategy,
        "Configuration loaded"
    );

    let daemon = Daemon::build(config).await?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
            }
            cancel.cancel();
        });
    }

    daemon.run(cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("warn"), Level::WARN);
        assert_eq!(parse_level("loud"), Level::INFO);
    }

    #[test]
    fn test_args_override_config() {
        let args = Args {
            log_level: Some("debug".to_string()),
            tick_interval_secs: Some(2),
            prometheus_url: Some("http://prometheus:9090".to_string()),
            ..Default::default()
        };

        let config = apply_args(DaemonConfig::default(), &args);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.scheduler.tick_interval_secs, 2);
        assert_eq!(
            config.telemetry.prometheus_url.as_deref(),
            Some("http://prometheus:9090")
        );
    }

    #[test]
    fn test_load_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[scheduler]\ntick_interval_secs = 7\n\n[preemption]\nactive_strategy = \"priority-weight\""
        )
        .unwrap();

        let args = Args {
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let config = load_config(&args).unwrap();
        assert_eq!(config.scheduler.tick_interval_secs, 7);
        assert_eq!(config.preemption.active_strategy, "priority-weight");
        assert_eq!(config.telemetry.collect_interval_secs, 30);
    }

    #[test]
    fn test_missing_config_file() {
        let args = Args {
            config: Some(PathBuf::from("/nonexistent/gpusched.toml")),
            ..Default::default()
        };
        assert!(load_config(&args).is_err());
    }
}

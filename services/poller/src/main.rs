// poller: Polls a fleet of IEC 62056-21 meters over TCP and ships parsed
// records to the configured sink.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use poller::config::{self, PollerConfig};
use poller::supervisor::{self, SeverityReload, Supervisor};

/// Meter-fleet poller.
#[derive(Debug, Parser)]
#[command(name = "poller", version)]
struct Cli {
    /// Path to the configuration file.
    #[arg(default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Config comes first: logging is configured from it.
    let cfg = match config::load_config_from_path(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let reload = match init_tracing(&cfg) {
        Ok(reload) => reload,
        Err(e) => {
            eprintln!("FATAL: failed to initialize logging: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "poller starting"
    );

    let supervisor = Supervisor::new(&cli.config, cfg, Some(reload));
    match supervisor.run().await {
        Ok(()) => {
            // Normal shutdown on interrupt.
            std::process::exit(0);
        }
        Err(e) => {
            error!(error = %e, "fatal initialization failure");
            std::process::exit(1);
        }
    }
}

/// Stdout and/or logfile writers per `[DEFAULT]`, with a reloadable
/// severity filter.
fn init_tracing(cfg: &PollerConfig) -> Result<SeverityReload, std::io::Error> {
    let filter = supervisor::severity_filter(&cfg.default.severity);
    let (filter, reload) = tracing_subscriber::reload::Layer::new(filter);

    let writer = match (&cfg.default.logfile, cfg.default.log_stdout) {
        (Some(path), true) => {
            let file = open_logfile(path)?;
            BoxMakeWriter::new(std::io::stdout.and(Arc::new(file)))
        }
        (Some(path), false) => {
            let file = open_logfile(path)?;
            BoxMakeWriter::new(Arc::new(file))
        }
        (None, _) => BoxMakeWriter::new(std::io::stdout),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false),
        )
        .init();
    Ok(reload)
}

fn open_logfile(path: &str) -> Result<std::fs::File, std::io::Error> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new().create(true).append(true).open(path)
}

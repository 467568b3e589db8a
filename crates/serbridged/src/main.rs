//! serbridged daemon entry point.
//!
//! Parses the command line, initializes logging, loads the configuration
//! and runs the signal loop: SIGHUP reloads the configuration as a new
//! generation, SIGINT and SIGTERM shut every port down.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::{interval, sleep, Instant};
use tracing::{error, info, warn};

use serbridge_common::{DeviceLocks, LogSink};
use serbridged::config_file::DEFAULT_CONFIG_PATH;
use serbridged::{BridgeConfig, PortLine, PortMgr};

/// Interval between shutdown progress checks.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Longest wait for ports to close on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Serial port to network bridge
#[derive(Parser, Debug)]
#[command(name = "serbridged")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Extra port, as port:state:timeout:device[:options] (repeatable)
    #[arg(short = 'C', long = "port")]
    ports: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Port task polling interval in milliseconds, overrides the file
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Directory for UUCP lock files, overrides the file
    #[arg(long)]
    lock_dir: Option<PathBuf>,
}

/// Initialize tracing/logging.
fn init_logging(log_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false),
        )
        .init();
}

/// Loads the file and appends the command line ports.
fn load_config(args: &Args) -> Result<BridgeConfig> {
    let mut config = if args.ports.is_empty() {
        BridgeConfig::load(&args.config)
    } else {
        BridgeConfig::load_or_default(&args.config)
    }
    .with_context(|| format!("loading {}", args.config.display()))?;

    for line in &args.ports {
        let line = line.parse::<PortLine>().context("parsing --port")?;
        config.ports.push(line);
    }
    if let Some(tick_ms) = args.tick_ms {
        config.daemon.tick_ms = tick_ms;
    }
    if let Some(dir) = &args.lock_dir {
        config.daemon.lock_dir = Some(dir.clone());
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;

    let locks = match &config.daemon.lock_dir {
        Some(dir) => DeviceLocks::with_uucp_dir(dir),
        None => DeviceLocks::new(),
    };
    let mut mgr = PortMgr::new().with_locks(locks).with_tick(config.tick());

    let mut generation = 1;
    config.apply(&mut mgr, &mut LogSink, generation);
    let running = config.daemon.clone();

    let mut hangup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut interrupt = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut maintenance = interval(config.tick());

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading configuration");
                match load_config(&args) {
                    Ok(config) => {
                        for setting in config.daemon.startup_only_changes(&running) {
                            warn!("{} changed, restart serbridged to apply it", setting);
                        }
                        generation += 1;
                        config.apply(&mut mgr, &mut LogSink, generation);
                    }
                    Err(e) => error!("Reload failed, keeping current configuration: {:#}", e),
                }
            }
            _ = terminate.recv() => {
                info!("SIGTERM received");
                break;
            }
            _ = interrupt.recv() => {
                info!("SIGINT received");
                break;
            }
            _ = maintenance.tick() => mgr.maintain(),
        }
    }

    mgr.shutdown_ports();
    let deadline = Instant::now() + SHUTDOWN_GRACE;
    while !mgr.check_ports_shutdown() {
        if Instant::now() >= deadline {
            warn!("Ports still closing after {:?}, exiting anyway", SHUTDOWN_GRACE);
            break;
        }
        sleep(SHUTDOWN_POLL).await;
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("--- Starting serbridged ---");

    match run(args).await {
        Ok(()) => {
            info!("serbridged exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("serbridged error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

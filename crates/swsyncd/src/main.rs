//! swsyncd entry point.
//!
//! Replays a recorded kernel event stream (JSON lines) into the sync engine
//! running against the simulated switch, then optionally keeps the engine
//! running until interrupted.

use clap::Parser;
use log::{error, info, warn};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use swsync_hal::SimulatedSwitch;
use swsyncd::daemon::{EngineState, SyncConfig, SyncEngine};
use swsyncd::kernel::{parse_events, FeedError, ReplayFeed};
use tokio_util::sync::CancellationToken;

/// Kernel-to-switch state synchronizer
#[derive(Parser, Debug)]
#[command(name = "swsyncd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Kernel event stream to replay (one JSON event per line)
    #[arg(short = 'e', long)]
    events: Option<PathBuf>,

    /// Kernel items per dispatch cycle (overrides the config file)
    #[arg(short = 'b', long)]
    batch_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Emit JSON logs through tracing-subscriber
    #[arg(long)]
    json_logs: bool,

    /// Keep running after the replay until interrupted
    #[arg(long)]
    follow: bool,
}

fn load_config(args: &Args) -> Result<SyncConfig, swsyncd::daemon::ConfigError> {
    let mut config = match &args.config {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::default(),
    };
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.json_logs {
        swsyncd::audit::init_logging(&args.log_level);
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
            .init();
    }

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    info!("Starting swsyncd (simulated switch)");
    info!("Batch size: {}", config.batch_size);
    info!("Route lookup timeout: {}ms", config.route_lookup_timeout_ms);

    let mut engine = SyncEngine::new(config, SimulatedSwitch::new());
    let feed = Arc::new(ReplayFeed::new(engine.handle()));
    engine.attach_feed(feed.clone());

    if let Some(path) = &args.events {
        let events = match File::open(path)
            .map_err(FeedError::from)
            .and_then(|f| parse_events(BufReader::new(f)))
        {
            Ok(events) => events,
            Err(e) => {
                error!("{}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        };
        if let Err(e) = feed.replay(events) {
            error!("Replay failed: {}", e);
            return ExitCode::FAILURE;
        }
        if let Err(e) = engine.run_until_idle().await {
            error!("Sync engine: {}", e);
            return ExitCode::FAILURE;
        }
        let stats = engine.stats();
        info!(
            "Replay done: {} kernel items, {} hardware errors, {} unsupported",
            stats.kernel_items, stats.hardware_errors, stats.unsupported
        );
        info!(
            "Hardware: {} routes, {} hosts, {} egresses, {} tunnel endpoints",
            engine.hal().routes.len(),
            engine.hal().hosts.len(),
            engine.hal().egresses.len(),
            engine.vxlan().endpoint_count()
        );
    }

    if args.follow || args.events.is_none() {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let signal = tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    warn!("Received SIGINT, shutting down...");
                    token.cancel();
                }
                Err(err) => error!("Failed to listen for ctrl-c: {}", err),
            }
        });
        if let Err(e) = engine.run(cancel).await {
            error!("Sync engine: {}", e);
            signal.abort();
            return ExitCode::FAILURE;
        }
        signal.abort();
    }

    if engine.state() == EngineState::Stopped {
        error!("Sync engine stopped");
        return ExitCode::FAILURE;
    }
    info!("swsyncd shutdown complete");
    ExitCode::SUCCESS
}

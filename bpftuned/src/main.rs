//! bpftuned: autonomous kernel tuning daemon.
//!
//! Loads tuner plugins, consumes the events their kernel probes emit, and
//! adjusts kernel tunables within capped, rollback-safe bounds.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::{info, warn};

mod logging;
mod supervisor;
mod tuners;

use bpftune_core::config::{Config, DEFAULT_PLUGIN_DIR, DEFAULT_RING_PATH};
use supervisor::Supervisor;
use tuners::TcpBufferTuner;

/// bpftuned - autonomous kernel tuning daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory containing tuner artifacts
    #[arg(short = 'd', long, default_value = DEFAULT_PLUGIN_DIR)]
    plugin_dir: PathBuf,

    /// Backing file of the shared-memory event ring
    #[arg(short = 'r', long, default_value = DEFAULT_RING_PATH)]
    ring: PathBuf,

    /// Enable per-namespace tunable writes (0/1)
    #[arg(long, env = "BPFTUNE_NETNS", default_value = "1")]
    netns: u8,

    /// Plugin directory rescan interval in milliseconds
    #[arg(long, env = "BPFTUNE_RESCAN_MS", default_value = "5000")]
    rescan_ms: u64,

    /// Correlation threshold above which tunable increases are suppressed
    #[arg(long, env = "BPFTUNE_CORR_THRESHOLD", default_value = "0.5")]
    corr_threshold: f64,

    /// Event dedup window in milliseconds
    #[arg(long, env = "BPFTUNE_DEDUP_MS", default_value = "25")]
    dedup_ms: u64,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Directory where log files are stored
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Number of days to keep log files
    #[arg(long, default_value = "7")]
    log_retention_days: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Configuration file format.
#[derive(Debug, serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    daemon: DaemonSection,
    #[serde(default)]
    logging: LoggingSection,
}

#[derive(Debug, serde::Deserialize, Default)]
struct DaemonSection {
    plugin_dir: Option<String>,
    ring: Option<String>,
    netns: Option<bool>,
    rescan_ms: Option<u64>,
    corr_threshold: Option<f64>,
    dedup_ms: Option<u64>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct LoggingSection {
    log_dir: Option<String>,
    retention_days: Option<u64>,
    level: Option<String>,
}

fn load_config_file(path: &PathBuf) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&contents)?)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Config file: explicit path, or bpftuned.toml next to the cwd.
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from("bpftuned.toml");
        default_path.exists().then_some(default_path)
    });
    let file_config = match &config_path {
        Some(path) => match load_config_file(path) {
            Ok(config) => {
                eprintln!("loaded config from {}", path.display());
                config
            }
            Err(e) => {
                eprintln!("failed to load config file {}: {}", path.display(), e);
                return ExitCode::from(1);
            }
        },
        None => ConfigFile::default(),
    };

    // Command line (and the BPFTUNE_* environment) takes precedence over
    // the config file, which takes precedence over defaults.
    let log_dir = if args.log_dir != PathBuf::from("logs") {
        args.log_dir.clone()
    } else {
        PathBuf::from(file_config.logging.log_dir.as_deref().unwrap_or("logs"))
    };
    let retention_days = if args.log_retention_days != 7 {
        args.log_retention_days
    } else {
        file_config.logging.retention_days.unwrap_or(7)
    };

    if let Err(e) = logging::init_logging(
        &log_dir,
        retention_days,
        args.verbose,
        file_config.logging.level.as_deref(),
    ) {
        eprintln!("failed to initialize logging: {}", e);
        return ExitCode::from(1);
    }

    let plugin_dir = if args.plugin_dir != PathBuf::from(DEFAULT_PLUGIN_DIR) {
        args.plugin_dir.clone()
    } else {
        file_config
            .daemon
            .plugin_dir
            .map(PathBuf::from)
            .unwrap_or(args.plugin_dir)
    };
    let ring_path = if args.ring != PathBuf::from(DEFAULT_RING_PATH) {
        args.ring.clone()
    } else {
        file_config
            .daemon
            .ring
            .map(PathBuf::from)
            .unwrap_or(args.ring)
    };

    let netns_enabled = if args.netns != 1 {
        args.netns != 0
    } else {
        file_config.daemon.netns.unwrap_or(true)
    };
    let rescan_ms = if args.rescan_ms != 5000 {
        args.rescan_ms
    } else {
        file_config.daemon.rescan_ms.unwrap_or(args.rescan_ms)
    };
    let corr_threshold = if (args.corr_threshold - 0.5).abs() > f64::EPSILON {
        args.corr_threshold
    } else {
        file_config
            .daemon
            .corr_threshold
            .unwrap_or(args.corr_threshold)
    };
    let dedup_ms = if args.dedup_ms != 25 {
        args.dedup_ms
    } else {
        file_config.daemon.dedup_ms.unwrap_or(args.dedup_ms)
    };

    let config = Config {
        plugin_dir,
        ring_path,
        netns_enabled,
        rescan: Duration::from_millis(rescan_ms),
        corr_threshold,
        dedup_window: Duration::from_millis(dedup_ms),
        ..Config::default()
    };

    if !(0.0..=1.0).contains(&config.corr_threshold) {
        log::error!(
            "correlation threshold {} is outside [0, 1]",
            config.corr_threshold
        );
        return ExitCode::from(1);
    }

    info!("bpftuned starting");
    info!("  plugin directory: {:?}", config.plugin_dir);
    info!("  event ring: {:?}", config.ring_path);
    info!("  per-namespace writes: {}", config.netns_enabled);
    info!("  rescan interval: {:?}", config.rescan);
    info!("  correlation threshold: {}", config.corr_threshold);
    info!("  dedup window: {:?}", config.dedup_window);

    let mut supervisor = Supervisor::new(config.clone());

    // Built-in tuners go through the same admission path as artifacts; a
    // failing one degrades coverage but never stops the daemon.
    if let Err(e) = supervisor
        .host_mut()
        .register_static(Box::new(TcpBufferTuner::new(config.corr_threshold)))
    {
        warn!("built-in tcp_buffer tuner unavailable: {}", e);
    }

    let reason = supervisor.run().await;
    ExitCode::from(reason.code())
}

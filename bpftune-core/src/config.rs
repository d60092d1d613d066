//! Daemon self-configuration.
//!
//! These are the knobs of the daemon itself, not kernel tunables. The
//! `bpftuned` binary assembles this from its command line, the
//! `BPFTUNE_*` environment variables and an optional config file; the
//! engine only ever sees the resolved struct.

use std::path::PathBuf;
use std::time::Duration;

use crate::dedup;
use crate::netns;
use crate::registry;

/// Default tuner artifact directory.
pub const DEFAULT_PLUGIN_DIR: &str = "/usr/local/lib64/bpftune";

/// Default event ring location.
pub const DEFAULT_RING_PATH: &str = "/dev/shm/bpftune-ring";

/// Default plugin directory rescan interval.
pub const DEFAULT_RESCAN: Duration = Duration::from_millis(5000);

/// Default correlation threshold above which increases are suppressed.
pub const DEFAULT_CORR_THRESHOLD: f64 = 0.5;

/// Resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory scanned for tuner artifacts.
    pub plugin_dir: PathBuf,
    /// Backing file of the shared-memory event ring.
    pub ring_path: PathBuf,
    /// Whether per-namespace tunable writes are performed at all.
    pub netns_enabled: bool,
    /// Plugin directory rescan interval.
    pub rescan: Duration,
    /// Correlation threshold for latency-driven suppression.
    pub corr_threshold: f64,
    /// Event dedup window per (tuner, event, namespace).
    pub dedup_window: Duration,
    /// Minimum spacing between writes to one (tunable, namespace) pair.
    pub write_interval: Duration,
    /// Grace period before a destroyed namespace is evicted.
    pub netns_grace: Duration,
    /// Ring poll cadence of the supervisor loop.
    pub poll_interval: Duration,
    /// Maximum records drained per poll tick.
    pub drain_budget: usize,
    /// Redirected sysctl root; `None` means the live `/proc/sys`.
    pub sysctl_root: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            plugin_dir: PathBuf::from(DEFAULT_PLUGIN_DIR),
            ring_path: PathBuf::from(DEFAULT_RING_PATH),
            netns_enabled: true,
            rescan: DEFAULT_RESCAN,
            corr_threshold: DEFAULT_CORR_THRESHOLD,
            dedup_window: dedup::DEFAULT_WINDOW,
            write_interval: registry::MIN_WRITE_INTERVAL,
            netns_grace: netns::DEFAULT_GRACE,
            poll_interval: Duration::from_millis(25),
            drain_budget: 256,
            sysctl_root: None,
        }
    }
}

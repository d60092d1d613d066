//! Error types for the tuning engine.
//!
//! The daemon prefers degraded coverage over exiting: most of these are
//! logged and recovered locally (skip, retry, adopt). Only ring failure and
//! a plugin panic terminate the process, and that policy lives in the
//! supervisor, not here.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the tuning engine.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A tuner artifact could not be loaded.
    #[error("failed to load tuner artifact {path:?}: {source}")]
    ProbeLoadFailed {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    /// A loaded artifact is missing one of the three entry points.
    #[error("artifact {path:?} does not export '{symbol}': {source}")]
    MissingEntryPoint {
        path: PathBuf,
        symbol: &'static str,
        #[source]
        source: libloading::Error,
    },

    /// A tuner's `init` returned a non-zero status.
    #[error("tuner '{name}' init failed with status {status}")]
    InitFailed { name: String, status: i32 },

    /// A tuner failed to attach its kernel probes.
    #[error("probe attach failed for tuner '{name}': {reason}")]
    ProbeAttachFailed { name: String, reason: String },

    /// Reading a tunable from the kernel failed.
    #[error("sysctl read failed for '{name}': {source}")]
    SysctlReadFailed {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Writing a tunable to the kernel failed.
    #[error("sysctl write failed for '{name}': {source}")]
    SysctlWriteFailed {
        name: String,
        #[source]
        source: io::Error,
    },

    /// The target network namespace could not be entered.
    #[error("cannot enter network namespace for cookie {cookie}: {reason}")]
    NamespaceEnterFailed { cookie: i64, reason: String },

    /// The event ring misbehaved (bad header, corrupt cursor, I/O error).
    #[error("event ring error: {0}")]
    RingReadFailed(String),

    /// An event referenced a tuner id that is not in the roster.
    #[error("unknown tuner id {0}")]
    UnknownTunerId(u32),

    /// A write or read referenced a tunable the tuner never registered.
    #[error("tuner {tuner} has no tunable with id {tunable}")]
    UnknownTunable { tuner: u32, tunable: u32 },

    /// A host callback rejected the call (dynamic tuner path).
    #[error("host rejected the call with status {0}")]
    HostStatus(i32),

    #[error(transparent)]
    Event(#[from] bpftune_events::EventError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

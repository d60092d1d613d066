//! The tuner plugin contract.
//!
//! Every tuner, whether compiled into the daemon or loaded from a shared
//! object, exposes the same three entry points:
//!
//! - `init`: attach probes, declare tunables and scenarios
//! - `event_handler`: react to one event owned by this tuner
//! - `fini`: detach and release; must be idempotent
//!
//! Entry points receive a [`TunerContext`]: a C-layout handle carrying the
//! tuner id and a table of host callbacks ([`HostOps`]) for registration,
//! tunable I/O, correlation queries and logging. Loaded artifacts export
//! the entry points as unmangled C symbols; in-tree tuners implement
//! [`TunerPlugin`] and are wrapped by the same [`EntryPoints`] record, so
//! nothing downstream can tell the two apart.

use std::ffi::{c_char, c_int, c_void, CString};
use std::path::Path;

use libloading::Library;

use crate::error::CoreError;
use bpftune_events::TuneEvent;

/// Exported symbol names every tuner artifact must provide.
pub const SYMBOL_INIT: &[u8] = b"init";
pub const SYMBOL_FINI: &[u8] = b"fini";
pub const SYMBOL_EVENT_HANDLER: &[u8] = b"event_handler";

/// Where a tunable lives.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunableKind {
    /// Dotted name under `/proc/sys`.
    Sysctl = 0,
    /// Literal path elsewhere in procfs.
    Procfs = 1,
    /// Not file-backed; read/write attempts are rejected.
    Other = 2,
}

impl TunableKind {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => TunableKind::Sysctl,
            1 => TunableKind::Procfs,
            _ => TunableKind::Other,
        }
    }
}

/// Which way a scenario moves its tunable; drives the write-policy cap.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioDirection {
    None = 0,
    Increase = 1,
    Decrease = 2,
}

impl ScenarioDirection {
    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => ScenarioDirection::Increase,
            2 => ScenarioDirection::Decrease,
            _ => ScenarioDirection::None,
        }
    }
}

/// A tunable declared by a tuner. Immutable for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunableSpec {
    /// Per-tuner-unique id; event records reference it as `event_id`.
    pub id: u32,
    pub kind: TunableKind,
    /// Canonical name, e.g. `net.ipv4.tcp_wmem`.
    pub name: String,
    /// Whether a per-namespace overlay exists.
    pub namespaced: bool,
    /// Number of integer components, 1 to 3.
    pub arity: usize,
}

/// A named reason for a proposed change. Purely informational apart from
/// the direction, which the write cap consults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioSpec {
    pub id: u32,
    pub label: String,
    pub description: String,
    pub direction: ScenarioDirection,
}

/// C mirror of [`TunableSpec`] crossing the plugin boundary.
#[repr(C)]
pub struct RawTunableDesc {
    pub id: u32,
    pub kind: u32,
    pub namespaced: u8,
    pub arity: u32,
    pub name: *const c_char,
}

/// C mirror of [`ScenarioSpec`] crossing the plugin boundary.
#[repr(C)]
pub struct RawScenarioDesc {
    pub id: u32,
    pub direction: u32,
    pub label: *const c_char,
    pub description: *const c_char,
}

/// Outcome of a mediated tunable write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The kernel value was updated.
    Written = 0,
    /// Skipped: the per-(tunable, namespace) cooldown has not elapsed.
    SkippedCooldown = 1,
    /// Skipped: the target namespace could not be entered.
    SkippedNamespace = 2,
}

impl WriteOutcome {
    fn from_status(status: c_int) -> Option<Self> {
        match status {
            0 => Some(WriteOutcome::Written),
            1 => Some(WriteOutcome::SkippedCooldown),
            2 => Some(WriteOutcome::SkippedNamespace),
            _ => None,
        }
    }
}

/// Opaque pointer to host-owned state threaded through every callback.
pub type HostData = *mut c_void;

/// Host callbacks available to tuner entry points.
///
/// All strings are NUL-terminated and borrowed for the duration of the
/// call. Status returns follow the errno convention: zero or small
/// positive values are outcomes, negative values are failures.
#[repr(C)]
pub struct HostOps {
    pub register_tunable:
        unsafe extern "C" fn(HostData, u32, *const RawTunableDesc) -> c_int,
    pub register_scenario:
        unsafe extern "C" fn(HostData, u32, *const RawScenarioDesc) -> c_int,
    /// Reads the current kernel value into `values` (room for 3).
    pub read_tunable:
        unsafe extern "C" fn(HostData, u32, u32, i64, *mut i64) -> c_int,
    /// Requests a mediated write; the host applies cap and cooldown.
    pub write_tunable: unsafe extern "C" fn(
        HostData,
        u32,
        u32,
        u32,
        i64,
        *const i64,
        usize,
        *const c_char,
    ) -> c_int,
    pub corr_update: unsafe extern "C" fn(HostData, u32, i64, i64, i64),
    pub corr_coefficient: unsafe extern "C" fn(HostData, u32, i64) -> f64,
    pub corr_covariance: unsafe extern "C" fn(HostData, u32, i64) -> f64,
    pub log_line: unsafe extern "C" fn(HostData, u32, *const c_char),
}

/// Handle passed to every tuner entry point.
///
/// Layout is C-stable: loaded artifacts receive a pointer to this struct.
/// The safe methods below are the only sanctioned way to reach the host.
#[repr(C)]
pub struct TunerContext {
    pub tuner_id: u32,
    netns_enabled: u8,
    host: HostData,
    ops: *const HostOps,
}

impl TunerContext {
    /// Build a context for one entry-point invocation. `host` and `ops`
    /// must stay valid for the duration of the call.
    pub(crate) fn new(tuner_id: u32, netns_enabled: bool, host: HostData, ops: *const HostOps) -> Self {
        TunerContext {
            tuner_id,
            netns_enabled: netns_enabled as u8,
            host,
            ops,
        }
    }

    /// Whether per-namespace writes are enabled for this daemon.
    pub fn netns_enabled(&self) -> bool {
        self.netns_enabled != 0
    }

    fn ops(&self) -> &HostOps {
        // The host guarantees `ops` outlives the entry-point call.
        unsafe { &*self.ops }
    }

    /// Declare a tunable. Reads the current kernel value as the rollback
    /// original.
    pub fn register_tunable(&mut self, spec: &TunableSpec) -> Result<(), CoreError> {
        let name = to_cstring(&spec.name)?;
        let raw = RawTunableDesc {
            id: spec.id,
            kind: spec.kind as u32,
            namespaced: spec.namespaced as u8,
            arity: spec.arity as u32,
            name: name.as_ptr(),
        };
        let rc = unsafe { (self.ops().register_tunable)(self.host, self.tuner_id, &raw) };
        status_to_result(rc)
    }

    /// Declare a scenario for this tuner's log lines and write caps.
    pub fn register_scenario(&mut self, spec: &ScenarioSpec) -> Result<(), CoreError> {
        let label = to_cstring(&spec.label)?;
        let description = to_cstring(&spec.description)?;
        let raw = RawScenarioDesc {
            id: spec.id,
            direction: spec.direction as u32,
            label: label.as_ptr(),
            description: description.as_ptr(),
        };
        let rc = unsafe { (self.ops().register_scenario)(self.host, self.tuner_id, &raw) };
        status_to_result(rc)
    }

    /// Current kernel value of a registered tunable.
    pub fn read_tunable(&self, tunable_id: u32, netns_cookie: i64) -> Result<[i64; 3], CoreError> {
        let mut values = [0i64; 3];
        let rc = unsafe {
            (self.ops().read_tunable)(
                self.host,
                self.tuner_id,
                tunable_id,
                netns_cookie,
                values.as_mut_ptr(),
            )
        };
        status_to_result(rc)?;
        Ok(values)
    }

    /// Request a mediated write. The host caps the values against the
    /// captured original, enforces the cooldown, and performs the write in
    /// the right namespace.
    pub fn request_write(
        &mut self,
        tunable_id: u32,
        scenario_id: u32,
        netns_cookie: i64,
        values: &[i64],
        reason: &str,
    ) -> Result<WriteOutcome, CoreError> {
        let reason = to_cstring(reason)?;
        let rc = unsafe {
            (self.ops().write_tunable)(
                self.host,
                self.tuner_id,
                tunable_id,
                scenario_id,
                netns_cookie,
                values.as_ptr(),
                values.len(),
                reason.as_ptr(),
            )
        };
        WriteOutcome::from_status(rc).ok_or(CoreError::HostStatus(rc))
    }

    /// Fold one (x, y) sample into the correlation entry for the key.
    pub fn update_correlation(&mut self, tunable_id: u32, netns_cookie: i64, x: i64, y: i64) {
        unsafe { (self.ops().corr_update)(self.host, tunable_id, netns_cookie, x, y) }
    }

    /// Pearson coefficient for the key, `0.0` when unknown.
    pub fn corr_coefficient(&self, tunable_id: u32, netns_cookie: i64) -> f64 {
        unsafe { (self.ops().corr_coefficient)(self.host, tunable_id, netns_cookie) }
    }

    /// Covariance numerator for the key, `0.0` when unknown.
    pub fn corr_covariance(&self, tunable_id: u32, netns_cookie: i64) -> f64 {
        unsafe { (self.ops().corr_covariance)(self.host, tunable_id, netns_cookie) }
    }

    /// Emit a structured log line through the host.
    pub fn log(&self, level: log::Level, msg: &str) {
        let Ok(msg) = CString::new(msg) else { return };
        unsafe { (self.ops().log_line)(self.host, level as u32, msg.as_ptr()) }
    }
}

fn to_cstring(s: &str) -> Result<CString, CoreError> {
    CString::new(s).map_err(|_| CoreError::HostStatus(-libc::EINVAL))
}

fn status_to_result(rc: c_int) -> Result<(), CoreError> {
    if rc == 0 {
        Ok(())
    } else {
        Err(CoreError::HostStatus(rc))
    }
}

/// The contract in-tree tuners implement. Loaded artifacts satisfy the
/// same contract through their exported C symbols.
pub trait TunerPlugin: Send {
    /// Stable tuner name; must match what the host derived for artifacts.
    fn name(&self) -> &str;

    /// Attach probes, declare tunables and scenarios. Runs to completion
    /// before any event is delivered.
    fn init(&mut self, ctx: &mut TunerContext) -> Result<(), CoreError>;

    /// Handle one event whose `tuner_id` matches this tuner. Bounded work
    /// only: sysctl access, correlation updates and logging.
    fn event_handler(&mut self, ctx: &mut TunerContext, event: &TuneEvent);

    /// Detach and release. Idempotent; the host also rolls back every
    /// tunable this tuner wrote.
    fn fini(&mut self, ctx: &mut TunerContext);
}

pub type InitFn = unsafe extern "C" fn(*mut TunerContext) -> c_int;
pub type FiniFn = unsafe extern "C" fn(*mut TunerContext);
pub type EventHandlerFn = unsafe extern "C" fn(*mut TunerContext, *const TuneEvent);

/// Entry points resolved from a loaded artifact. The library handle keeps
/// the symbols alive.
pub struct DynamicEntryPoints {
    _lib: Library,
    init: libloading::os::unix::Symbol<InitFn>,
    fini: libloading::os::unix::Symbol<FiniFn>,
    event_handler: libloading::os::unix::Symbol<EventHandlerFn>,
}

impl DynamicEntryPoints {
    /// Load an artifact and resolve its three entry points.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let lib = unsafe { Library::new(path) }.map_err(|source| CoreError::ProbeLoadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let missing = |symbol: &'static str| {
            move |source| CoreError::MissingEntryPoint {
                path: path.to_path_buf(),
                symbol,
                source,
            }
        };
        let init = unsafe {
            lib.get::<InitFn>(SYMBOL_INIT)
                .map_err(missing("init"))?
                .into_raw()
        };
        let fini = unsafe {
            lib.get::<FiniFn>(SYMBOL_FINI)
                .map_err(missing("fini"))?
                .into_raw()
        };
        let event_handler = unsafe {
            lib.get::<EventHandlerFn>(SYMBOL_EVENT_HANDLER)
                .map_err(missing("event_handler"))?
                .into_raw()
        };
        Ok(DynamicEntryPoints {
            _lib: lib,
            init,
            fini,
            event_handler,
        })
    }
}

/// Uniform invocation record for a tuner, static or loaded.
pub enum EntryPoints {
    Static(Box<dyn TunerPlugin>),
    Dynamic(DynamicEntryPoints),
}

impl EntryPoints {
    pub fn init(&mut self, ctx: &mut TunerContext) -> Result<(), CoreError> {
        match self {
            EntryPoints::Static(plugin) => plugin.init(ctx),
            EntryPoints::Dynamic(entry) => {
                let rc = unsafe { (*entry.init)(ctx as *mut TunerContext) };
                status_to_result(rc)
            }
        }
    }

    pub fn event_handler(&mut self, ctx: &mut TunerContext, event: &TuneEvent) {
        match self {
            EntryPoints::Static(plugin) => plugin.event_handler(ctx, event),
            EntryPoints::Dynamic(entry) => unsafe {
                (*entry.event_handler)(ctx as *mut TunerContext, event as *const TuneEvent)
            },
        }
    }

    pub fn fini(&mut self, ctx: &mut TunerContext) {
        match self {
            EntryPoints::Static(plugin) => plugin.fini(ctx),
            EntryPoints::Dynamic(entry) => unsafe { (*entry.fini)(ctx as *mut TunerContext) },
        }
    }
}

/// Lifecycle state of a roster entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunerState {
    /// Artifact loaded, `init` not yet run.
    Loaded,
    /// `init` succeeded.
    Initialized,
    /// Probes attached; the steady state.
    Attached,
    /// `init` failed; retried only when the artifact changes on disk.
    Failed,
    /// `fini` ran; the id stays retired.
    Gone,
}

impl TunerState {
    /// Whether events may be delivered in this state.
    pub fn accepts_events(self) -> bool {
        matches!(self, TunerState::Initialized | TunerState::Attached)
    }
}

/// Stable tuner name derived from an artifact path:
/// `libtcp_buffer_tuner.so` and `tcp_buffer_tuner.so` both name the
/// `tcp_buffer` tuner.
pub fn artifact_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = stem.strip_prefix("lib").unwrap_or(&stem);
    let stem = stem.strip_suffix("_tuner").unwrap_or(stem);
    stem.to_string()
}

/// Decode a level forwarded through [`HostOps::log_line`].
pub(crate) fn level_from_raw(raw: u32) -> log::Level {
    match raw {
        1 => log::Level::Error,
        2 => log::Level::Warn,
        3 => log::Level::Info,
        4 => log::Level::Debug,
        _ => log::Level::Trace,
    }
}

impl RawTunableDesc {
    /// Owned view of a descriptor received over the C boundary.
    ///
    /// # Safety
    /// `name` must be a valid NUL-terminated string for the duration of
    /// the call.
    pub unsafe fn to_spec(&self) -> TunableSpec {
        TunableSpec {
            id: self.id,
            kind: TunableKind::from_raw(self.kind),
            name: cstr_lossy(self.name),
            namespaced: self.namespaced != 0,
            arity: (self.arity as usize).clamp(1, 3),
        }
    }
}

impl RawScenarioDesc {
    /// Owned view of a descriptor received over the C boundary.
    ///
    /// # Safety
    /// `label` and `description` must be valid NUL-terminated strings for
    /// the duration of the call.
    pub unsafe fn to_spec(&self) -> ScenarioSpec {
        ScenarioSpec {
            id: self.id,
            label: cstr_lossy(self.label),
            description: cstr_lossy(self.description),
            direction: ScenarioDirection::from_raw(self.direction),
        }
    }
}

unsafe fn cstr_lossy(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned()
}

//! The tuner host: roster, lifecycle and event dispatch.
//!
//! The host owns a flat array of tuner records plus the shared engine
//! state (registry, correlation map, namespace table, dedup filter). Tuner
//! entry points reach the engine exclusively through the C-ABI callback
//! table, so in-tree and dynamically loaded tuners are indistinguishable
//! past this point.
//!
//! Ordering guarantees enforced here:
//!
//! - `init` runs to completion before any event is delivered
//! - after `fini`, backlogged events for the tuner are discarded silently
//! - tuner ids are monotonic and never reused within a process
//! - on shutdown, tuners are finalized in reverse load order and every
//!   tunable they wrote is rolled back

use std::collections::HashMap;
use std::ffi::{c_char, c_int, CStr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use log::{debug, error, info, warn};

use crate::config::Config;
use crate::corr::CorrMap;
use crate::dedup::DedupFilter;
use crate::error::CoreError;
use crate::netns::{Admission, NamespaceTracker, NamespacedSysctl};
use crate::registry::TunableRegistry;
use crate::sysctl::{ScopedSysctl, Sysctl};
use crate::tuner::{
    artifact_name, level_from_raw, DynamicEntryPoints, EntryPoints, HostData, HostOps,
    RawScenarioDesc, RawTunableDesc, ScenarioDirection, ScenarioSpec, TunerContext, TunerPlugin,
    TunerState,
};
use bpftune_events::{
    TuneEvent, NETNS_SCENARIO_CREATE, NETNS_SCENARIO_DESTROY, TUNER_ID_HOST,
};

/// Budget for one tuner's `fini`; overruns are logged and the tuner is
/// abandoned (its rollback may be incomplete).
const FINI_TIMEOUT: Duration = Duration::from_secs(2);

/// Engine state shared with tuner entry points through [`HostOps`].
pub struct HostShared {
    pub registry: TunableRegistry,
    pub corr: CorrMap,
    pub netns: NamespaceTracker,
    pub dedup: DedupFilter,
    scenarios: HashMap<(u32, u32), ScenarioSpec>,
    netns_enabled: bool,
}

impl HostShared {
    /// Scenario registered by a tuner, if any.
    pub fn scenario(&self, tuner_id: u32, scenario_id: u32) -> Option<&ScenarioSpec> {
        self.scenarios.get(&(tuner_id, scenario_id))
    }
}

/// Where a tuner came from.
enum TunerOrigin {
    Static,
    Artifact { path: PathBuf },
}

/// One roster entry. Records are never removed; retired tuners stay with
/// state `Gone` so their ids remain retired.
pub struct TunerRecord {
    pub id: u32,
    pub name: String,
    pub state: TunerState,
    origin: TunerOrigin,
    entry: Option<EntryPoints>,
}

/// What happened to one event handed to [`TunerHost::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Delivered to the owning tuner's handler.
    Delivered,
    /// Consumed by the host itself (namespace lifecycle).
    HostHandled,
    /// Suppressed by the dedup window.
    Deduplicated,
    /// The namespace cookie was evicted.
    DroppedEvicted,
    /// No roster entry owns this tuner id.
    DroppedUnknownTuner,
    /// The owning tuner no longer accepts events (backlog after fini).
    DroppedRetired,
    /// The handler panicked. Process-fatal; the supervisor exits.
    PluginPanicked,
}

/// The tuner host.
pub struct TunerHost {
    shared: Box<HostShared>,
    tuners: Vec<TunerRecord>,
    next_tuner_id: u32,
    /// Artifacts whose load or init failed, keyed to the mtime observed at
    /// failure; retried only when the file changes.
    failed: HashMap<PathBuf, Option<SystemTime>>,
    /// Rate limiting for unknown-tuner warnings.
    unknown_warned: HashMap<u32, Instant>,
}

impl TunerHost {
    /// Host over the live kernel surface (or the configured sysctl root).
    pub fn new(config: &Config) -> Self {
        let sysctl = match &config.sysctl_root {
            Some(root) => Sysctl::with_root(root),
            None => Sysctl::new(),
        };
        Self::with_io(config, Box::new(NamespacedSysctl::new(sysctl)))
    }

    /// Host with a caller-provided sysctl backend (tests).
    pub fn with_io(config: &Config, io: Box<dyn ScopedSysctl>) -> Self {
        TunerHost {
            shared: Box::new(HostShared {
                registry: TunableRegistry::new(io, config.netns_enabled)
                    .with_write_interval(config.write_interval),
                corr: CorrMap::new(),
                netns: NamespaceTracker::new(config.netns_grace),
                dedup: DedupFilter::new(config.dedup_window),
                scenarios: HashMap::new(),
                netns_enabled: config.netns_enabled,
            }),
            tuners: Vec::new(),
            next_tuner_id: TUNER_ID_HOST + 1,
            failed: HashMap::new(),
            unknown_warned: HashMap::new(),
        }
    }

    /// Register an in-tree tuner. Same admission path as loaded artifacts.
    pub fn register_static(&mut self, plugin: Box<dyn TunerPlugin>) -> Result<u32, CoreError> {
        let name = plugin.name().to_string();
        self.admit(name, TunerOrigin::Static, EntryPoints::Static(plugin))
    }

    /// Load one artifact, resolve its entry points and run `init`.
    pub fn load_artifact(&mut self, path: &Path) -> Result<u32, CoreError> {
        let entry = match DynamicEntryPoints::load(path) {
            Ok(entry) => entry,
            Err(e) => {
                self.failed.insert(path.to_path_buf(), mtime_of(path));
                return Err(e);
            }
        };
        let name = artifact_name(path);
        let result = self.admit(
            name,
            TunerOrigin::Artifact {
                path: path.to_path_buf(),
            },
            EntryPoints::Dynamic(entry),
        );
        if result.is_err() {
            self.failed.insert(path.to_path_buf(), mtime_of(path));
        }
        result
    }

    fn admit(
        &mut self,
        name: String,
        origin: TunerOrigin,
        entry: EntryPoints,
    ) -> Result<u32, CoreError> {
        let id = self.next_tuner_id;
        self.next_tuner_id += 1;

        let mut record = TunerRecord {
            id,
            name,
            state: TunerState::Loaded,
            origin,
            entry: Some(entry),
        };

        let shared_ptr: *mut HostShared = &mut *self.shared;
        let mut ctx = TunerContext::new(
            id,
            self.shared.netns_enabled,
            shared_ptr as HostData,
            &HOST_OPS,
        );
        let result = record
            .entry
            .as_mut()
            .expect("entry set above")
            .init(&mut ctx);

        match result {
            Ok(()) => {
                record.state = TunerState::Attached;
                info!(
                    "tuner '{}' (id {}) initialized with {} tunables",
                    record.name,
                    id,
                    self.shared.registry.descriptor_count(id)
                );
                self.tuners.push(record);
                Ok(id)
            }
            Err(e) => {
                let status = match &e {
                    CoreError::HostStatus(rc) => *rc,
                    _ => -1,
                };
                warn!("init of tuner '{}' failed: {}", record.name, e);
                record.state = TunerState::Failed;
                record.entry = None;
                // A failed tuner never has tunables registered.
                self.shared.registry.remove_tuner(id);
                self.shared.scenarios.retain(|(tid, _), _| *tid != id);
                let name = record.name.clone();
                self.tuners.push(record);
                Err(CoreError::InitFailed { name, status })
            }
        }
    }

    /// Run one event through dedup, the namespace filter and dispatch.
    pub fn dispatch(&mut self, event: &TuneEvent) -> DispatchOutcome {
        if !self
            .shared
            .dedup
            .admit(event.tuner_id, event.event_id, event.netns_cookie)
        {
            return DispatchOutcome::Deduplicated;
        }

        let now = Instant::now();
        if event.tuner_id == TUNER_ID_HOST {
            match event.scenario_id {
                NETNS_SCENARIO_CREATE => {
                    self.shared.netns.observe_create(event.netns_cookie, now);
                }
                NETNS_SCENARIO_DESTROY => {
                    self.shared.netns.observe_destroy(event.netns_cookie, now);
                    self.shared.registry.forget_namespace(event.netns_cookie);
                }
                other => debug!("ignoring host event with scenario {}", other),
            }
            return DispatchOutcome::HostHandled;
        }

        if self.shared.netns.observe(event.netns_cookie, now) == Admission::Dropped {
            debug!(
                "dropping event for evicted netns cookie {}",
                event.netns_cookie
            );
            return DispatchOutcome::DroppedEvicted;
        }

        let Some(idx) = self.tuners.iter().position(|t| t.id == event.tuner_id) else {
            self.warn_unknown(event.tuner_id, now);
            return DispatchOutcome::DroppedUnknownTuner;
        };
        if !self.tuners[idx].state.accepts_events() {
            return DispatchOutcome::DroppedRetired;
        }

        debug!(
            "event (scenario {}) for tuner {}",
            event.scenario_id, self.tuners[idx].name
        );

        let shared_ptr: *mut HostShared = &mut *self.shared;
        let netns_enabled = self.shared.netns_enabled;
        let record = &mut self.tuners[idx];
        let mut ctx = TunerContext::new(record.id, netns_enabled, shared_ptr as HostData, &HOST_OPS);
        let entry = record.entry.as_mut().expect("live tuner has entry points");
        let panicked =
            catch_unwind(AssertUnwindSafe(|| entry.event_handler(&mut ctx, event))).is_err();
        if panicked {
            error!("tuner '{}' crashed in event_handler", record.name);
            record.state = TunerState::Failed;
            return DispatchOutcome::PluginPanicked;
        }
        DispatchOutcome::Delivered
    }

    fn warn_unknown(&mut self, tuner_id: u32, now: Instant) {
        let stale = self
            .unknown_warned
            .get(&tuner_id)
            .map_or(true, |last| now.duration_since(*last) >= Duration::from_secs(1));
        if stale {
            warn!("dropping event for unknown tuner id {}", tuner_id);
            self.unknown_warned.insert(tuner_id, now);
        }
    }

    /// Reconcile the roster against the plugin directory: load new
    /// artifacts, retry changed failures, finalize removed ones.
    pub fn rescan(&mut self, dir: &Path) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("plugin directory {:?} not readable: {}", dir, e);
                return;
            }
        };
        let present: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "so"))
            .collect();

        // Artifacts that disappeared get fini'd and rolled back.
        let removed: Vec<usize> = self
            .tuners
            .iter()
            .enumerate()
            .filter(|(_, t)| {
                t.state.accepts_events()
                    && matches!(&t.origin, TunerOrigin::Artifact { path } if !present.contains(path))
            })
            .map(|(idx, _)| idx)
            .collect();
        for idx in removed {
            info!("tuner artifact for '{}' disappeared", self.tuners[idx].name);
            self.finish(idx);
        }

        for path in present {
            if self.is_active_artifact(&path) {
                continue;
            }
            if let Some(failed_mtime) = self.failed.get(&path) {
                if *failed_mtime == mtime_of(&path) {
                    continue;
                }
                self.failed.remove(&path);
            }
            match self.load_artifact(&path) {
                Ok(id) => debug!("artifact {:?} loaded as tuner {}", path, id),
                Err(e) => warn!("{}", e),
            }
        }
    }

    fn is_active_artifact(&self, path: &Path) -> bool {
        self.tuners.iter().any(|t| {
            t.state.accepts_events()
                && matches!(&t.origin, TunerOrigin::Artifact { path: p } if p == path)
        })
    }

    /// Finalize one tuner: fini, rollback, release. Idempotent.
    fn finish(&mut self, idx: usize) {
        if !self.tuners[idx].state.accepts_events() {
            self.tuners[idx].state = TunerState::Gone;
            self.tuners[idx].entry = None;
            return;
        }

        let shared_ptr: *mut HostShared = &mut *self.shared;
        let netns_enabled = self.shared.netns_enabled;
        let record = &mut self.tuners[idx];
        let mut ctx = TunerContext::new(record.id, netns_enabled, shared_ptr as HostData, &HOST_OPS);
        if let Some(entry) = record.entry.as_mut() {
            let started = Instant::now();
            let panicked = catch_unwind(AssertUnwindSafe(|| entry.fini(&mut ctx))).is_err();
            if panicked {
                warn!("tuner '{}' panicked in fini; abandoning it", record.name);
            }
            let elapsed = started.elapsed();
            if elapsed > FINI_TIMEOUT {
                warn!(
                    "fini of tuner '{}' took {:?}; rollback may be incomplete",
                    record.name, elapsed
                );
            }
        }
        info!("fini tuner {}", record.name);

        let id = record.id;
        record.state = TunerState::Gone;
        record.entry = None;

        self.shared.registry.rollback(id);
        let writes = self.shared.registry.writes_for(id);
        if writes > 0 {
            info!("tuner '{}' retired after {} writes", self.tuners[idx].name, writes);
        }
        self.shared.registry.remove_tuner(id);
        self.shared.scenarios.retain(|(tid, _), _| *tid != id);
    }

    /// Finalize every live tuner in reverse load order.
    pub fn shutdown(&mut self) {
        let live = self.live_count();
        if live > 0 {
            info!("finalizing {} tuners", live);
        }
        for idx in (0..self.tuners.len()).rev() {
            self.finish(idx);
        }
    }

    /// Age the namespace table.
    pub fn sweep_namespaces(&mut self) {
        self.shared.netns.sweep(Instant::now());
    }

    /// Number of tuners currently accepting events.
    pub fn live_count(&self) -> usize {
        self.tuners
            .iter()
            .filter(|t| t.state.accepts_events())
            .count()
    }

    /// Roster entry by name (latest load wins).
    pub fn tuner_named(&self, name: &str) -> Option<&TunerRecord> {
        self.tuners.iter().rev().find(|t| t.name == name)
    }

    /// Shared engine state, for the supervisor and tests.
    pub fn shared(&self) -> &HostShared {
        &self.shared
    }

    pub fn shared_mut(&mut self) -> &mut HostShared {
        &mut self.shared
    }
}

fn mtime_of(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

// --- C-ABI callbacks handed to every tuner entry point -------------------

static HOST_OPS: HostOps = HostOps {
    register_tunable: host_register_tunable,
    register_scenario: host_register_scenario,
    read_tunable: host_read_tunable,
    write_tunable: host_write_tunable,
    corr_update: host_corr_update,
    corr_coefficient: host_corr_coefficient,
    corr_covariance: host_corr_covariance,
    log_line: host_log_line,
};

unsafe fn shared_from<'a>(host: HostData) -> Option<&'a mut HostShared> {
    (host as *mut HostShared).as_mut()
}

unsafe extern "C" fn host_register_tunable(
    host: HostData,
    tuner_id: u32,
    desc: *const RawTunableDesc,
) -> c_int {
    let (Some(shared), Some(desc)) = (shared_from(host), desc.as_ref()) else {
        return -libc::EINVAL;
    };
    let spec = desc.to_spec();
    match shared.registry.register(tuner_id, spec.clone()) {
        Ok(()) => 0,
        Err(e) => {
            // Unreadable tunables are skipped, not fatal: the tuner keeps
            // running with whatever else it registered.
            warn!("tuner {}: skipping tunable '{}': {}", tuner_id, spec.name, e);
            0
        }
    }
}

unsafe extern "C" fn host_register_scenario(
    host: HostData,
    tuner_id: u32,
    desc: *const RawScenarioDesc,
) -> c_int {
    let (Some(shared), Some(desc)) = (shared_from(host), desc.as_ref()) else {
        return -libc::EINVAL;
    };
    let spec = desc.to_spec();
    debug!("tuner {}: scenario {} '{}'", tuner_id, spec.id, spec.label);
    shared.scenarios.insert((tuner_id, spec.id), spec);
    0
}

unsafe extern "C" fn host_read_tunable(
    host: HostData,
    tuner_id: u32,
    tunable_id: u32,
    netns_cookie: i64,
    values: *mut i64,
) -> c_int {
    let Some(shared) = shared_from(host) else {
        return -libc::EINVAL;
    };
    if values.is_null() {
        return -libc::EINVAL;
    }
    match shared.registry.read(tuner_id, tunable_id, netns_cookie) {
        Ok(current) => {
            std::ptr::copy_nonoverlapping(current.as_ptr(), values, 3);
            0
        }
        Err(e) => {
            warn!("read of tunable {} for tuner {} failed: {}", tunable_id, tuner_id, e);
            -libc::EIO
        }
    }
}

#[allow(clippy::too_many_arguments)]
unsafe extern "C" fn host_write_tunable(
    host: HostData,
    tuner_id: u32,
    tunable_id: u32,
    scenario_id: u32,
    netns_cookie: i64,
    values: *const i64,
    arity: usize,
    reason: *const c_char,
) -> c_int {
    let Some(shared) = shared_from(host) else {
        return -libc::EINVAL;
    };
    if values.is_null() || arity == 0 || arity > 3 {
        return -libc::EINVAL;
    }
    let values = std::slice::from_raw_parts(values, arity);

    let (label, direction) = match shared.scenarios.get(&(tuner_id, scenario_id)) {
        Some(s) => (s.label.clone(), s.direction),
        None => (format!("scenario {}", scenario_id), ScenarioDirection::None),
    };
    if !reason.is_null() {
        if let Ok(reason) = CStr::from_ptr(reason).to_str() {
            if !reason.is_empty() {
                debug!("tuner {}: {}", tuner_id, reason);
            }
        }
    }

    match shared.registry.write(
        tuner_id,
        tunable_id,
        &label,
        direction,
        netns_cookie,
        values,
        Instant::now(),
    ) {
        Ok(outcome) => outcome as c_int,
        Err(e) => {
            warn!(
                "write of tunable {} for tuner {} failed: {}",
                tunable_id, tuner_id, e
            );
            match e {
                CoreError::UnknownTunable { .. } => -libc::ENOENT,
                CoreError::HostStatus(rc) => rc,
                _ => -libc::EIO,
            }
        }
    }
}

unsafe extern "C" fn host_corr_update(host: HostData, tunable_id: u32, netns_cookie: i64, x: i64, y: i64) {
    if let Some(shared) = shared_from(host) {
        shared.corr.update(tunable_id, netns_cookie, x, y);
    }
}

unsafe extern "C" fn host_corr_coefficient(host: HostData, tunable_id: u32, netns_cookie: i64) -> f64 {
    match shared_from(host) {
        Some(shared) => shared.corr.coefficient(tunable_id, netns_cookie),
        None => 0.0,
    }
}

unsafe extern "C" fn host_corr_covariance(host: HostData, tunable_id: u32, netns_cookie: i64) -> f64 {
    match shared_from(host) {
        Some(shared) => shared.corr.covariance(tunable_id, netns_cookie),
        None => 0.0,
    }
}

unsafe extern "C" fn host_log_line(_host: HostData, level: u32, msg: *const c_char) {
    if msg.is_null() {
        return;
    }
    if let Ok(msg) = CStr::from_ptr(msg).to_str() {
        log::log!(level_from_raw(level), "{}", msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuner::{TunableKind, TunableSpec};
    use bpftune_events::TunableUpdate;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    const WMEM: &str = "net.ipv4.tcp_wmem";
    const SCENARIO_GROW: u32 = 1;

    /// In-tree tuner that registers one tunable and grows it on events.
    struct GrowingTuner {
        events: Arc<AtomicUsize>,
    }

    impl TunerPlugin for GrowingTuner {
        fn name(&self) -> &str {
            "growing"
        }

        fn init(&mut self, ctx: &mut TunerContext) -> Result<(), CoreError> {
            ctx.register_tunable(&TunableSpec {
                id: 0,
                kind: TunableKind::Sysctl,
                name: WMEM.to_string(),
                namespaced: true,
                arity: 3,
            })?;
            ctx.register_scenario(&crate::tuner::ScenarioSpec {
                id: SCENARIO_GROW,
                label: "need to increase buffer size".to_string(),
                description: "socket is limited by its send buffer".to_string(),
                direction: ScenarioDirection::Increase,
            })?;
            Ok(())
        }

        fn event_handler(&mut self, ctx: &mut TunerContext, event: &TuneEvent) {
            self.events.fetch_add(1, Ordering::SeqCst);
            let update = &event.updates[0];
            let _ = ctx.request_write(
                update.id,
                event.scenario_id,
                event.netns_cookie,
                &update.new,
                "kernel reported buffer exhaustion",
            );
        }

        fn fini(&mut self, _ctx: &mut TunerContext) {}
    }

    /// Tuner whose init always fails.
    struct BrokenTuner;

    impl TunerPlugin for BrokenTuner {
        fn name(&self) -> &str {
            "broken"
        }
        fn init(&mut self, _ctx: &mut TunerContext) -> Result<(), CoreError> {
            Err(CoreError::ProbeAttachFailed {
                name: "broken".to_string(),
                reason: "no such kernel symbol".to_string(),
            })
        }
        fn event_handler(&mut self, _ctx: &mut TunerContext, _event: &TuneEvent) {
            panic!("must never run");
        }
        fn fini(&mut self, _ctx: &mut TunerContext) {}
    }

    fn test_host(root: &Path) -> TunerHost {
        // Zero dedup window: these tests fire identical events faster than
        // any real kernel burst and check the stages behind the filter.
        test_host_with_window(root, Duration::ZERO)
    }

    fn test_host_with_window(root: &Path, dedup_window: Duration) -> TunerHost {
        let sysctl = Sysctl::with_root(root);
        sysctl
            .seed(TunableKind::Sysctl, WMEM, &[4096, 16384, 65536])
            .unwrap();
        let config = Config {
            netns_enabled: false,
            dedup_window,
            sysctl_root: Some(root.to_path_buf()),
            ..Config::default()
        };
        TunerHost::new(&config)
    }

    fn grow_event(tuner_id: u32, new_max: i64) -> TuneEvent {
        let mut event = TuneEvent {
            tuner_id,
            scenario_id: SCENARIO_GROW,
            event_id: 0,
            pid: 1,
            ..Default::default()
        };
        event.updates[0] =
            TunableUpdate::from_values(0, &[4096, 16384, 65536], &[4096, 16384, new_max]).unwrap();
        event
    }

    #[test]
    fn test_static_tuner_full_lifecycle() {
        let dir = tempdir().unwrap();
        let mut host = test_host(dir.path());
        let sysctl = Sysctl::with_root(dir.path());

        let events = Arc::new(AtomicUsize::new(0));
        let id = host
            .register_static(Box::new(GrowingTuner {
                events: Arc::clone(&events),
            }))
            .unwrap();
        assert_eq!(id, 1);
        assert_eq!(host.live_count(), 1);

        // The event flows through the trampolines into a capped write.
        let outcome = host.dispatch(&grow_event(id, 131072));
        assert_eq!(outcome, DispatchOutcome::Delivered);
        assert_eq!(events.load(Ordering::SeqCst), 1);
        assert_eq!(
            sysctl.read(TunableKind::Sysctl, WMEM, 3).unwrap(),
            [4096, 16384, 131072]
        );

        // Teardown rolls the tunable back and retires the id.
        host.shutdown();
        assert_eq!(host.live_count(), 0);
        assert_eq!(
            sysctl.read(TunableKind::Sysctl, WMEM, 3).unwrap(),
            [4096, 16384, 65536]
        );

        // Backlogged events for the retired tuner are discarded silently.
        let outcome = host.dispatch(&grow_event(id, 262144));
        assert_eq!(outcome, DispatchOutcome::DroppedRetired);
        assert_eq!(events.load(Ordering::SeqCst), 1);

        // Shutdown twice is as good as once.
        host.shutdown();
    }

    #[test]
    fn test_dedup_window_applies_before_dispatch() {
        let dir = tempdir().unwrap();
        // A generous window so back-to-back dispatches land inside it.
        let mut host = test_host_with_window(dir.path(), Duration::from_secs(5));
        let events = Arc::new(AtomicUsize::new(0));
        let id = host
            .register_static(Box::new(GrowingTuner {
                events: Arc::clone(&events),
            }))
            .unwrap();

        assert_eq!(host.dispatch(&grow_event(id, 131072)), DispatchOutcome::Delivered);
        assert_eq!(
            host.dispatch(&grow_event(id, 131072)),
            DispatchOutcome::Deduplicated
        );
        assert_eq!(events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_init_marks_tuner_failed() {
        let dir = tempdir().unwrap();
        let mut host = test_host(dir.path());

        let err = host.register_static(Box::new(BrokenTuner)).unwrap_err();
        assert!(matches!(err, CoreError::InitFailed { .. }));
        assert_eq!(host.live_count(), 0);
        assert_eq!(
            host.tuner_named("broken").map(|t| t.state),
            Some(TunerState::Failed)
        );

        // Events for the failed tuner are dropped without reaching it.
        assert_eq!(
            host.dispatch(&grow_event(1, 131072)),
            DispatchOutcome::DroppedRetired
        );
    }

    #[test]
    fn test_ids_are_monotonic_and_never_reused() {
        let dir = tempdir().unwrap();
        let mut host = test_host(dir.path());

        let a = host
            .register_static(Box::new(GrowingTuner {
                events: Arc::new(AtomicUsize::new(0)),
            }))
            .unwrap();
        host.shutdown();
        let b = host
            .register_static(Box::new(GrowingTuner {
                events: Arc::new(AtomicUsize::new(0)),
            }))
            .unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_namespace_lifecycle_events_are_host_handled() {
        let dir = tempdir().unwrap();
        let mut host = test_host(dir.path());

        let create = TuneEvent {
            tuner_id: TUNER_ID_HOST,
            scenario_id: NETNS_SCENARIO_CREATE,
            event_id: 0,
            pid: 0,
            netns_cookie: 555,
            ..Default::default()
        };
        assert_eq!(host.dispatch(&create), DispatchOutcome::HostHandled);
        assert_eq!(
            host.shared().netns.state(555),
            Some(crate::netns::NsState::Live)
        );

        let destroy = TuneEvent {
            scenario_id: NETNS_SCENARIO_DESTROY,
            event_id: 1,
            ..create
        };
        assert_eq!(host.dispatch(&destroy), DispatchOutcome::HostHandled);
        assert_eq!(
            host.shared().netns.state(555),
            Some(crate::netns::NsState::Tombstoned)
        );
    }

    #[test]
    fn test_unknown_tuner_id_drops_event() {
        let dir = tempdir().unwrap();
        let mut host = test_host(dir.path());
        assert_eq!(
            host.dispatch(&grow_event(42, 131072)),
            DispatchOutcome::DroppedUnknownTuner
        );
    }

    #[test]
    fn test_panicking_handler_is_process_fatal() {
        struct PanickingTuner;
        impl TunerPlugin for PanickingTuner {
            fn name(&self) -> &str {
                "panicky"
            }
            fn init(&mut self, _ctx: &mut TunerContext) -> Result<(), CoreError> {
                Ok(())
            }
            fn event_handler(&mut self, _ctx: &mut TunerContext, _event: &TuneEvent) {
                panic!("plugin bug");
            }
            fn fini(&mut self, _ctx: &mut TunerContext) {}
        }

        let dir = tempdir().unwrap();
        let mut host = test_host(dir.path());
        let id = host.register_static(Box::new(PanickingTuner)).unwrap();
        assert_eq!(
            host.dispatch(&grow_event(id, 131072)),
            DispatchOutcome::PluginPanicked
        );
    }
}

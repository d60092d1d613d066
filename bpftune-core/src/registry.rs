//! Tunable registry and write policy.
//!
//! The registry owns the authoritative view of every tunable a tuner has
//! claimed and mediates every write:
//!
//! - the first touch of a (tunable, namespace) pair captures the kernel
//!   value as the rollback original
//! - increases are capped at `original * 4`, decreases at `original / 4`
//! - writes to the same (tunable, namespace) are at least one second apart
//! - if an external administrator changed the value since our last write,
//!   their value is adopted as the new original and we yield precedence
//! - tearing a tuner down restores the original of everything it wrote,
//!   bypassing cap and cooldown

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::CoreError;
use crate::sysctl::ScopedSysctl;
use crate::tuner::{ScenarioDirection, TunableSpec, WriteOutcome};
use bpftune_events::NETNS_COOKIE_UNSUPPORTED;

/// Upper cap: an increase may not exceed `original * MAX_GROWTH_FACTOR`.
pub const MAX_GROWTH_FACTOR: i64 = 4;

/// Lower cap: a decrease may not go below `original / MAX_SHRINK_FACTOR`.
pub const MAX_SHRINK_FACTOR: i64 = 4;

/// Minimum spacing between writes to one (tunable, namespace) pair.
pub const MIN_WRITE_INTERVAL: Duration = Duration::from_secs(1);

/// Per-(tuner, tunable, namespace) value bookkeeping.
#[derive(Debug, Clone)]
pub struct TunableState {
    /// Kernel value at first touch; the rollback target.
    pub original: [i64; 3],
    /// Last value we wrote or read.
    pub current: [i64; 3],
    pub last_write: Option<Instant>,
    pub write_count: u64,
    written: bool,
}

/// State key: (tuner id, tunable id, namespace cookie). Global state uses
/// the sentinel cookie.
type StateKey = (u32, u32, i64);

/// The authoritative tunable table.
pub struct TunableRegistry {
    io: Box<dyn ScopedSysctl>,
    netns_enabled: bool,
    min_write_interval: Duration,
    descs: HashMap<(u32, u32), TunableSpec>,
    states: HashMap<StateKey, TunableState>,
}

impl TunableRegistry {
    pub fn new(io: Box<dyn ScopedSysctl>, netns_enabled: bool) -> Self {
        TunableRegistry {
            io,
            netns_enabled,
            min_write_interval: MIN_WRITE_INTERVAL,
            descs: HashMap::new(),
            states: HashMap::new(),
        }
    }

    /// Override the write cooldown.
    pub fn with_write_interval(mut self, interval: Duration) -> Self {
        self.min_write_interval = interval;
        self
    }

    /// Register one descriptor for a tuner, capturing the global
    /// namespace's value as original. Per-namespace capture is deferred to
    /// the first observation of each cookie.
    pub fn register(&mut self, tuner_id: u32, spec: TunableSpec) -> Result<(), CoreError> {
        let values = self.io.read(None, spec.kind, &spec.name, spec.arity)?;
        debug!(
            "registered tunable '{}' for tuner {} with original ({})",
            spec.name,
            tuner_id,
            fmt_tuple(&values[..spec.arity])
        );
        self.states.insert(
            (tuner_id, spec.id, NETNS_COOKIE_UNSUPPORTED),
            TunableState {
                original: values,
                current: values,
                last_write: None,
                write_count: 0,
                written: false,
            },
        );
        self.descs.insert((tuner_id, spec.id), spec);
        Ok(())
    }

    /// Current kernel value of a registered tunable in the given namespace.
    pub fn read(
        &mut self,
        tuner_id: u32,
        tunable_id: u32,
        netns_cookie: i64,
    ) -> Result<[i64; 3], CoreError> {
        let spec = self
            .descs
            .get(&(tuner_id, tunable_id))
            .ok_or(CoreError::UnknownTunable {
                tuner: tuner_id,
                tunable: tunable_id,
            })?
            .clone();
        let scope = self.scope_for(&spec, netns_cookie);
        self.io.read(scope, spec.kind, &spec.name, spec.arity)
    }

    /// Mediated write. See the module docs for the policy applied.
    #[allow(clippy::too_many_arguments)]
    pub fn write(
        &mut self,
        tuner_id: u32,
        tunable_id: u32,
        scenario_label: &str,
        direction: ScenarioDirection,
        netns_cookie: i64,
        values: &[i64],
        now: Instant,
    ) -> Result<WriteOutcome, CoreError> {
        let spec = self
            .descs
            .get(&(tuner_id, tunable_id))
            .ok_or(CoreError::UnknownTunable {
                tuner: tuner_id,
                tunable: tunable_id,
            })?
            .clone();
        if values.len() != spec.arity {
            return Err(CoreError::HostStatus(-libc::EINVAL));
        }
        let scope = self.scope_for(&spec, netns_cookie);
        let key = (tuner_id, tunable_id, scope.unwrap_or(NETNS_COOKIE_UNSUPPORTED));

        // Refresh from the kernel: first touch captures the original,
        // later touches detect concurrent writers.
        let kernel = match self.io.read(scope, spec.kind, &spec.name, spec.arity) {
            Ok(kernel) => kernel,
            Err(e @ CoreError::NamespaceEnterFailed { .. }) => {
                warn!("{}; skipping write of '{}'", e, spec.name);
                return Ok(WriteOutcome::SkippedNamespace);
            }
            Err(e) => return Err(e),
        };

        let arity = spec.arity;
        let (mut capped, previous) = {
            let state = self.states.entry(key).or_insert(TunableState {
                original: kernel,
                current: kernel,
                last_write: None,
                write_count: 0,
                written: false,
            });
            if kernel != state.current {
                warn!(
                    "'{}' changed externally from ({}) to ({}); adopting it as the new original",
                    spec.name,
                    fmt_tuple(&state.current[..arity]),
                    fmt_tuple(&kernel[..arity])
                );
                state.original = kernel;
                state.current = kernel;
            }

            let mut capped = [0i64; 3];
            capped[..arity].copy_from_slice(values);
            apply_cap(&mut capped[..arity], &state.original[..arity], direction, &spec.name);

            if let Some(last) = state.last_write {
                if now.duration_since(last) < self.min_write_interval {
                    debug!(
                        "write of '{}' skipped: cooldown not elapsed",
                        spec.name
                    );
                    return Ok(WriteOutcome::SkippedCooldown);
                }
            }
            (capped, state.current)
        };

        match self.io.write(scope, spec.kind, &spec.name, &capped[..arity]) {
            Ok(()) => {}
            Err(e @ CoreError::NamespaceEnterFailed { .. }) => {
                warn!("{}; skipping write of '{}'", e, spec.name);
                return Ok(WriteOutcome::SkippedNamespace);
            }
            Err(e) => return Err(e),
        }

        if arity == 3 {
            info!(
                "Due to {} change {}(min default max) from ({} {} {}) -> ({} {} {})",
                scenario_label,
                spec.name,
                previous[0],
                previous[1],
                previous[2],
                capped[0],
                capped[1],
                capped[2]
            );
        } else {
            info!(
                "Due to {} change {} from ({}) -> ({})",
                scenario_label,
                spec.name,
                fmt_tuple(&previous[..arity]),
                fmt_tuple(&capped[..arity])
            );
        }

        let state = self.states.get_mut(&key).expect("state inserted above");
        state.current = capped;
        state.last_write = Some(now);
        state.write_count += 1;
        state.written = true;
        Ok(WriteOutcome::Written)
    }

    /// Restore the original value of every (tunable, namespace) pair this
    /// tuner wrote. Cap and cooldown do not apply.
    pub fn rollback(&mut self, tuner_id: u32) {
        let keys: Vec<StateKey> = self
            .states
            .iter()
            .filter(|((id, _, _), state)| *id == tuner_id && state.written)
            .map(|(key, _)| *key)
            .collect();

        for key in keys {
            let Some(spec) = self.descs.get(&(tuner_id, key.1)).cloned() else {
                continue;
            };
            let scope = (key.2 != NETNS_COOKIE_UNSUPPORTED).then_some(key.2);
            let original = self.states[&key].original;
            match self.io.write(scope, spec.kind, &spec.name, &original[..spec.arity]) {
                Ok(()) => {
                    info!(
                        "restored '{}' to ({}) on tuner {} teardown",
                        spec.name,
                        fmt_tuple(&original[..spec.arity]),
                        tuner_id
                    );
                    let state = self.states.get_mut(&key).expect("key collected above");
                    state.current = original;
                    state.written = false;
                }
                Err(e) => warn!("rollback of '{}' failed: {}", spec.name, e),
            }
        }
    }

    /// Forget a tuner's descriptors and state. Call after [`rollback`].
    pub fn remove_tuner(&mut self, tuner_id: u32) {
        self.descs.retain(|(id, _), _| *id != tuner_id);
        self.states.retain(|(id, _, _), _| *id != tuner_id);
    }

    /// Drop cached namespace handles for a destroyed namespace.
    pub fn forget_namespace(&mut self, cookie: i64) {
        self.io.forget_namespace(cookie);
    }

    /// Bookkeeping for one (tuner, tunable, namespace) triple.
    pub fn state(&self, tuner_id: u32, tunable_id: u32, netns_cookie: i64) -> Option<&TunableState> {
        self.states.get(&(tuner_id, tunable_id, netns_cookie))
    }

    /// Total writes performed on behalf of a tuner.
    pub fn writes_for(&self, tuner_id: u32) -> u64 {
        self.states
            .iter()
            .filter(|((id, _, _), _)| *id == tuner_id)
            .map(|(_, state)| state.write_count)
            .sum()
    }

    pub fn descriptor_count(&self, tuner_id: u32) -> usize {
        self.descs.keys().filter(|(id, _)| *id == tuner_id).count()
    }

    fn scope_for(&self, spec: &TunableSpec, netns_cookie: i64) -> Option<i64> {
        (spec.namespaced && self.netns_enabled && netns_cookie != NETNS_COOKIE_UNSUPPORTED)
            .then_some(netns_cookie)
    }
}

fn apply_cap(values: &mut [i64], original: &[i64], direction: ScenarioDirection, name: &str) {
    match direction {
        ScenarioDirection::Increase => {
            for (value, orig) in values.iter_mut().zip(original) {
                let ceiling = orig.saturating_mul(MAX_GROWTH_FACTOR);
                if *value > ceiling {
                    debug!("capping increase of '{}' at {}", name, ceiling);
                    *value = ceiling;
                }
            }
        }
        ScenarioDirection::Decrease => {
            for (value, orig) in values.iter_mut().zip(original) {
                let floor = orig / MAX_SHRINK_FACTOR;
                if *value < floor {
                    debug!("capping decrease of '{}' at {}", name, floor);
                    *value = floor;
                }
            }
        }
        ScenarioDirection::None => {}
    }
}

fn fmt_tuple(values: &[i64]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysctl::Sysctl;
    use crate::tuner::TunableKind;
    use tempfile::{tempdir, TempDir};

    const WMEM: &str = "net.ipv4.tcp_wmem";

    /// Test double that emulates namespace entry by giving each cookie its
    /// own subtree under the temp root.
    struct FakeNamespaces {
        root: std::path::PathBuf,
    }

    impl FakeNamespaces {
        fn sysctl_for(&self, scope: Option<i64>) -> Sysctl {
            match scope {
                None => Sysctl::with_root(&self.root),
                Some(cookie) => Sysctl::with_root(self.root.join(format!("ns-{}", cookie))),
            }
        }
    }

    impl ScopedSysctl for FakeNamespaces {
        fn read(
            &mut self,
            scope: Option<i64>,
            kind: TunableKind,
            name: &str,
            arity: usize,
        ) -> Result<[i64; 3], CoreError> {
            self.sysctl_for(scope).read(kind, name, arity)
        }

        fn write(
            &mut self,
            scope: Option<i64>,
            kind: TunableKind,
            name: &str,
            values: &[i64],
        ) -> Result<(), CoreError> {
            self.sysctl_for(scope).write(kind, name, values)
        }
    }

    fn wmem_spec() -> TunableSpec {
        TunableSpec {
            id: 0,
            kind: TunableKind::Sysctl,
            name: WMEM.to_string(),
            namespaced: true,
            arity: 3,
        }
    }

    fn global_registry(initial: [i64; 3]) -> (TunableRegistry, Sysctl, TempDir) {
        let dir = tempdir().unwrap();
        let sysctl = Sysctl::with_root(dir.path());
        sysctl
            .seed(TunableKind::Sysctl, WMEM, &initial)
            .unwrap();
        let registry = TunableRegistry::new(
            Box::new(FakeNamespaces {
                root: dir.path().to_path_buf(),
            }),
            false,
        );
        (registry, sysctl, dir)
    }

    #[test]
    fn test_register_write_rollback_round_trip() {
        let (mut registry, sysctl, _dir) = global_registry([4096, 16384, 65536]);
        registry.register(1, wmem_spec()).unwrap();

        let outcome = registry
            .write(
                1,
                0,
                "need to increase buffer size",
                ScenarioDirection::Increase,
                NETNS_COOKIE_UNSUPPORTED,
                &[4096, 16384, 131072],
                Instant::now(),
            )
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
        assert_eq!(
            sysctl.read(TunableKind::Sysctl, WMEM, 3).unwrap(),
            [4096, 16384, 131072]
        );

        registry.rollback(1);
        assert_eq!(
            sysctl.read(TunableKind::Sysctl, WMEM, 3).unwrap(),
            [4096, 16384, 65536]
        );
    }

    #[test]
    fn test_increase_is_capped_at_four_times_original() {
        let (mut registry, sysctl, _dir) = global_registry([4096, 16384, 65536]);
        registry.register(1, wmem_spec()).unwrap();

        registry
            .write(
                1,
                0,
                "need to increase buffer size",
                ScenarioDirection::Increase,
                NETNS_COOKIE_UNSUPPORTED,
                &[4096, 16384, 10_000_000],
                Instant::now(),
            )
            .unwrap();
        assert_eq!(
            sysctl.read(TunableKind::Sysctl, WMEM, 3).unwrap(),
            [4096, 16384, 65536 * 4]
        );
    }

    #[test]
    fn test_decrease_is_capped_at_quarter_original() {
        let (mut registry, sysctl, _dir) = global_registry([4096, 16384, 65536]);
        registry.register(1, wmem_spec()).unwrap();

        registry
            .write(
                1,
                0,
                "memory pressure",
                ScenarioDirection::Decrease,
                NETNS_COOKIE_UNSUPPORTED,
                &[1, 1, 1],
                Instant::now(),
            )
            .unwrap();
        assert_eq!(
            sysctl.read(TunableKind::Sysctl, WMEM, 3).unwrap(),
            [1024, 4096, 16384]
        );
    }

    #[test]
    fn test_cooldown_skips_rapid_writes() {
        let (mut registry, _sysctl, _dir) = global_registry([4096, 16384, 65536]);
        registry.register(1, wmem_spec()).unwrap();

        let t0 = Instant::now();
        let first = registry
            .write(
                1,
                0,
                "x",
                ScenarioDirection::Increase,
                NETNS_COOKIE_UNSUPPORTED,
                &[4096, 16384, 131072],
                t0,
            )
            .unwrap();
        assert_eq!(first, WriteOutcome::Written);

        let second = registry
            .write(
                1,
                0,
                "x",
                ScenarioDirection::Increase,
                NETNS_COOKIE_UNSUPPORTED,
                &[4096, 16384, 262144],
                t0 + Duration::from_millis(100),
            )
            .unwrap();
        assert_eq!(second, WriteOutcome::SkippedCooldown);

        let third = registry
            .write(
                1,
                0,
                "x",
                ScenarioDirection::Increase,
                NETNS_COOKIE_UNSUPPORTED,
                &[4096, 16384, 262144],
                t0 + Duration::from_secs(2),
            )
            .unwrap();
        assert_eq!(third, WriteOutcome::Written);
    }

    #[test]
    fn test_external_mutation_is_adopted_as_new_original() {
        let (mut registry, sysctl, _dir) = global_registry([4096, 16384, 65536]);
        registry.register(1, wmem_spec()).unwrap();

        let t0 = Instant::now();
        registry
            .write(
                1,
                0,
                "x",
                ScenarioDirection::Increase,
                NETNS_COOKIE_UNSUPPORTED,
                &[4096, 16384, 131072],
                t0,
            )
            .unwrap();

        // An administrator changes the value out-of-band.
        sysctl
            .write(TunableKind::Sysctl, WMEM, &[8192, 32768, 1_000_000])
            .unwrap();

        registry
            .write(
                1,
                0,
                "x",
                ScenarioDirection::Increase,
                NETNS_COOKIE_UNSUPPORTED,
                &[8192, 32768, 2_000_000],
                t0 + Duration::from_secs(2),
            )
            .unwrap();

        let state = registry.state(1, 0, NETNS_COOKIE_UNSUPPORTED).unwrap();
        assert_eq!(state.original, [8192, 32768, 1_000_000]);
        // The cap is now based on the adopted original, and rollback
        // targets the administrator's value.
        registry.rollback(1);
        assert_eq!(
            sysctl.read(TunableKind::Sysctl, WMEM, 3).unwrap(),
            [8192, 32768, 1_000_000]
        );
    }

    #[test]
    fn test_namespaced_writes_are_isolated() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let global = Sysctl::with_root(&root);
        let ns1 = Sysctl::with_root(root.join("ns-101"));
        let ns2 = Sysctl::with_root(root.join("ns-202"));
        for sysctl in [&global, &ns1, &ns2] {
            sysctl
                .seed(TunableKind::Sysctl, WMEM, &[4096, 16384, 65536])
                .unwrap();
        }

        let mut registry =
            TunableRegistry::new(Box::new(FakeNamespaces { root }), true);
        registry.register(1, wmem_spec()).unwrap();

        registry
            .write(
                1,
                0,
                "need to increase buffer size",
                ScenarioDirection::Increase,
                101,
                &[4096, 16384, 131072],
                Instant::now(),
            )
            .unwrap();

        assert_eq!(
            ns1.read(TunableKind::Sysctl, WMEM, 3).unwrap(),
            [4096, 16384, 131072]
        );
        assert_eq!(
            ns2.read(TunableKind::Sysctl, WMEM, 3).unwrap(),
            [4096, 16384, 65536]
        );
        assert_eq!(
            global.read(TunableKind::Sysctl, WMEM, 3).unwrap(),
            [4096, 16384, 65536]
        );

        // Rollback restores only the namespace that was written.
        registry.rollback(1);
        assert_eq!(
            ns1.read(TunableKind::Sysctl, WMEM, 3).unwrap(),
            [4096, 16384, 65536]
        );
    }

    #[test]
    fn test_unknown_tunable_is_rejected() {
        let (mut registry, _sysctl, _dir) = global_registry([4096, 16384, 65536]);
        assert!(matches!(
            registry.write(
                1,
                9,
                "x",
                ScenarioDirection::None,
                NETNS_COOKIE_UNSUPPORTED,
                &[1],
                Instant::now(),
            ),
            Err(CoreError::UnknownTunable { tuner: 1, tunable: 9 })
        ));
    }

    #[test]
    fn test_rollback_twice_is_idempotent() {
        let (mut registry, sysctl, _dir) = global_registry([4096, 16384, 65536]);
        registry.register(1, wmem_spec()).unwrap();
        registry
            .write(
                1,
                0,
                "x",
                ScenarioDirection::Increase,
                NETNS_COOKIE_UNSUPPORTED,
                &[4096, 16384, 131072],
                Instant::now(),
            )
            .unwrap();

        registry.rollback(1);
        registry.rollback(1);
        assert_eq!(
            sysctl.read(TunableKind::Sysctl, WMEM, 3).unwrap(),
            [4096, 16384, 65536]
        );
    }
}

//! Network namespace tracking and entry.
//!
//! The kernel hands every network namespace a cookie that is stable for the
//! namespace's lifetime. Probes stamp events with it, and namespaced
//! tunables are written from inside the owning namespace. Three pieces live
//! here:
//!
//! - [`NamespaceTracker`]: the cookie table. A cookie is Live from first
//!   sighting (or an explicit create event), Tombstoned once destroyed so
//!   late events still resolve, and evicted after a grace period.
//! - [`NetnsGuard`]: RAII `setns(2)` into a target namespace, restoring the
//!   previous one on drop.
//! - [`CookieResolver`]: maps a cookie to a namespace file descriptor by
//!   scanning `/run/netns` and `/proc/<pid>/ns/net` and asking each
//!   candidate namespace for its cookie.
//!
//! The sentinel cookie (-1, "namespaces unsupported") never enters the
//! table; events carrying it are global by definition.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::{Duration, Instant};

use log::{debug, warn};
use nix::sched::{setns, CloneFlags};

use crate::compat::SO_NETNS_COOKIE;
use crate::error::CoreError;
use crate::sysctl::{ScopedSysctl, Sysctl};
use crate::tuner::TunableKind;
use bpftune_events::NETNS_COOKIE_UNSUPPORTED;

/// Grace period between tombstoning and eviction.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(30);

/// Where `ip netns` binds named namespaces.
const NETNS_RUN_DIR: &str = "/run/netns";

/// Verdict for an event referencing a cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Deliver the event (Live, Tombstoned, or first sighting).
    Admitted,
    /// The cookie was evicted; drop the event.
    Dropped,
}

/// Lifecycle of one tracked cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsState {
    Live,
    Tombstoned,
    Evicted,
}

#[derive(Debug)]
struct NamespaceRecord {
    state: NsState,
    #[allow(dead_code)]
    created: Instant,
    changed: Instant,
    refs: u64,
}

/// Table of known namespace cookies.
#[derive(Debug)]
pub struct NamespaceTracker {
    table: HashMap<i64, NamespaceRecord>,
    grace: Duration,
}

impl NamespaceTracker {
    pub fn new(grace: Duration) -> Self {
        NamespaceTracker {
            table: HashMap::new(),
            grace,
        }
    }

    /// Record a namespace creation event.
    pub fn observe_create(&mut self, cookie: i64, now: Instant) {
        if cookie == NETNS_COOKIE_UNSUPPORTED {
            return;
        }
        let record = self.table.entry(cookie).or_insert(NamespaceRecord {
            state: NsState::Live,
            created: now,
            changed: now,
            refs: 0,
        });
        if record.state != NsState::Live {
            debug!("netns cookie {} resurfaced on create", cookie);
            record.state = NsState::Live;
            record.changed = now;
        }
    }

    /// Record a namespace destruction event. The cookie is kept around for
    /// the grace period so backlogged events still resolve.
    pub fn observe_destroy(&mut self, cookie: i64, now: Instant) {
        if cookie == NETNS_COOKIE_UNSUPPORTED {
            return;
        }
        match self.table.get_mut(&cookie) {
            Some(record) if record.state == NsState::Live => {
                record.state = NsState::Tombstoned;
                record.changed = now;
                debug!("netns cookie {} tombstoned", cookie);
            }
            Some(_) => {}
            None => {
                // Destroy for a cookie we never saw: remember the tombstone
                // so stragglers are still delivered within the grace period.
                self.table.insert(
                    cookie,
                    NamespaceRecord {
                        state: NsState::Tombstoned,
                        created: now,
                        changed: now,
                        refs: 0,
                    },
                );
            }
        }
    }

    /// Resolve an event cookie, inserting first sightings as Live.
    pub fn observe(&mut self, cookie: i64, now: Instant) -> Admission {
        if cookie == NETNS_COOKIE_UNSUPPORTED {
            return Admission::Admitted;
        }
        match self.table.get_mut(&cookie) {
            Some(record) => match record.state {
                NsState::Live | NsState::Tombstoned => {
                    record.refs += 1;
                    Admission::Admitted
                }
                NsState::Evicted => Admission::Dropped,
            },
            None => {
                self.table.insert(
                    cookie,
                    NamespaceRecord {
                        state: NsState::Live,
                        created: now,
                        changed: now,
                        refs: 1,
                    },
                );
                Admission::Admitted
            }
        }
    }

    /// Age tombstones into eviction and prune long-evicted cookies.
    pub fn sweep(&mut self, now: Instant) {
        let grace = self.grace;
        for (cookie, record) in self.table.iter_mut() {
            if record.state == NsState::Tombstoned && now.duration_since(record.changed) >= grace {
                debug!("netns cookie {} evicted", cookie);
                record.state = NsState::Evicted;
                record.changed = now;
            }
        }
        // Cookies are never reused within a boot, so dropping very old
        // evicted entries cannot resurrect a dead namespace.
        let retention = grace * 10;
        self.table.retain(|_, record| {
            record.state != NsState::Evicted || now.duration_since(record.changed) < retention
        });
    }

    pub fn state(&self, cookie: i64) -> Option<NsState> {
        self.table.get(&cookie).map(|record| record.state)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl Default for NamespaceTracker {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE)
    }
}

/// RAII entry into another network namespace.
///
/// Holds the previous namespace open and switches back on drop. Dropping
/// can only log on failure; a daemon stuck in a foreign namespace would
/// misdirect every subsequent global write.
pub struct NetnsGuard {
    previous: File,
}

impl NetnsGuard {
    /// Switch the calling thread into the namespace behind `target`.
    pub fn enter(target: &File, cookie: i64) -> Result<Self, CoreError> {
        let previous =
            File::open("/proc/self/ns/net").map_err(|e| CoreError::NamespaceEnterFailed {
                cookie,
                reason: format!("cannot open current namespace: {}", e),
            })?;
        setns(target, CloneFlags::CLONE_NEWNET).map_err(|e| CoreError::NamespaceEnterFailed {
            cookie,
            reason: format!("setns: {}", e),
        })?;
        Ok(NetnsGuard { previous })
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Err(e) = setns(&self.previous, CloneFlags::CLONE_NEWNET) {
            log::error!("failed to restore original network namespace: {}", e);
        }
    }
}

/// Maps namespace cookies to open namespace file descriptors.
///
/// Resolution scans the usual homes of namespace handles and asks each
/// candidate for its cookie with `SO_NETNS_COOKIE`, caching hits. Entries
/// are dropped when the tracker reports the namespace destroyed.
#[derive(Debug, Default)]
pub struct CookieResolver {
    cache: HashMap<i64, File>,
}

impl CookieResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Namespace fd for a cookie, scanning the host if it is not cached.
    pub fn resolve(&mut self, cookie: i64) -> Option<&File> {
        if cookie == NETNS_COOKIE_UNSUPPORTED {
            return None;
        }
        if !self.cache.contains_key(&cookie) {
            self.scan();
        }
        self.cache.get(&cookie)
    }

    /// Drop the cached fd for a destroyed namespace.
    pub fn forget(&mut self, cookie: i64) {
        self.cache.remove(&cookie);
    }

    /// Whether a cookie can currently be entered without a rescan.
    pub fn is_resolved(&self, cookie: i64) -> bool {
        self.cache.contains_key(&cookie)
    }

    /// Walk `/run/netns` and `/proc/<pid>/ns/net`, learning the cookie of
    /// every namespace not already cached.
    fn scan(&mut self) {
        let mut seen_inodes: Vec<u64> = self
            .cache
            .values()
            .filter_map(|f| f.metadata().ok().map(|m| m.ino()))
            .collect();

        let mut candidates: Vec<std::path::PathBuf> = Vec::new();
        if let Ok(entries) = std::fs::read_dir(NETNS_RUN_DIR) {
            candidates.extend(entries.flatten().map(|e| e.path()));
        }
        if let Ok(entries) = std::fs::read_dir("/proc") {
            for entry in entries.flatten() {
                if entry.file_name().to_string_lossy().parse::<u32>().is_ok() {
                    candidates.push(entry.path().join("ns/net"));
                }
            }
        }

        for path in candidates {
            if let Err(e) = self.probe_candidate(&path, &mut seen_inodes) {
                debug!("skipping netns candidate {:?}: {}", path, e);
            }
        }
    }

    fn probe_candidate(
        &mut self,
        path: &Path,
        seen_inodes: &mut Vec<u64>,
    ) -> Result<(), CoreError> {
        let file = File::open(path)?;
        let inode = file.metadata()?.ino();
        if seen_inodes.contains(&inode) {
            return Ok(());
        }
        seen_inodes.push(inode);
        let cookie = namespace_cookie(&file)?;
        debug!("netns cookie {} resolved via {:?}", cookie, path);
        self.cache.insert(cookie, file);
        Ok(())
    }
}

/// Ask the namespace behind `ns_file` for its cookie.
///
/// Enters the namespace, opens a throwaway UDP socket, and reads
/// `SO_NETNS_COOKIE`. Fails on kernels without cookie support.
fn namespace_cookie(ns_file: &File) -> Result<i64, CoreError> {
    let _guard = NetnsGuard::enter(ns_file, NETNS_COOKIE_UNSUPPORTED)?;

    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(CoreError::Io(std::io::Error::last_os_error()));
    }

    let mut cookie: u64 = 0;
    let mut len = std::mem::size_of::<u64>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            SO_NETNS_COOKIE,
            &mut cookie as *mut u64 as *mut libc::c_void,
            &mut len,
        )
    };
    let err = std::io::Error::last_os_error();
    unsafe { libc::close(fd) };
    if rc != 0 {
        warn!("kernel does not expose SO_NETNS_COOKIE: {}", err);
        return Err(CoreError::Io(err));
    }
    Ok(cookie as i64)
}

/// The production [`ScopedSysctl`]: global accesses go straight through,
/// namespaced ones enter the target namespace first.
pub struct NamespacedSysctl {
    sysctl: Sysctl,
    resolver: CookieResolver,
}

impl NamespacedSysctl {
    pub fn new(sysctl: Sysctl) -> Self {
        NamespacedSysctl {
            sysctl,
            resolver: CookieResolver::new(),
        }
    }
}

impl ScopedSysctl for NamespacedSysctl {
    fn read(
        &mut self,
        scope: Option<i64>,
        kind: TunableKind,
        name: &str,
        arity: usize,
    ) -> Result<[i64; 3], CoreError> {
        let NamespacedSysctl { sysctl, resolver } = self;
        match scope {
            None => sysctl.read(kind, name, arity),
            Some(cookie) => {
                let file = resolver
                    .resolve(cookie)
                    .ok_or(CoreError::NamespaceEnterFailed {
                        cookie,
                        reason: "no namespace handle for cookie".to_string(),
                    })?;
                let _guard = NetnsGuard::enter(file, cookie)?;
                sysctl.read(kind, name, arity)
            }
        }
    }

    fn write(
        &mut self,
        scope: Option<i64>,
        kind: TunableKind,
        name: &str,
        values: &[i64],
    ) -> Result<(), CoreError> {
        let NamespacedSysctl { sysctl, resolver } = self;
        match scope {
            None => sysctl.write(kind, name, values),
            Some(cookie) => {
                let file = resolver
                    .resolve(cookie)
                    .ok_or(CoreError::NamespaceEnterFailed {
                        cookie,
                        reason: "no namespace handle for cookie".to_string(),
                    })?;
                let _guard = NetnsGuard::enter(file, cookie)?;
                sysctl.write(kind, name, values)
            }
        }
    }

    fn forget_namespace(&mut self, cookie: i64) {
        self.resolver.forget(cookie);
    }
}

//! Per-(tuner, event, namespace) event rate limiting.
//!
//! Kernel probes fire in bursts: one logical condition (say, a socket
//! hitting its buffer limit) can emit a handful of near-simultaneous
//! notifications. The last-event map remembers when each key was last seen
//! and drops repeats inside a short window, 25 ms by default.
//!
//! The table is bounded. When it fills up, the oldest eighth of the entries
//! is evicted; the triggering event is never dropped because of table
//! pressure.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::debug;

/// Default suppression window.
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(25);

/// Default table capacity.
pub const DEFAULT_CAPACITY: usize = 8192;

/// Pack (cookie, event, tuner) into the 64-bit map key: the low 32 bits
/// carry the cookie, bits 32..48 the event id, bits 48..64 the tuner id.
fn pack_key(tuner_id: u32, event_id: u32, netns_cookie: i64) -> u64 {
    (netns_cookie as u64 & 0xffff_ffff)
        | ((event_id as u64 & 0xffff) << 32)
        | ((tuner_id as u64 & 0xffff) << 48)
}

/// The last-event map enforcing the dedup window.
#[derive(Debug)]
pub struct DedupFilter {
    window: Duration,
    capacity: usize,
    last_seen: HashMap<u64, Instant>,
}

impl DedupFilter {
    pub fn new(window: Duration) -> Self {
        Self::with_capacity(window, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(window: Duration, capacity: usize) -> Self {
        DedupFilter {
            window,
            capacity: capacity.max(8),
            last_seen: HashMap::new(),
        }
    }

    /// Admit or drop an event for the key, stamping `now` on admission.
    pub fn admit(&mut self, tuner_id: u32, event_id: u32, netns_cookie: i64) -> bool {
        self.admit_at(tuner_id, event_id, netns_cookie, Instant::now())
    }

    /// Clock-injected form of [`admit`](Self::admit), used by tests.
    pub fn admit_at(
        &mut self,
        tuner_id: u32,
        event_id: u32,
        netns_cookie: i64,
        now: Instant,
    ) -> bool {
        let key = pack_key(tuner_id, event_id, netns_cookie);
        if let Some(last) = self.last_seen.get(&key) {
            if now.duration_since(*last) < self.window {
                return false;
            }
        }
        if self.last_seen.len() >= self.capacity && !self.last_seen.contains_key(&key) {
            self.evict_oldest();
        }
        self.last_seen.insert(key, now);
        true
    }

    /// Drop the oldest eighth of the table to make room.
    fn evict_oldest(&mut self) {
        let mut stamps: Vec<(u64, Instant)> = self
            .last_seen
            .iter()
            .map(|(key, at)| (*key, *at))
            .collect();
        stamps.sort_by_key(|(_, at)| *at);
        let victims = (self.capacity / 8).max(1);
        for (key, _) in stamps.into_iter().take(victims) {
            self.last_seen.remove(&key);
        }
        debug!("last-event map full, evicted {} oldest entries", victims);
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_suppresses_repeats() {
        let mut filter = DedupFilter::new(Duration::from_millis(25));
        let t0 = Instant::now();

        assert!(filter.admit_at(1, 2, 100, t0));
        // Five identical events 5 ms apart: only the first one passes.
        for i in 1..5 {
            assert!(!filter.admit_at(1, 2, 100, t0 + Duration::from_millis(5 * i)));
        }
        // One more past the window passes again.
        assert!(filter.admit_at(1, 2, 100, t0 + Duration::from_millis(30)));
    }

    #[test]
    fn test_distinct_keys_do_not_interfere() {
        let mut filter = DedupFilter::new(Duration::from_millis(25));
        let t0 = Instant::now();

        assert!(filter.admit_at(1, 2, 100, t0));
        assert!(filter.admit_at(1, 2, 101, t0));
        assert!(filter.admit_at(1, 3, 100, t0));
        assert!(filter.admit_at(2, 2, 100, t0));
    }

    #[test]
    fn test_full_table_evicts_instead_of_dropping() {
        let mut filter = DedupFilter::with_capacity(Duration::from_millis(25), 8);
        let t0 = Instant::now();

        for i in 0..8 {
            assert!(filter.admit_at(1, i, 100, t0 + Duration::from_millis(i as u64)));
        }
        assert_eq!(filter.len(), 8);

        // The ninth key still gets in; the oldest entry made room for it.
        assert!(filter.admit_at(1, 8, 100, t0 + Duration::from_millis(20)));
        assert!(filter.len() <= 8);
    }

    #[test]
    fn test_key_packing_is_disjoint() {
        let a = pack_key(1, 0, 0);
        let b = pack_key(0, 1, 0);
        let c = pack_key(0, 0, 1);
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
        assert_eq!(pack_key(1, 2, 100), pack_key(1, 2, 100));
    }
}

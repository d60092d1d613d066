//! Shared-memory event ring.
//!
//! Kernel probes aggregate into a single producer that appends fixed-size
//! event records to a memory-mapped ring; the daemon is the single
//! consumer. The header carries atomic head/tail cursors with
//! acquire/release pairing so no locks are needed. Cursors are
//! free-running byte counts; offsets into the data region are taken modulo
//! its size, and records may wrap around the end.
//!
//! Layout of the backing file:
//!
//! ```text
//! +-------------------------------+------------------------+
//! | header: magic, version, size, | data region:           |
//! | head, tail, dropped           | size bytes of records  |
//! +-------------------------------+------------------------+
//! ```
//!
//! The producer half lives here too. The kernel side is the producer in
//! production; tests and the probe simulator use [`RingProducer`].

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::warn;
use memmap2::MmapMut;

use crate::error::CoreError;
use bpftune_events::TuneEvent;

/// `b"BTUN"` little-endian.
pub const RING_MAGIC: u32 = u32::from_le_bytes(*b"BTUN");

/// Current ring layout version.
pub const RING_VERSION: u32 = 1;

/// Default data region size.
pub const DEFAULT_DATA_SIZE: u32 = 64 * 1024;

#[repr(C)]
struct RingHeader {
    magic: u32,
    version: u32,
    /// Data region size in bytes (excludes this header).
    size: u32,
    _reserved: u32,
    /// Producer cursor: total bytes ever written.
    head: AtomicU64,
    /// Consumer cursor: total bytes ever consumed. Mirrored back so the
    /// producer can make forward progress.
    tail: AtomicU64,
    /// Records the producer discarded for lack of space.
    dropped: AtomicU64,
}

const HEADER_SIZE: usize = std::mem::size_of::<RingHeader>();

/// Consumer health: a few hard failures in a short window mean the ring is
/// beyond local recovery and the daemon should exit.
#[derive(Debug)]
pub struct RingHealth {
    window: Duration,
    threshold: usize,
    failures: VecDeque<Instant>,
}

impl Default for RingHealth {
    fn default() -> Self {
        RingHealth {
            window: Duration::from_secs(1),
            threshold: 3,
            failures: VecDeque::new(),
        }
    }
}

impl RingHealth {
    /// Record one hard failure; returns true once the ring is unhealthy.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.failures.push_back(now);
        while let Some(front) = self.failures.front() {
            if now.duration_since(*front) > self.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        self.failures.len() >= self.threshold
    }
}

/// Mapped ring file with the header and data region picked apart. Keeps
/// the mapping alive for as long as the raw pointers are in use.
struct Mapping {
    _map: MmapMut,
    hdr: *const RingHeader,
    data: *mut u8,
    size: u64,
}

// The mapping is owned and the header is only accessed atomically.
unsafe impl Send for Mapping {}

impl Mapping {
    fn open(path: &Path) -> Result<Self, CoreError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| CoreError::RingReadFailed(format!("mmap of {:?}: {}", path, e)))?;
        if map.len() < HEADER_SIZE {
            return Err(CoreError::RingReadFailed(format!(
                "{:?} is smaller than the ring header",
                path
            )));
        }
        let hdr = map.as_ptr() as *const RingHeader;
        let header = unsafe { &*hdr };
        if header.magic != RING_MAGIC {
            return Err(CoreError::RingReadFailed(format!(
                "bad magic 0x{:08x} in {:?}",
                header.magic, path
            )));
        }
        if header.version != RING_VERSION {
            return Err(CoreError::RingReadFailed(format!(
                "unsupported ring version {}",
                header.version
            )));
        }
        let size = header.size as u64;
        if size == 0 || HEADER_SIZE as u64 + size > map.len() as u64 {
            return Err(CoreError::RingReadFailed(format!(
                "ring header reports implausible data size {}",
                size
            )));
        }
        let data = unsafe { map.as_mut_ptr().add(HEADER_SIZE) };
        Ok(Mapping {
            _map: map,
            hdr,
            data,
            size,
        })
    }

    fn header(&self) -> &RingHeader {
        unsafe { &*self.hdr }
    }
}

/// The consumer half of the ring.
pub struct RingConsumer {
    mapping: Mapping,
    last_dropped: u64,
}

impl RingConsumer {
    /// Map an existing ring and validate its header.
    pub fn open(path: &Path) -> Result<Self, CoreError> {
        let mapping = Mapping::open(path)?;
        let last_dropped = mapping.header().dropped.load(Ordering::Relaxed);
        Ok(RingConsumer {
            mapping,
            last_dropped,
        })
    }

    /// Pop and decode up to `budget` records.
    ///
    /// A corrupt producer cursor resynchronizes the consumer to the head
    /// and reports a hard failure; the caller decides when enough is
    /// enough via [`RingHealth`].
    pub fn drain(&mut self, budget: usize) -> Result<Vec<TuneEvent>, CoreError> {
        let record = TuneEvent::WIRE_SIZE as u64;
        let size = self.mapping.size;
        let header = self.mapping.header();
        let head = header.head.load(Ordering::Acquire);
        let mut tail = header.tail.load(Ordering::Relaxed);

        if head < tail || head - tail > size {
            header.tail.store(head, Ordering::Release);
            return Err(CoreError::RingReadFailed(format!(
                "cursor corruption (head {}, tail {}); resynchronized",
                head, tail
            )));
        }

        let mut out = Vec::new();
        let mut buf = [0u8; TuneEvent::WIRE_SIZE];
        while out.len() < budget && head - tail >= record {
            unsafe {
                read_circular(
                    self.mapping.data as *const u8,
                    size as usize,
                    (tail % size) as usize,
                    &mut buf,
                );
            }
            out.push(TuneEvent::decode(&mut &buf[..])?);
            tail += record;
            header.tail.store(tail, Ordering::Release);
        }

        let dropped = header.dropped.load(Ordering::Relaxed);
        if dropped > self.last_dropped {
            warn!(
                "event ring dropped {} records at the producer",
                dropped - self.last_dropped
            );
            self.last_dropped = dropped;
        }
        Ok(out)
    }

    /// Whether the consumer is caught up with the producer.
    pub fn is_empty(&self) -> bool {
        let header = self.mapping.header();
        header.head.load(Ordering::Acquire) == header.tail.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn corrupt_tail(&self, value: u64) {
        self.mapping.header().tail.store(value, Ordering::Release);
    }
}

/// The producer half of the ring. Production systems have the kernel side
/// in this role; tests and the probe simulator drive it from userspace.
pub struct RingProducer {
    mapping: Mapping,
}

impl RingProducer {
    /// Create and initialize a ring file of the given data size.
    pub fn create(path: &Path, data_size: u32) -> Result<Self, CoreError> {
        if (data_size as usize) < TuneEvent::WIRE_SIZE {
            return Err(CoreError::RingReadFailed(format!(
                "data size {} cannot hold a single record",
                data_size
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(HEADER_SIZE as u64 + data_size as u64)?;
        {
            let mut map = unsafe { MmapMut::map_mut(&file) }
                .map_err(|e| CoreError::RingReadFailed(format!("mmap of {:?}: {}", path, e)))?;
            // File contents start zeroed; only the identity fields need to
            // be written before a consumer may attach.
            map[0..4].copy_from_slice(&RING_MAGIC.to_le_bytes());
            map[4..8].copy_from_slice(&RING_VERSION.to_le_bytes());
            map[8..12].copy_from_slice(&data_size.to_le_bytes());
            map.flush()
                .map_err(|e| CoreError::RingReadFailed(format!("header flush: {}", e)))?;
        }
        Ok(RingProducer {
            mapping: Mapping::open(path)?,
        })
    }

    /// Attach to a ring somebody else created.
    pub fn attach(path: &Path) -> Result<Self, CoreError> {
        Ok(RingProducer {
            mapping: Mapping::open(path)?,
        })
    }

    /// Append one record. Returns false (and counts a drop) when the
    /// consumer has not freed enough space.
    pub fn push(&mut self, event: &TuneEvent) -> bool {
        let record = TuneEvent::WIRE_SIZE as u64;
        let size = self.mapping.size;
        let header = self.mapping.header();
        let head = header.head.load(Ordering::Relaxed);
        let tail = header.tail.load(Ordering::Acquire);

        if size - (head - tail) < record {
            header.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let bytes = event.to_bytes();
        unsafe {
            write_circular(
                self.mapping.data,
                size as usize,
                (head % size) as usize,
                &bytes,
            );
        }
        header.head.store(head + record, Ordering::Release);
        true
    }

    /// Records dropped so far for lack of space.
    pub fn dropped(&self) -> u64 {
        self.mapping.header().dropped.load(Ordering::Relaxed)
    }
}

unsafe fn read_circular(base: *const u8, size: usize, mut off: usize, dst: &mut [u8]) {
    let mut done = 0;
    while done < dst.len() {
        let chunk = (dst.len() - done).min(size - off);
        std::ptr::copy_nonoverlapping(base.add(off), dst.as_mut_ptr().add(done), chunk);
        done += chunk;
        off = (off + chunk) % size;
    }
}

unsafe fn write_circular(base: *mut u8, size: usize, mut off: usize, src: &[u8]) {
    let mut done = 0;
    while done < src.len() {
        let chunk = (src.len() - done).min(size - off);
        std::ptr::copy_nonoverlapping(src.as_ptr().add(done), base.add(off), chunk);
        done += chunk;
        off = (off + chunk) % size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpftune_events::TunableUpdate;
    use tempfile::tempdir;

    fn sample_event(seq: u32) -> TuneEvent {
        let mut event = TuneEvent {
            tuner_id: 1,
            scenario_id: seq,
            event_id: 0,
            pid: 1000 + seq,
            netns_cookie: 77,
            ..Default::default()
        };
        event.updates[0] =
            TunableUpdate::from_values(0, &[1, 2, 3], &[4, 5, i64::from(seq)]).unwrap();
        event
    }

    #[test]
    fn test_producer_consumer_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ring");
        let mut producer = RingProducer::create(&path, DEFAULT_DATA_SIZE).unwrap();
        let mut consumer = RingConsumer::open(&path).unwrap();

        for seq in 0..3 {
            assert!(producer.push(&sample_event(seq)));
        }
        let events = consumer.drain(16).unwrap();
        assert_eq!(events.len(), 3);
        for (seq, event) in events.iter().enumerate() {
            assert_eq!(*event, sample_event(seq as u32));
        }
        assert!(consumer.is_empty());
    }

    #[test]
    fn test_drain_respects_budget() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ring");
        let mut producer = RingProducer::create(&path, DEFAULT_DATA_SIZE).unwrap();
        let mut consumer = RingConsumer::open(&path).unwrap();

        for seq in 0..5 {
            assert!(producer.push(&sample_event(seq)));
        }
        assert_eq!(consumer.drain(2).unwrap().len(), 2);
        assert_eq!(consumer.drain(16).unwrap().len(), 3);
    }

    #[test]
    fn test_wrap_around_keeps_records_intact() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ring");
        // Room for two records plus change, so offsets wrap quickly and do
        // not divide the region evenly.
        let data_size = (TuneEvent::WIRE_SIZE * 2 + 40) as u32;
        let mut producer = RingProducer::create(&path, data_size).unwrap();
        let mut consumer = RingConsumer::open(&path).unwrap();

        for round in 0..20 {
            assert!(producer.push(&sample_event(round)));
            let events = consumer.drain(16).unwrap();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0], sample_event(round));
        }
    }

    #[test]
    fn test_full_ring_drops_at_the_producer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ring");
        let data_size = (TuneEvent::WIRE_SIZE * 2) as u32;
        let mut producer = RingProducer::create(&path, data_size).unwrap();
        let mut consumer = RingConsumer::open(&path).unwrap();

        assert!(producer.push(&sample_event(0)));
        assert!(producer.push(&sample_event(1)));
        assert!(!producer.push(&sample_event(2)));
        assert_eq!(producer.dropped(), 1);

        // Consuming frees space again.
        assert_eq!(consumer.drain(16).unwrap().len(), 2);
        assert!(producer.push(&sample_event(3)));
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ring");
        std::fs::write(&path, vec![0xAAu8; 4096]).unwrap();
        assert!(matches!(
            RingConsumer::open(&path),
            Err(CoreError::RingReadFailed(_))
        ));
    }

    #[test]
    fn test_cursor_corruption_resynchronizes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ring");
        let mut producer = RingProducer::create(&path, DEFAULT_DATA_SIZE).unwrap();
        let mut consumer = RingConsumer::open(&path).unwrap();
        assert!(producer.push(&sample_event(0)));

        // Force tail past head.
        consumer.corrupt_tail(u64::MAX / 2);
        assert!(consumer.drain(16).is_err());
        // Resynchronized: the ring reads as empty again.
        assert!(consumer.is_empty());
        assert!(consumer.drain(16).unwrap().is_empty());
    }

    #[test]
    fn test_ring_health_threshold() {
        let mut health = RingHealth::default();
        let t0 = Instant::now();
        assert!(!health.record_failure(t0));
        assert!(!health.record_failure(t0 + Duration::from_millis(100)));
        assert!(health.record_failure(t0 + Duration::from_millis(200)));

        // Spread-out failures never accumulate.
        let mut health = RingHealth::default();
        for i in 0..10 {
            assert!(!health.record_failure(t0 + Duration::from_secs(2 * i)));
        }
    }
}

//! The fixed-layout event record and its binary codec.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::EventError;

/// Number of update slots in every event record. Slot 0 carries the
/// proposed tunable change; slot 1 optionally carries a latency sample;
/// the rest are reserved.
pub const MAX_UPDATES: usize = 4;

/// Update slot probes use to report a latency sample alongside a proposed
/// change: `new[0]` holds the observation (microseconds), zero means no
/// sample was taken. Consumers feed it to the correlation engine.
pub const UPDATE_SLOT_LATENCY: usize = 1;

/// Sentinel cookie meaning the kernel does not support namespace cookies.
/// Events carrying it are global and bypass namespace-scoped handling.
pub const NETNS_COOKIE_UNSUPPORTED: i64 = -1;

/// Tuner id reserved for the daemon itself. Events with this id are consumed
/// by the host (namespace lifecycle) and never dispatched to a tuner.
/// Dynamically assigned tuner ids start at 1.
pub const TUNER_ID_HOST: u32 = 0;

/// Host scenario: a network namespace was created.
pub const NETNS_SCENARIO_CREATE: u32 = 0;

/// Host scenario: a network namespace was destroyed.
pub const NETNS_SCENARIO_DESTROY: u32 = 1;

/// One proposed or observed tunable change: the tunable id plus its value
/// tuple before and after. Unused components are zero.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunableUpdate {
    pub id: u32,
    pub old: [i64; 3],
    pub new: [i64; 3],
}

impl TunableUpdate {
    /// Wire size of one update: id + 3 old + 3 new components.
    pub const WIRE_SIZE: usize = 4 + 3 * 8 + 3 * 8;

    /// Build an update from value slices of the given arity.
    pub fn from_values(id: u32, old: &[i64], new: &[i64]) -> Result<Self, EventError> {
        if old.len() > 3 || new.len() > 3 || old.is_empty() || new.is_empty() {
            return Err(EventError::InvalidArity(old.len().max(new.len())));
        }
        let mut update = TunableUpdate {
            id,
            ..Default::default()
        };
        update.old[..old.len()].copy_from_slice(old);
        update.new[..new.len()].copy_from_slice(new);
        Ok(update)
    }
}

/// Fixed-size record emitted by a kernel probe.
///
/// `event_id` equals the id of the tunable the event is about. The cookie is
/// signed; all-ones decodes to [`NETNS_COOKIE_UNSUPPORTED`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TuneEvent {
    pub tuner_id: u32,
    pub scenario_id: u32,
    pub event_id: u32,
    pub pid: u32,
    pub netns_cookie: i64,
    pub updates: [TunableUpdate; MAX_UPDATES],
}

impl Default for TuneEvent {
    fn default() -> Self {
        TuneEvent {
            tuner_id: 0,
            scenario_id: 0,
            event_id: 0,
            pid: 0,
            netns_cookie: NETNS_COOKIE_UNSUPPORTED,
            updates: [TunableUpdate::default(); MAX_UPDATES],
        }
    }
}

impl TuneEvent {
    /// Exact size of one encoded record.
    pub const WIRE_SIZE: usize = 4 * 4 + 8 + MAX_UPDATES * TunableUpdate::WIRE_SIZE;

    /// True when this event is global because the kernel lacks namespace
    /// cookie support.
    pub fn is_global(&self) -> bool {
        self.netns_cookie == NETNS_COOKIE_UNSUPPORTED
    }

    /// Latency sample reported in [`UPDATE_SLOT_LATENCY`], if the probe
    /// took one.
    pub fn latency_sample(&self) -> Option<i64> {
        let sample = self.updates[UPDATE_SLOT_LATENCY].new[0];
        (sample > 0).then_some(sample)
    }

    /// Encode this record into `buf`, little-endian, field order as laid out
    /// in the crate docs.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(Self::WIRE_SIZE);
        buf.put_u32_le(self.tuner_id);
        buf.put_u32_le(self.scenario_id);
        buf.put_u32_le(self.event_id);
        buf.put_u32_le(self.pid);
        buf.put_i64_le(self.netns_cookie);
        for update in &self.updates {
            buf.put_u32_le(update.id);
            for v in &update.old {
                buf.put_i64_le(*v);
            }
            for v in &update.new {
                buf.put_i64_le(*v);
            }
        }
    }

    /// Encode into a freshly allocated buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::WIRE_SIZE);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode one record, consuming exactly [`Self::WIRE_SIZE`] bytes.
    ///
    /// This is the enforcement boundary for the cookie representation: the
    /// cookie is read as a signed 64-bit value, so an all-ones pattern from a
    /// kernel without cookie support always arrives as
    /// [`NETNS_COOKIE_UNSUPPORTED`].
    pub fn decode(buf: &mut impl Buf) -> Result<Self, EventError> {
        if buf.remaining() < Self::WIRE_SIZE {
            return Err(EventError::IncompleteRecord {
                expected: Self::WIRE_SIZE,
                actual: buf.remaining(),
            });
        }
        let mut event = TuneEvent {
            tuner_id: buf.get_u32_le(),
            scenario_id: buf.get_u32_le(),
            event_id: buf.get_u32_le(),
            pid: buf.get_u32_le(),
            netns_cookie: buf.get_i64_le(),
            ..Default::default()
        };
        for update in event.updates.iter_mut() {
            update.id = buf.get_u32_le();
            for v in update.old.iter_mut() {
                *v = buf.get_i64_le();
            }
            for v in update.new.iter_mut() {
                *v = buf.get_i64_le();
            }
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_size_is_stable() {
        // 16 bytes of ids + 8 bytes cookie + 4 updates of 52 bytes each.
        assert_eq!(TuneEvent::WIRE_SIZE, 232);
        assert_eq!(TunableUpdate::WIRE_SIZE, 52);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut event = TuneEvent {
            tuner_id: 3,
            scenario_id: 1,
            event_id: 0,
            pid: 4242,
            netns_cookie: 0x1234_5678,
            ..Default::default()
        };
        event.updates[0] =
            TunableUpdate::from_values(0, &[4096, 16384, 65536], &[4096, 16384, 262144]).unwrap();

        let encoded = event.to_bytes();
        assert_eq!(encoded.len(), TuneEvent::WIRE_SIZE);

        let decoded = TuneEvent::decode(&mut encoded.clone()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_all_ones_cookie_decodes_to_sentinel() {
        let event = TuneEvent {
            netns_cookie: u64::MAX as i64,
            ..Default::default()
        };
        let decoded = TuneEvent::decode(&mut event.to_bytes()).unwrap();
        assert_eq!(decoded.netns_cookie, NETNS_COOKIE_UNSUPPORTED);
        assert!(decoded.is_global());
    }

    #[test]
    fn test_truncated_record_is_rejected() {
        let event = TuneEvent::default();
        let encoded = event.to_bytes();
        let mut short = encoded.slice(..TuneEvent::WIRE_SIZE - 1);
        assert!(matches!(
            TuneEvent::decode(&mut short),
            Err(EventError::IncompleteRecord { .. })
        ));
    }

    #[test]
    fn test_latency_sample_slot() {
        let mut event = TuneEvent::default();
        assert_eq!(event.latency_sample(), None);

        event.updates[UPDATE_SLOT_LATENCY].new[0] = 350;
        assert_eq!(event.latency_sample(), Some(350));

        let decoded = TuneEvent::decode(&mut event.to_bytes()).unwrap();
        assert_eq!(decoded.latency_sample(), Some(350));
    }

    #[test]
    fn test_update_arity_guard() {
        assert!(TunableUpdate::from_values(0, &[1, 2, 3, 4], &[1]).is_err());
        assert!(TunableUpdate::from_values(0, &[], &[1]).is_err());
        let update = TunableUpdate::from_values(7, &[10], &[20]).unwrap();
        assert_eq!(update.old, [10, 0, 0]);
        assert_eq!(update.new, [20, 0, 0]);
    }
}

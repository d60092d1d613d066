//! Ring event record definitions for the bpftune daemon.
//!
//! This crate defines the fixed binary record that kernel-side observation
//! probes push into the shared-memory event ring and that the daemon's
//! consumer drains. Both sides of the ring, and every tuner artifact,
//! agree on this layout.
//!
//! # Record format
//!
//! ```text
//! +----------+-------------+----------+-------+--------------+-------------------+
//! | tuner_id | scenario_id | event_id | pid   | netns_cookie | update[0..4]      |
//! | u32 LE   | u32 LE      | u32 LE   | u32 LE| i64 LE       | {id, old[3],      |
//! |          |             |          |       |              |  new[3]} x 4      |
//! +----------+-------------+----------+-------+--------------+-------------------+
//! ```
//!
//! Every record is exactly [`TuneEvent::WIRE_SIZE`] bytes. A `netns_cookie`
//! of `-1` means the running kernel does not support namespace cookies and
//! the event is global. Update slot 0 carries the proposed change; slot 1
//! optionally carries a latency sample for the correlation engine; the
//! remaining slots are reserved.

pub mod error;
pub mod record;

pub use error::EventError;
pub use record::{
    TunableUpdate, TuneEvent, MAX_UPDATES, NETNS_COOKIE_UNSUPPORTED, NETNS_SCENARIO_CREATE,
    NETNS_SCENARIO_DESTROY, TUNER_ID_HOST, UPDATE_SLOT_LATENCY,
};

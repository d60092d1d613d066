//! Kernel ABI constants not exported by `libc`.
//!
//! These mirror values from the kernel headers of the oldest supported
//! kernel line. Tuner logic takes them from here rather than hardcoding
//! numbers, so a kernel bump touches one table.

/// `SO_NETNS_COOKIE` socket option (linux/socket.h, since 5.14).
pub const SO_NETNS_COOKIE: libc::c_int = 71;

/// Granularity of socket memory accounting (net/sock.h `SK_MEM_QUANTUM`).
/// Proposed buffer minimums below this are meaningless to the kernel.
pub const SK_MEM_QUANTUM: i64 = 4096;

//! System limits and configuration bounds.
//!
//! Every queue, buffer, and resource has an explicit maximum size. This
//! keeps growth bounded and makes the system predictable under load.

/// Maximum size of a single entry payload in bytes (1 MiB).
pub const ENTRY_SIZE_BYTES_MAX: u32 = 1024 * 1024;

/// Maximum size of a segment data file in bytes (1 GiB).
pub const SEGMENT_SIZE_BYTES_MAX: u32 = 1024 * 1024 * 1024;

/// Minimum size of a segment data file in bytes (1 MiB).
pub const SEGMENT_SIZE_BYTES_MIN: u32 = 1024 * 1024;

/// Maximum number of entries per segment.
pub const ENTRIES_PER_SEGMENT_MAX: u64 = 1 << 31;

/// Maximum number of members in a cluster.
pub const CLUSTER_SIZE_MAX: usize = 7;

/// Maximum number of entries in a single append RPC.
pub const APPEND_BATCH_ENTRIES_MAX: usize = 1024;

/// Maximum total entry bytes in a single append RPC (1 MiB).
pub const APPEND_BATCH_BYTES_MAX: u64 = 1024 * 1024;

/// Maximum total entry bytes in a single gossip sync RPC (1 MiB).
pub const SYNC_BATCH_BYTES_MAX: u64 = 1024 * 1024;

/// Number of peers contacted per gossip round.
pub const GOSSIP_FANOUT: usize = 3;

/// Maximum size of a framed wire message (16 MiB).
pub const MESSAGE_SIZE_BYTES_MAX: u32 = 16 * 1024 * 1024;

/// Default base election timeout in milliseconds.
///
/// The actual timeout is drawn uniformly from `[T, 2T)`.
pub const ELECTION_TIMEOUT_MS_DEFAULT: u64 = 500;

/// Default heartbeat interval in milliseconds.
///
/// Must be below half the election timeout so followers never time out
/// under a healthy leader. Doubles as the passive gossip period.
pub const HEARTBEAT_INTERVAL_MS_DEFAULT: u64 = 150;

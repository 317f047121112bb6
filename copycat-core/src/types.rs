//! Strongly-typed identifiers for Copycat entities.
//!
//! Explicit wrapper types prevent bugs from mixing up raw integers: a term
//! is not a log index is not a segment id, even though all three are
//! sixty-four-bit counters on the wire.

use std::fmt;

/// Macro to generate strongly-typed u64 ID wrappers.
///
/// Each ID type wraps a u64 and provides:
/// - Type safety (can't mix `TermId` with `LogIndex`)
/// - Debug/Display formatting
/// - Zero-cost abstraction (same as raw u64)
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new ID from a raw u64 value.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw u64 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Returns the next ID in sequence.
            ///
            /// # Panics
            /// Panics if the ID would overflow.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                assert!(self.0 < u64::MAX, "ID overflow");
                Self(self.0 + 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

define_id!(TermId, "term", "Raft term number; at most one leader per term.");
define_id!(LogIndex, "idx", "One-based position in the replicated log.");
define_id!(SegmentId, "seg", "Unique identifier for a log segment.");
define_id!(Version, "v", "Version of a segment; bumped on compaction.");

/// Unique identifier for a cluster member.
///
/// Member ids are 32-bit on the wire, matching the membership gossip
/// protocol, so this wrapper is kept separate from the u64 id family.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct MemberId(u32);

impl MemberId {
    /// Creates a new member ID from a raw u32 value.
    #[inline]
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw u32 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "member({})", self.0)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "member-{}", self.0)
    }
}

impl From<u32> for MemberId {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

impl From<MemberId> for u32 {
    fn from(id: MemberId) -> Self {
        id.get()
    }
}

//! Invariant checks shared by the cluster scenarios.
//!
//! Each check asserts one of the universal safety properties over a
//! running [`Cluster`]: committed prefixes agree byte for byte, at most
//! one member leads any term, applied/commit/last-index ordering holds on
//! every member, and segment files tile the index space contiguously.

use copycat_core::LogIndex;
use copycat_log::{Log, LogError, Storage};

use crate::cluster::Cluster;

/// Asserts that for every pair of members and every index both have
/// committed, the stored entries are identical.
///
/// # Panics
/// Panics if two members disagree on a committed entry.
pub fn assert_committed_prefixes_match(cluster: &Cluster) {
    let ids = cluster.alive_ids();
    for (position, &a) in ids.iter().enumerate() {
        for &b in &ids[position + 1..] {
            let limit = cluster
                .context(a)
                .commit_index()
                .min(cluster.context(b).commit_index());
            for index in 1..=limit.get() {
                let index = LogIndex::new(index);
                let left = entry_if_present(cluster, a, index);
                let right = entry_if_present(cluster, b, index);
                if let (Some(left), Some(right)) = (left, right) {
                    assert_eq!(
                        left, right,
                        "members {a} and {b} disagree on committed entry {index}"
                    );
                }
            }
        }
    }
}

fn entry_if_present(
    cluster: &Cluster,
    id: u32,
    index: LogIndex,
) -> Option<copycat_log::Entry> {
    match cluster.context(id).log().get(index) {
        Ok(entry) => Some(entry),
        Err(LogError::NotFound { .. } | LogError::IndexOutOfBounds { .. }) => None,
        Err(e) => panic!("member {id} failed to read committed entry {index}: {e}"),
    }
}

/// Asserts that no term was ever led by more than one member.
///
/// # Panics
/// Panics if two members led the same term.
pub fn assert_single_leader_per_term(cluster: &Cluster) {
    for (term, leaders) in cluster.leaders_by_term() {
        assert!(
            leaders.len() <= 1,
            "term {term} had multiple leaders: {leaders:?}"
        );
    }
}

/// Asserts `last_applied <= commit_index <= last_index` on every alive
/// member.
///
/// # Panics
/// Panics if the ordering is violated anywhere.
pub fn assert_commit_bounds(cluster: &Cluster) {
    for id in cluster.alive_ids() {
        let context = cluster.context(id);
        let last = context
            .log()
            .last_index()
            .unwrap_or_else(|| LogIndex::new(0));
        assert!(
            context.last_applied() <= context.commit_index(),
            "member {id}: last_applied {} > commit_index {}",
            context.last_applied(),
            context.commit_index()
        );
        assert!(
            context.commit_index() <= last,
            "member {id}: commit_index {} > last_index {last}",
            context.commit_index()
        );
    }
}

/// Asserts that a log's segments tile the index space contiguously from
/// index 1.
///
/// # Panics
/// Panics on a gap or overlap between segments.
pub fn assert_segments_tile<S: Storage>(log: &Log<S>) {
    let mut expected = 1u64;
    for segment in log.segments() {
        assert_eq!(
            segment.first_index().get(),
            expected,
            "segment {} does not start where the previous ended",
            segment.descriptor().id
        );
        expected = segment.next_index().get();
    }
}

/// Runs every cluster-wide invariant check.
pub fn assert_cluster_invariants(cluster: &Cluster) {
    assert_single_leader_per_term(cluster);
    assert_commit_bounds(cluster);
    assert_committed_prefixes_match(cluster);
    for id in cluster.alive_ids() {
        assert_segments_tile(cluster.context(id).log());
    }
}

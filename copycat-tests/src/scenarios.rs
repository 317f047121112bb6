//! End-to-end cluster scenarios.
//!
//! Each test drives a full cluster through the deterministic harness:
//! elections, replication, leader crashes, partitions, passive gossip,
//! and on-disk compaction across restarts.

use bytes::Bytes;
use copycat_core::{LogIndex, SegmentId, TermId};
use copycat_log::{Entry, EntryKind, FsStorage, Log, LogConfig, LogError};
use copycat_raft::{Consistency, Operation, RaftErrorKind, RoleKind, Status};

use crate::cluster::Cluster;
use crate::properties::{assert_cluster_invariants, assert_segments_tile};

/// S1: a single-member cluster elects itself and commits a command.
#[test]
fn test_single_node_commit() {
    let mut cluster = Cluster::new(1, 0);
    cluster.elect(1);

    let submission = cluster.submit_command(1, "foo", "1");
    cluster.run_until_idle();

    let response = cluster.take_completion(1, submission).expect("completed");
    assert_eq!(response.status, Status::Ok);

    // The command entry is in the log at term 1 and was applied.
    let context = cluster.context(1);
    assert_eq!(context.current_term(), TermId::new(1));
    let command_index = context.log().last_index().unwrap();
    let entry = context.log().get(command_index).unwrap();
    assert_eq!(entry.term, TermId::new(1));
    assert_eq!(entry.kind, EntryKind::Command);
    assert_eq!(entry.key, Bytes::from_static(b"foo"));
    assert_eq!(
        cluster.state_machine(1).value(b"foo"),
        Some(Bytes::from_static(b"1"))
    );
    assert_eq!(context.commit_index(), context.last_applied());
    assert_cluster_invariants(&cluster);
}

/// S2: three members, one leader, one hundred commands, identical logs.
#[test]
fn test_three_node_happy_path() {
    let mut cluster = Cluster::new(3, 0);
    cluster.elect(1);

    let submissions: Vec<u64> = (0..100)
        .map(|i| cluster.submit_command(1, &format!("key-{i}"), &format!("value-{i}")))
        .collect();
    cluster.run_until_idle();

    // Every submission committed and succeeded.
    for submission in submissions {
        let response = cluster.take_completion(1, submission).expect("completed");
        assert_eq!(response.status, Status::Ok);
    }

    // Followers learn the final commit index on the next heartbeats.
    cluster.tick_all();
    cluster.tick_all();

    let expected_commit = cluster.context(1).commit_index();
    for id in [1, 2, 3] {
        let context = cluster.context(id);
        assert_eq!(context.commit_index(), expected_commit, "member {id}");
        assert_eq!(context.last_applied(), expected_commit, "member {id}");
        assert_eq!(cluster.state_machine(id).applied_count(), 100);
        assert_eq!(
            cluster.state_machine(id).value(b"key-99"),
            Some(Bytes::from_static(b"value-99"))
        );
    }
    assert_cluster_invariants(&cluster);
}

/// S3: the leader crashes after replicating an entry to one follower;
/// the surviving majority elects the member holding the entry, which
/// commits it everywhere.
#[test]
fn test_leader_crash_mid_replication() {
    let mut cluster = Cluster::new(3, 0);
    cluster.elect(1);

    // The entry reaches member 2 but never member 3.
    cluster.partition(&[1], &[3]);
    let submission = cluster.submit_command(1, "event", "E");
    cluster.run_until_idle();
    let response = cluster.take_completion(1, submission).expect("completed");
    assert_eq!(response.status, Status::Ok);

    cluster.crash(1);
    cluster.heal();

    // Member 2 holds the entry and wins the next election.
    cluster.elect(2);
    cluster.tick_all();

    assert_eq!(
        cluster.state_machine(3).value(b"event"),
        Some(Bytes::from_static(b"E"))
    );

    // The old leader comes back and catches up.
    cluster.restart(1);
    cluster.tick_all();
    cluster.tick_all();

    assert_eq!(
        cluster.state_machine(1).value(b"event"),
        Some(Bytes::from_static(b"E"))
    );
    let commit = cluster.context(2).commit_index();
    for id in [1, 2, 3] {
        assert_eq!(cluster.context(id).commit_index(), commit, "member {id}");
    }
    assert_cluster_invariants(&cluster);
}

/// S4: a partitioned leader keeps accepting doomed writes; when the
/// partition heals it steps down, truncates its divergent suffix, and
/// adopts the majority's log.
#[test]
fn test_split_brain_healing() {
    let mut cluster = Cluster::new(3, 0);
    cluster.elect(1);
    cluster.run_until_idle();

    cluster.partition(&[1], &[2, 3]);

    // The stranded leader appends entries it can never commit.
    let doomed_a = cluster.submit_command(1, "doomed", "a");
    let doomed_b = cluster.submit_command(1, "doomed", "b");
    cluster.run_until_idle();
    assert!(cluster.take_completion(1, doomed_a).is_none());

    // The majority side elects member 2 and commits real entries.
    cluster.elect(2);
    for i in 0..5 {
        cluster.submit_command(2, &format!("real-{i}"), "yes");
    }
    cluster.run_until_idle();

    cluster.heal();
    cluster.tick_all();
    cluster.tick_all();

    // The old leader stepped down and its in-flight submits failed with
    // NoLeader.
    assert_eq!(cluster.context(1).role_kind(), RoleKind::Follower);
    let failed = cluster.take_completion(1, doomed_a).expect("failed submit");
    assert_eq!(failed.status, Status::Error);
    assert_eq!(failed.error, Some(RaftErrorKind::NoLeader));
    let failed = cluster.take_completion(1, doomed_b).expect("failed submit");
    assert_eq!(failed.error, Some(RaftErrorKind::NoLeader));

    // The divergent suffix is gone; member 1 matches the new leader.
    assert_eq!(cluster.state_machine(1).value(b"doomed"), None);
    assert_eq!(
        cluster.state_machine(1).value(b"real-4"),
        Some(Bytes::from_static(b"yes"))
    );
    let commit = cluster.context(2).commit_index();
    assert_eq!(cluster.context(1).commit_index(), commit);
    assert_cluster_invariants(&cluster);
}

/// S5: a passive member catches up on committed entries through gossip
/// without ever voting.
#[test]
fn test_passive_catch_up() {
    let mut cluster = Cluster::new(3, 1);
    cluster.elect(1);

    for i in 0..50 {
        cluster.submit_command(1, &format!("key-{i}"), &format!("value-{i}"));
    }
    cluster.run_until_idle();
    cluster.tick_all();

    // A few gossip rounds (driven by the leader's heartbeat tick) carry
    // the committed prefix to the passive member.
    for _ in 0..5 {
        cluster.tick_all();
    }

    let passive = cluster.context(4);
    assert_eq!(passive.role_kind(), RoleKind::Passive);
    assert_eq!(passive.commit_index(), cluster.context(1).commit_index());
    assert_eq!(cluster.state_machine(4).applied_count(), 50);
    assert_eq!(
        cluster.state_machine(4).value(b"key-49"),
        Some(Bytes::from_static(b"value-49"))
    );

    // The passive member never led a term.
    for leaders in cluster.leaders_by_term().values() {
        assert!(!leaders.contains(&4));
    }
    assert_cluster_invariants(&cluster);
}

/// S5 addendum: passive members gossip among themselves, so a passive
/// member unreachable from the leader still converges.
#[test]
fn test_passive_to_passive_gossip() {
    let mut cluster = Cluster::new(3, 2);
    cluster.elect(1);
    for i in 0..10 {
        cluster.submit_command(1, &format!("key-{i}"), "v");
    }
    cluster.run_until_idle();
    cluster.tick_all();

    // Member 5 cannot hear the leader, only fellow passive member 4.
    cluster.partition(&[1, 2, 3], &[5]);
    for _ in 0..12 {
        cluster.tick_all();
    }

    assert_eq!(
        cluster.context(4).commit_index(),
        cluster.context(1).commit_index()
    );
    assert_eq!(
        cluster.context(5).commit_index(),
        cluster.context(1).commit_index()
    );
    assert_eq!(cluster.state_machine(5).applied_count(), 10);
    assert_cluster_invariants(&cluster);
}

/// S6: compaction on disk survives a clean shutdown and restart.
#[test]
fn test_compaction_and_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = LogConfig::new(dir.path(), "copycat").with_max_entries_per_segment(1000);
    let total: u64 = 10_000;

    let sealed_ids: Vec<SegmentId>;
    {
        let mut log = Log::open(FsStorage::new(), config.clone()).unwrap();
        for i in 1..=total {
            let entry = Entry::new(
                LogIndex::new(i),
                TermId::new(1),
                EntryKind::Command,
                i,
                Bytes::copy_from_slice(format!("k{i}").as_bytes()),
                Bytes::copy_from_slice(format!("v{i}").as_bytes()),
            )
            .unwrap();
            log.append(&entry).unwrap();
        }
        log.commit(LogIndex::new(total)).unwrap();

        sealed_ids = log
            .segments()
            .filter(|s| s.is_sealed())
            .map(|s| s.descriptor().id)
            .collect();
        assert_eq!(sealed_ids.len(), 9);

        for &id in &sealed_ids {
            log.compact(id, &mut |entry| entry.index.get() % 2 == 0).unwrap();
        }
        assert_segments_tile(&log);
        log.close().unwrap();
    }

    let log = Log::open(FsStorage::new(), config).unwrap();
    assert_eq!(log.last_index().unwrap().get(), total);
    assert_segments_tile(&log);

    // Compacted segments carry a bumped, locked descriptor.
    for segment in log.segments().take(9) {
        assert_eq!(segment.descriptor().version.get(), 2);
        assert!(segment.descriptor().locked);
    }

    // Even indexes in compacted segments read back byte-identical; odd
    // ones are gone. The final (uncompacted) segment still has both.
    for i in (2..=9000u64).step_by(2) {
        let entry = log.get(LogIndex::new(i)).unwrap();
        assert_eq!(entry.key, format!("k{i}").as_bytes());
        assert_eq!(entry.payload, format!("v{i}").as_bytes());
        assert_eq!(entry.term, TermId::new(1));
        assert_eq!(entry.timestamp, i);
    }
    for i in (1..=9000u64).step_by(2) {
        assert!(matches!(
            log.get(LogIndex::new(i)),
            Err(LogError::NotFound { .. })
        ));
    }
    assert!(log.get(LogIndex::new(9001)).is_ok());
    assert!(log.get(LogIndex::new(10_000)).is_ok());
}

/// Property 7: compacting twice with the same retained set yields the
/// same entries, differing only in version.
#[test]
fn test_compaction_idempotence() {
    let dir = tempfile::tempdir().unwrap();
    let config = LogConfig::new(dir.path(), "copycat").with_max_entries_per_segment(100);
    let mut log = Log::open(FsStorage::new(), config).unwrap();

    for i in 1..=200u64 {
        let entry = Entry::new(
            LogIndex::new(i),
            TermId::new(1),
            EntryKind::Command,
            0,
            Bytes::new(),
            Bytes::copy_from_slice(format!("v{i}").as_bytes()),
        )
        .unwrap();
        log.append(&entry).unwrap();
    }
    log.commit(LogIndex::new(200)).unwrap();

    let id = log.segments().next().unwrap().descriptor().id;
    log.compact(id, &mut |entry| entry.index.get() % 2 == 0).unwrap();
    let first_pass: Vec<_> = (1..=100u64)
        .filter_map(|i| log.get(LogIndex::new(i)).ok())
        .collect();

    log.compact(id, &mut |entry| entry.index.get() % 2 == 0).unwrap();
    let second_pass: Vec<_> = (1..=100u64)
        .filter_map(|i| log.get(LogIndex::new(i)).ok())
        .collect();

    assert_eq!(first_pass, second_pass);
    assert_eq!(
        log.segments().next().unwrap().descriptor().version.get(),
        3
    );
}

/// A serializable query is answered from any member's applied state; a
/// linearizable query is answered by the leader.
#[test]
fn test_query_consistency_levels() {
    let mut cluster = Cluster::new(3, 0);
    cluster.elect(1);
    cluster.submit_command(1, "color", "green");
    cluster.run_until_idle();
    cluster.tick_all();

    // Serializable read on a follower.
    let submission = cluster.submit(
        2,
        Operation::Query {
            key: Bytes::from_static(b"color"),
            payload: Bytes::new(),
            consistency: Consistency::Serializable,
        },
    );
    cluster.run_until_idle();
    let response = cluster.take_completion(2, submission).expect("completed");
    assert_eq!(response.result, Some(Bytes::from_static(b"green")));

    // Strict linearizable read on the leader completes after a quorum
    // heartbeat round.
    let submission = cluster.submit(
        1,
        Operation::Query {
            key: Bytes::from_static(b"color"),
            payload: Bytes::new(),
            consistency: Consistency::LinearizableStrict,
        },
    );
    cluster.run_until_idle();
    assert!(cluster.take_completion(1, submission).is_none());

    cluster.tick_all();
    let response = cluster.take_completion(1, submission).expect("completed");
    assert_eq!(response.result, Some(Bytes::from_static(b"green")));
    assert_cluster_invariants(&cluster);
}

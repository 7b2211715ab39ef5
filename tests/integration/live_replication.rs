//! Integration test: live replication.
//!
//! Forwarders push changes between replicas as they happen while
//! persistent change log sessions follow each replica.

use std::collections::BTreeSet;
use std::sync::Arc;

use tidemark_ecl::{EclEntry, EclEvent, EclRequest, EclSession, Phase, SearchMode};
use tidemark_integration_tests::IntegrationCluster;
use tidemark_types::Csn;

async fn next_change(session: &mut EclSession) -> EclEntry {
    match session.next().await.unwrap() {
        EclEvent::Change(entry) => entry,
        other => panic!("expected a change, got {other:?}"),
    }
}

fn persistent() -> EclRequest {
    EclRequest::new().with_mode(SearchMode::Persistent)
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_session_follows_forwarded_changes() {
    let c = IntegrationCluster::new(2, &["o=a", "o=b"]);
    let _forward = c.spawn_forwarder(0, 1);
    let mut session = EclSession::open(&c.replica(1).registry, persistent()).unwrap();

    let mut published = Vec::new();
    for i in 0..5 {
        let suffix = if i % 2 == 0 { "o=a" } else { "o=b" };
        published.push(c.replica(0).add_user(suffix, &format!("u{i}")).csn);
    }

    let mut seen = Vec::new();
    while seen.len() < published.len() {
        seen.push(next_change(&mut session).await.record.csn);
    }
    assert_eq!(seen, published);
    assert_eq!(session.phase(), Phase::Live);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(10000)]
async fn test_concurrent_writers_on_both_replicas() {
    const PER_WRITER: usize = 50;

    let c = IntegrationCluster::new(2, &["o=a", "o=b"]);
    let _forward_01 = c.spawn_forwarder(0, 1);
    let _forward_10 = c.spawn_forwarder(1, 0);

    let mut sessions: Vec<EclSession> = (0..2)
        .map(|i| EclSession::open(&c.replica(i).registry, persistent()).unwrap())
        .collect();

    let writers: Vec<_> = (0..2)
        .map(|w| {
            let replica = Arc::clone(c.replica(w));
            tokio::spawn(async move {
                let mut csns = Vec::with_capacity(PER_WRITER);
                for i in 0..PER_WRITER {
                    let suffix = if i % 2 == 0 { "o=a" } else { "o=b" };
                    csns.push(replica.add_user(suffix, &format!("w{w}-u{i}")).csn);
                    tokio::task::yield_now().await;
                }
                csns
            })
        })
        .collect();

    let mut published = BTreeSet::new();
    for writer in writers {
        published.extend(writer.await.unwrap());
    }

    for (i, session) in sessions.iter_mut().enumerate() {
        let mut seen = BTreeSet::new();
        while seen.len() < published.len() {
            let csn = next_change(session).await.record.csn;
            assert!(seen.insert(csn), "replica {i} delivered {csn} twice");
        }
        assert_eq!(seen, published, "replica {i}");
    }
    assert!(c.converged());
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_changes_dropped_during_outage_are_healed() {
    let c = IntegrationCluster::new(2, &["o=a"]);
    let _forward = c.spawn_forwarder(0, 1);
    let mut session = EclSession::open(&c.replica(1).registry, persistent()).unwrap();

    let before = c.replica(0).add_user("o=a", "before");
    assert_eq!(next_change(&mut session).await.record.csn, before.csn);

    c.kill_replica(1);
    let lost: Vec<Csn> = (0..3)
        .map(|i| c.replica(0).add_user("o=a", &format!("lost{i}")).csn)
        .collect();
    // Let the forwarder drop them.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(!c.replica(1).domain("o=a").server_state().covers(&lost[0]));

    c.revive_replica(1);
    assert_eq!(c.replicate(0, 1), 3);

    let mut healed = Vec::new();
    while healed.len() < lost.len() {
        healed.push(next_change(&mut session).await.record.csn);
    }
    assert_eq!(healed, lost);
}

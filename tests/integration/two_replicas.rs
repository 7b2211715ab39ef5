//! Integration test: two replicas, two naming contexts.
//!
//! Replica 1 writes to `o=a`, replica 2 writes to `o=b`. Once the changes
//! are exchanged, either replica presents both in one change log, and a
//! cookie taken on one resumes on the other.

use tidemark_ecl::{EclEvent, EclRequest, EclSession, SearchMode};
use tidemark_integration_tests::{IntegrationCluster, csns};
use tidemark_types::{MultiDomainServerState, ReplicaId};

#[tokio::test]
async fn test_fresh_cursor_returns_both_then_done() {
    let c = IntegrationCluster::new(2, &["o=a", "o=b"]);
    let r1 = c.replica(0).add_user("o=a", "alice");
    let r2 = c.replica(1).add_user("o=b", "bob");
    assert_eq!(c.sync_all(), 2);
    assert!(c.converged());

    for i in 0..c.len() {
        let (entries, cookie) = c.replica(i).read_all(EclRequest::new()).await;
        assert_eq!(csns(&entries), vec![r1.csn, r2.csn], "replica {i}");
        assert_eq!(entries[0].replica_id(), ReplicaId::new(1));
        assert_eq!(entries[1].replica_id(), ReplicaId::new(2));
        assert_eq!(
            cookie.to_string(),
            format!("o=a:{};o=b:{};", r1.csn, r2.csn),
            "replica {i}"
        );
    }
}

#[tokio::test]
async fn test_resume_on_other_replica_returns_only_new_change() {
    let c = IntegrationCluster::new(2, &["o=a", "o=b"]);
    c.replica(0).add_user("o=a", "alice");
    c.replica(1).add_user("o=b", "bob");
    c.sync_all();

    let (_, cookie) = c.replica(0).read_all(EclRequest::new()).await;

    let newer = c.replica(0).add_user("o=a", "carol");
    c.sync_all();

    let request = EclRequest::new().with_cookie_str(&cookie.to_string()).unwrap();
    let (entries, resumed) = c.replica(1).read_all(request).await;
    assert_eq!(csns(&entries), vec![newer.csn]);
    assert_eq!(entries[0].record.target_dn, "uid=carol,o=a");
    assert!(resumed.get(&entries[0].suffix).unwrap().covers(&newer.csn));
}

#[tokio::test]
async fn test_unsynced_replica_sees_only_local_changes() {
    let c = IntegrationCluster::new(2, &["o=a", "o=b"]);
    let r1 = c.replica(0).add_user("o=a", "alice");
    c.replica(1).add_user("o=b", "bob");

    let (entries, cookie) = c.replica(0).read_all(EclRequest::new()).await;
    assert_eq!(csns(&entries), vec![r1.csn]);
    assert_eq!(cookie.to_string(), format!("o=a:{};o=b:;", r1.csn));
}

#[tokio::test]
async fn test_cookie_round_trip() {
    let c = IntegrationCluster::new(2, &["o=a", "o=b"]);
    c.replica(0).add_user("o=a", "alice");
    c.replica(1).add_user("o=a", "bob");
    c.replica(1).add_user("o=b", "carol");
    c.sync_all();

    let (entries, cookie) = c.replica(0).read_all(EclRequest::new()).await;
    assert_eq!(entries.len(), 3);

    for entry in &entries {
        let text = entry.cookie.to_string();
        let parsed = MultiDomainServerState::parse(&text).unwrap();
        assert_eq!(parsed, entry.cookie);
        assert!(parsed.equals_to(&entry.cookie));
    }

    // The last entry's cookie is the session's final cookie.
    assert_eq!(entries[2].cookie, cookie);
    assert_eq!(cookie, c.replica(1).server_states());
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_changes_only_on_both_replicas() {
    let c = IntegrationCluster::new(2, &["o=a", "o=b"]);
    c.replica(0).add_user("o=a", "old");
    c.sync_all();

    let request = EclRequest::new().with_mode(SearchMode::ChangesOnly);
    let mut sessions: Vec<_> = (0..2)
        .map(|i| EclSession::open(&c.replica(i).registry, request.clone()).unwrap())
        .collect();

    let fresh = c.replica(1).add_user("o=b", "new");
    c.sync_all();

    for session in &mut sessions {
        match session.next().await.unwrap() {
            EclEvent::Change(entry) => assert_eq!(entry.record.csn, fresh.csn),
            other => panic!("expected a change, got {other:?}"),
        }
    }
}

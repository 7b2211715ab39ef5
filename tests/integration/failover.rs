//! Integration test: reader failover.
//!
//! A change log reader moves to another replica with its cookie after the
//! first one becomes unreachable. It never sees a change twice, and never
//! misses one the new replica holds.

use tidemark_ecl::EclRequest;
use tidemark_integration_tests::{IntegrationCluster, csns};

/// Read part of the log on replica 0, lose it, finish on replica 1.
#[tokio::test]
async fn test_failover_mid_stream() {
    let c = IntegrationCluster::new(2, &["o=a", "o=b"]);
    for i in 0..10 {
        let suffix = if i % 3 == 0 { "o=b" } else { "o=a" };
        c.replica(i % 2).add_user(suffix, &format!("u{i}"));
    }
    c.sync_all();

    let (all, _) = c.replica(0).read_all(EclRequest::new()).await;
    assert_eq!(all.len(), 10);
    let checkpoint = all[4].cookie.clone();

    c.kill_replica(0);
    let later = c.replica(1).add_user("o=a", "later");

    let request = EclRequest::new().with_cookie(checkpoint);
    let (rest, _) = c.replica(1).read_all(request).await;

    let mut want = csns(&all[5..]);
    want.push(later.csn);
    assert_eq!(csns(&rest), want);
}

/// Replica 1 never received a change the reader already saw on replica 0.
#[tokio::test]
async fn test_failover_to_replica_missing_changes() {
    let c = IntegrationCluster::new(2, &["o=a"]);
    c.replica(0).add_user("o=a", "shared");
    c.sync_all();

    c.kill_replica(1);
    let unsent = c.replica(0).add_user("o=a", "unsent");
    assert_eq!(c.sync_all(), 0);

    let (seen, cookie) = c.replica(0).read_all(EclRequest::new()).await;
    assert_eq!(seen.len(), 2);

    c.kill_replica(0);
    c.revive_replica(1);
    let local = c.replica(1).add_user("o=a", "local");

    let (entries, cookie) = c
        .replica(1)
        .read_all(EclRequest::new().with_cookie(cookie))
        .await;
    assert_eq!(csns(&entries), vec![local.csn]);
    // The cookie still remembers what was read on replica 0.
    assert!(cookie.get(&entries[0].suffix).unwrap().covers(&unsent.csn));

    // Once the partition heals, the late arrival is not replayed.
    c.revive_replica(0);
    assert_eq!(c.sync_all(), 2);
    let (entries, _) = c
        .replica(1)
        .read_all(EclRequest::new().with_cookie(cookie))
        .await;
    assert!(entries.is_empty());
}

/// A cookie from a replica that is ahead resumes on one that is behind.
#[tokio::test]
async fn test_cookie_ahead_of_replica() {
    let c = IntegrationCluster::new(3, &["o=a"]);
    c.replica(0).add_user("o=a", "one");
    c.replicate(0, 1);
    c.replica(0).add_user("o=a", "two");

    let (_, cookie) = c.replica(0).read_all(EclRequest::new()).await;

    // Replica 1 only has the first change, and its own.
    let own = c.replica(1).add_user("o=a", "own");
    let (entries, _) = c
        .replica(1)
        .read_all(EclRequest::new().with_cookie(cookie))
        .await;
    assert_eq!(csns(&entries), vec![own.csn]);
}

//! Integration test: convergence.
//!
//! Three replicas write concurrently to two naming contexts with partial,
//! randomly ordered exchanges in between. After a full exchange every
//! replica presents the same change log and cookies move freely between
//! replicas.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tidemark_ecl::EclRequest;
use tidemark_integration_tests::{IntegrationCluster, csns};

const SUFFIXES: [&str; 2] = ["o=a", "o=b"];

/// Random writes and random pairwise exchanges. Returns the number of
/// writes.
fn random_workload(c: &IntegrationCluster, seed: u64, writes: usize) -> usize {
    let mut rng = StdRng::seed_from_u64(seed);
    for i in 0..writes {
        let writer = rng.random_range(0..c.len());
        let suffix = SUFFIXES[rng.random_range(0..SUFFIXES.len())];
        c.replica(writer).add_user(suffix, &format!("u{i}"));

        if rng.random_bool(0.3) {
            let from = rng.random_range(0..c.len());
            let to = rng.random_range(0..c.len());
            c.replicate(from, to);
        }
    }
    writes
}

#[tokio::test]
async fn test_replicas_converge_to_one_change_log() {
    let c = IntegrationCluster::new(3, &SUFFIXES);
    let writes = random_workload(&c, 7, 120);
    c.sync_all();
    assert!(c.converged());

    let (reference, reference_cookie) = c.replica(0).read_all(EclRequest::new()).await;
    assert_eq!(reference.len(), writes);

    let order = csns(&reference);
    let mut sorted = order.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(order, sorted, "change log must be in strictly increasing CSN order");

    for i in 1..c.len() {
        let (entries, cookie) = c.replica(i).read_all(EclRequest::new()).await;
        assert_eq!(csns(&entries), order, "replica {i}");
        assert_eq!(cookie, reference_cookie, "replica {i}");
    }
}

#[tokio::test]
async fn test_intermediate_cookies_resume_on_any_replica() {
    let c = IntegrationCluster::new(3, &SUFFIXES);
    random_workload(&c, 11, 30);
    c.sync_all();

    let (all, _) = c.replica(0).read_all(EclRequest::new()).await;
    let order = csns(&all);

    for (k, entry) in all.iter().enumerate() {
        let reader = k % c.len();
        let request = EclRequest::new().with_cookie(entry.cookie.clone());
        let (rest, _) = c.replica(reader).read_all(request).await;
        assert_eq!(
            csns(&rest),
            order[k + 1..].to_vec(),
            "resuming after entry {k} on replica {reader}"
        );
    }
}

#[tokio::test]
async fn test_redelivery_is_absorbed() {
    let c = IntegrationCluster::new(3, &SUFFIXES);
    random_workload(&c, 3, 40);

    assert!(c.sync_all() > 0);
    assert_eq!(c.sync_all(), 0);

    let counts: Vec<usize> = (0..c.len())
        .map(|i| {
            SUFFIXES
                .iter()
                .map(|s| c.replica(i).domain(s).change_count().unwrap())
                .sum()
        })
        .collect();
    assert_eq!(counts, vec![40; 3]);
}

#[tokio::test]
async fn test_lagging_clock_stays_causal() {
    let c = IntegrationCluster::new(2, &SUFFIXES);
    c.replica(0).clock.set(50_000);
    let ahead = c.replica(0).add_user("o=a", "ahead");

    // Replica 2's clock is far behind, but what it has seen bounds what it
    // issues next.
    c.sync_all();
    let behind = c.replica(1).add_user("o=a", "behind");
    assert!(behind.csn > ahead.csn);

    c.sync_all();
    let (entries, _) = c.replica(0).read_all(EclRequest::new()).await;
    assert_eq!(csns(&entries), vec![ahead.csn, behind.csn]);
}

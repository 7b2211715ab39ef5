//! Integration test: replica restart.
//!
//! A replica backed by an on-disk change log is stopped and reopened. Its
//! server state, history and trim point survive, and its CSN generator
//! never reissues a CSN, even when the clock restarts behind.

use std::path::Path;
use std::sync::Arc;

use tidemark_changelog::ChangelogStore;
use tidemark_ecl::{EclError, EclRequest, EclSession};
use tidemark_integration_tests::{CLOCK_START, TestReplica, csns, suffix_of};
use tidemark_types::{ManualClock, ReplicaId};

fn open_replica(dir: &Path) -> TestReplica {
    let store = ChangelogStore::open(dir).unwrap();
    TestReplica::open(
        ReplicaId::new(1),
        &[suffix_of("o=a"), suffix_of("o=b")],
        Arc::new(store),
        Arc::new(ManualClock::new(CLOCK_START)),
    )
}

#[tokio::test]
async fn test_state_and_history_survive_restart() {
    let dir = tempfile::tempdir().unwrap();

    let (before, cookie) = {
        let replica = open_replica(dir.path());
        replica.add_user("o=a", "alice");
        replica.add_user("o=b", "bob");
        replica.read_all(EclRequest::new()).await
    };
    assert_eq!(before.len(), 2);

    let replica = open_replica(dir.path());
    assert_eq!(replica.server_states(), cookie);

    let (again, _) = replica.read_all(EclRequest::new()).await;
    assert_eq!(csns(&again), csns(&before));

    // Same clock start as before the restart; the generator still moves on.
    let next = replica.add_user("o=a", "carol");
    assert!(before.iter().all(|e| e.record.csn < next.csn));

    let (resumed, _) = replica
        .read_all(EclRequest::new().with_cookie(cookie))
        .await;
    assert_eq!(csns(&resumed), vec![next.csn]);
}

#[tokio::test]
async fn test_trim_point_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    let (stale, keep) = {
        let replica = open_replica(dir.path());
        replica.add_user("o=a", "alice");
        let (_, stale) = replica.read_all(EclRequest::new()).await;
        replica.add_user("o=a", "bob");
        let keep = replica.add_user("o=a", "carol");
        assert_eq!(replica.domain("o=a").trim_before(&keep.csn).unwrap(), 2);
        (stale, keep)
    };

    let replica = open_replica(dir.path());
    assert!(!replica.domain("o=a").trimmed_state().covers(&keep.csn));
    assert_eq!(replica.domain("o=a").change_count().unwrap(), 1);

    let err = EclSession::open(&replica.registry, EclRequest::new().with_cookie(stale))
        .unwrap_err();
    assert!(matches!(err, EclError::CookieTooOld { suffix } if suffix == suffix_of("o=a")));

    let (entries, _) = replica.read_all(EclRequest::new()).await;
    assert_eq!(csns(&entries), vec![keep.csn]);
}

//! Crash-recovery and membership-fault tests: log replay on restart,
//! participant removal on timeout, heartbeat readmission, and snapshot
//! recovery with the deletion shadow set.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{
    reserve_addr, start_coordinator, start_fake_participant, start_participant, wait_until,
    FakeState, TestParticipant, RPC_TIMEOUT,
};
use pact_store::record_log::{Record, RecordLog, RecordStatus};
use pact_store::{KvClient, ParticipantClient};

const CONVERGE_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn unresolved_record_is_redriven_as_abort_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("coordinator.log");

    // A previous incarnation crashed after logging UNRESOLVED(42).
    {
        let mut log = RecordLog::open(&log_path).unwrap();
        log.append(Record {
            status: RecordStatus::Unresolved,
            tid: 42,
            next_id: 43,
        })
        .unwrap();
    }

    // The participant had prepared tid 42, so its counter already moved on.
    let fake = FakeState::new();
    fake.next_id.store(43, Ordering::SeqCst);
    let participant = start_fake_participant(fake.clone()).await;

    let (_addr, coordinator) = start_coordinator(vec![participant], log_path.clone()).await;
    assert_eq!(coordinator.next_id(), 43);

    assert!(fake.calls().contains(&"ABORT 42".to_string()));
    let latest = RecordLog::open(&log_path).unwrap().latest_by_tid().unwrap();
    assert_eq!(latest[&42].status, RecordStatus::AbortDone);
}

#[tokio::test]
async fn commit_record_is_redriven_as_commit_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("coordinator.log");

    // Crash landed between COMMIT and COMMIT_DONE.
    {
        let mut log = RecordLog::open(&log_path).unwrap();
        log.append(Record {
            status: RecordStatus::Unresolved,
            tid: 7,
            next_id: 8,
        })
        .unwrap();
        log.append(Record {
            status: RecordStatus::Commit,
            tid: 7,
            next_id: 8,
        })
        .unwrap();
    }

    let fake = FakeState::new();
    fake.next_id.store(8, Ordering::SeqCst);
    let participant = start_fake_participant(fake.clone()).await;

    let (_addr, _coordinator) = start_coordinator(vec![participant], log_path.clone()).await;

    assert!(fake.calls().contains(&"COMMIT 7".to_string()));
    let latest = RecordLog::open(&log_path).unwrap().latest_by_tid().unwrap();
    assert_eq!(latest[&7].status, RecordStatus::CommitDone);
}

#[tokio::test]
async fn commit_timeout_drops_the_participant_and_heartbeat_readmits_it() {
    let dir = tempfile::tempdir().unwrap();
    let real = start_participant().await;
    let fake = FakeState::new();
    let flaky = start_fake_participant(fake.clone()).await;
    let (addr, coordinator) =
        start_coordinator(vec![real, flaky], dir.path().join("coordinator.log")).await;
    assert_eq!(coordinator.live_participants().await.len(), 2);

    // Stall COMMIT on the flaky participant so its call times out while the
    // healthy one commits.
    fake.stall_commit.store(true, Ordering::SeqCst);
    let mut client = KvClient::connect(addr).await.unwrap();
    let set = tokio::spawn(async move { client.set(b"k", b"v").await });

    // Once COMMIT reaches the flaky participant, take it fully offline so the
    // removal is observable before any readmission.
    let reached = wait_until(CONVERGE_TIMEOUT, || {
        let fake = fake.clone();
        async move { fake.calls().iter().any(|c| c.starts_with("COMMIT ")) }
    })
    .await;
    assert!(reached, "flaky participant never saw the COMMIT call");
    fake.dead.store(true, Ordering::SeqCst);

    // The client still gets the healthy participant's reply.
    assert!(set.await.unwrap().unwrap());
    let shrunk = wait_until(CONVERGE_TIMEOUT, || {
        let coordinator = coordinator.clone();
        async move { coordinator.live_participants().await == vec![real] }
    })
    .await;
    assert!(shrunk, "flaky participant was not removed");

    // Back from the dead: its counter matches, so readmission is immediate.
    fake.stall_commit.store(false, Ordering::SeqCst);
    fake.dead.store(false, Ordering::SeqCst);
    let rejoined = wait_until(CONVERGE_TIMEOUT, || {
        let coordinator = coordinator.clone();
        async move { coordinator.live_participants().await.len() == 2 }
    })
    .await;
    assert!(rejoined, "flaky participant was not readmitted");

    let mut client = KvClient::connect(addr).await.unwrap();
    assert!(client.set(b"k2", b"v2").await.unwrap());
}

#[tokio::test]
async fn degraded_del_is_replayed_into_the_snapshot_recovered_participant() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("coordinator.log");

    // Coordinator starts before its participants exist; both get admitted
    // through the heartbeat path.
    let addr_a = reserve_addr();
    let addr_b = reserve_addr();
    let (addr, coordinator) = start_coordinator(vec![addr_a, addr_b], log_path).await;
    assert!(coordinator.live_participants().await.is_empty());

    let _first = TestParticipant::start(Some(addr_a));
    let mut second = TestParticipant::start(Some(addr_b));

    let both_up = wait_until(CONVERGE_TIMEOUT, || {
        let coordinator = coordinator.clone();
        async move { coordinator.live_participants().await.len() == 2 }
    })
    .await;
    assert!(both_up, "participants were not admitted");

    let mut client = KvClient::connect(addr).await.unwrap();
    assert!(client.set(b"k1", b"v1").await.unwrap());
    assert!(client.set(b"k2", b"v2").await.unwrap());

    // Lose one replica, then delete under degraded membership.
    second.kill();
    assert_eq!(client.del(&[b"k1".as_slice()]).await.unwrap(), Some(1));
    assert_eq!(coordinator.pending_del_keys().await, 1);

    // The replica returns empty; heartbeat restores it from the survivor's
    // snapshot plus the deletion shadow set.
    let revived = TestParticipant::start(Some(second.addr));
    let recovered = wait_until(CONVERGE_TIMEOUT, || {
        let coordinator = coordinator.clone();
        async move { coordinator.live_participants().await.len() == 2 }
    })
    .await;
    assert!(recovered, "replica was not snapshot-recovered");
    assert_eq!(coordinator.pending_del_keys().await, 0);

    let direct = ParticipantClient::connect(revived.addr, RPC_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(direct.get(b"k2").await.unwrap(), Some(b"v2".to_vec()));
    assert_eq!(direct.get(b"k1").await.unwrap(), None);
    assert_eq!(direct.next_id().await.unwrap(), coordinator.next_id());
}

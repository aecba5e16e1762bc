//! Unit tests for the instance-group protocol: freeze, fan-out, timeout
//! and thaw.

use std::sync::Arc;
use std::time::Duration;

use rstest::rstest;
use uuid::Uuid;

use super::{GroupBackupRequest, GroupError, GroupTimings, InstanceGroupCoordinator, TIMEOUT_REASON};
use crate::bus::{InProcessBus, ServiceRecord, ServiceRegistry};
use crate::executor::{BackupExecutor, ExecutorConfig};
use crate::model::{Attachment, BackupStatus, PowerState, Volume, VolumeStatus};
use crate::orchestrator::{BackupOrchestrator, OrchestratorError};
use crate::quota::{QuotaError, QuotaLedger, QuotaLimits};
use crate::service::ExecutorService;
use crate::store::RecordStore;
use crate::test_support::{FakeBackupDriver, FakeComputeAgent, FakeVolumeDriver};

struct Harness {
    store: Arc<RecordStore>,
    quotas: Arc<QuotaLedger>,
    backup_driver: Arc<FakeBackupDriver>,
    compute: Arc<FakeComputeAgent>,
    coordinator: InstanceGroupCoordinator,
    server: tokio::task::JoinHandle<()>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn harness_with_limits(limits: QuotaLimits, timings: GroupTimings) -> Harness {
    let store = Arc::new(RecordStore::new());
    let quotas = Arc::new(QuotaLedger::new(limits));
    let registry = Arc::new(ServiceRegistry::new());
    let bus = Arc::new(InProcessBus::new());
    let mailbox = bus.register("host-1").await;
    let backup_driver = Arc::new(FakeBackupDriver::new("fake"));
    let volume_driver = Arc::new(FakeVolumeDriver::new(store.clone(), "host-1", "zone-a"));
    let compute = Arc::new(FakeComputeAgent::new());

    let executor = Arc::new(BackupExecutor::new(
        ExecutorConfig {
            host: "host-1".to_owned(),
            availability_zone: "zone-a".to_owned(),
        },
        store.clone(),
        quotas.clone(),
        volume_driver.clone(),
        backup_driver.clone(),
        bus.clone(),
    ));
    let service = ExecutorService::new(executor, registry.clone(), 4);
    let server = tokio::spawn(async move { service.serve(mailbox).await });
    // The sweep runs before registration, so waiting for the registry
    // guarantees recovery has finished before any record exists.
    while !registry.is_backup_service_enabled("zone-a", "host-1").await {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let orchestrator = Arc::new(BackupOrchestrator::new(
        store.clone(),
        quotas.clone(),
        registry,
        bus.clone(),
        volume_driver,
        compute.clone(),
        Duration::from_millis(10),
    ));
    let coordinator = InstanceGroupCoordinator::new(
        store.clone(),
        orchestrator,
        compute.clone(),
        bus,
        timings,
    );
    Harness {
        store,
        quotas,
        backup_driver,
        compute,
        coordinator,
        server,
    }
}

fn quick_timings() -> GroupTimings {
    GroupTimings {
        poll_interval: Duration::from_millis(10),
        max_polls: 20,
        thaw_retry_delay: Duration::from_millis(10),
    }
}

async fn harness() -> Harness {
    harness_with_limits(QuotaLimits::default(), quick_timings()).await
}

async fn seed_attached_volume(harness: &Harness, instance_id: Uuid) -> Volume {
    let mut volume = Volume::new("proj", 10, VolumeStatus::InUse, "host-1", "zone-a");
    volume.attachments.push(Attachment {
        id: Uuid::new_v4(),
        instance_id: Some(instance_id),
        attached_host: "host-1".to_owned(),
    });
    harness
        .store
        .insert_volume(volume.clone())
        .await
        .expect("seed volume");
    volume
}

fn group_request(instance_id: Uuid, volume_ids: Vec<Uuid>) -> GroupBackupRequest {
    GroupBackupRequest {
        instance_id,
        volume_ids,
        display_name: Some("group".to_owned()),
        description: Some("nightly group".to_owned()),
        container: None,
        incremental: false,
        is_periodic: false,
    }
}

#[rstest]
#[tokio::test]
async fn running_instance_is_frozen_backed_up_and_thawed() {
    let harness = harness().await;
    let instance_id = Uuid::new_v4();
    harness
        .compute
        .set_power_state(instance_id, PowerState::Active);
    let first = seed_attached_volume(&harness, instance_id).await;
    let second = seed_attached_volume(&harness, instance_id).await;

    let accepted = harness
        .coordinator
        .backup_instance_group(group_request(instance_id, vec![first.id, second.id]))
        .await
        .expect("group backup");
    assert_eq!(accepted.len(), 2);

    for backup in &accepted {
        let current = harness.store.backup(backup.id).await.expect("read member");
        assert_eq!(current.status, BackupStatus::Available);
        let description = current.description.expect("correlated description");
        assert!(description.ends_with("nightly group"));
    }
    for volume in [&first, &second] {
        let settled = harness.store.volume(volume.id).await.expect("read volume");
        assert_eq!(settled.status, VolumeStatus::InUse);
        assert_eq!(settled.previous_status, None);
    }
    assert_eq!(harness.compute.freeze_calls(), vec![instance_id]);
    assert_eq!(harness.compute.thaw_calls(), vec![instance_id]);
}

#[rstest]
#[tokio::test]
async fn stopped_instance_skips_freeze_and_thaw() {
    let harness = harness().await;
    let instance_id = Uuid::new_v4();
    harness
        .compute
        .set_power_state(instance_id, PowerState::Shutoff);
    let volume = seed_attached_volume(&harness, instance_id).await;

    harness
        .coordinator
        .backup_instance_group(group_request(instance_id, vec![volume.id]))
        .await
        .expect("group backup");

    assert!(harness.compute.freeze_calls().is_empty());
    assert!(harness.compute.thaw_calls().is_empty());
}

#[rstest]
#[tokio::test]
async fn hung_member_gets_the_timeout_reason_and_thaw_runs_once() {
    let harness = harness().await;
    let instance_id = Uuid::new_v4();
    harness
        .compute
        .set_power_state(instance_id, PowerState::Active);
    let first = seed_attached_volume(&harness, instance_id).await;
    let second = seed_attached_volume(&harness, instance_id).await;
    let third = seed_attached_volume(&harness, instance_id).await;
    harness.backup_driver.hang_backups_of_volume(second.id);

    let accepted = harness
        .coordinator
        .backup_instance_group(group_request(
            instance_id,
            vec![first.id, second.id, third.id],
        ))
        .await
        .expect("group backup returns normally on timeout");

    for backup in &accepted {
        let current = harness.store.backup(backup.id).await.expect("read member");
        if backup.volume_id == second.id {
            assert_eq!(current.status, BackupStatus::Error);
            assert_eq!(current.fail_reason.as_deref(), Some(TIMEOUT_REASON));
        } else {
            assert_eq!(current.status, BackupStatus::Available);
            assert_eq!(current.fail_reason, None);
        }
    }
    assert_eq!(harness.compute.thaw_calls(), vec![instance_id]);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn poll_budget_grants_the_full_number_of_waits() {
    let store = Arc::new(RecordStore::new());
    let quotas = Arc::new(QuotaLedger::new(QuotaLimits::default()));
    let registry = Arc::new(ServiceRegistry::new());
    registry
        .register(ServiceRecord {
            host: "host-1".to_owned(),
            availability_zone: "zone-a".to_owned(),
            driver_service: "fake".to_owned(),
            enabled: true,
        })
        .await;
    let bus = Arc::new(InProcessBus::new());
    // Hold the mailbox without serving it: the dispatched create never
    // runs, so the member stays pending and every wait is a full sleep.
    let _mailbox = bus.register("host-1").await;
    let volume_driver = Arc::new(FakeVolumeDriver::new(store.clone(), "host-1", "zone-a"));
    let compute = Arc::new(FakeComputeAgent::new());
    let orchestrator = Arc::new(BackupOrchestrator::new(
        store.clone(),
        quotas,
        registry,
        bus.clone(),
        volume_driver,
        compute.clone(),
        Duration::from_millis(10),
    ));
    let timings = GroupTimings {
        poll_interval: Duration::from_millis(25),
        max_polls: 3,
        thaw_retry_delay: Duration::from_millis(10),
    };
    let coordinator =
        InstanceGroupCoordinator::new(store.clone(), orchestrator, compute.clone(), bus, timings);

    let instance_id = Uuid::new_v4();
    compute.set_power_state(instance_id, PowerState::Active);
    let mut volume = Volume::new("proj", 10, VolumeStatus::InUse, "host-1", "zone-a");
    volume.attachments.push(Attachment {
        id: Uuid::new_v4(),
        instance_id: Some(instance_id),
        attached_host: "host-1".to_owned(),
    });
    store
        .insert_volume(volume.clone())
        .await
        .expect("seed volume");

    let started = tokio::time::Instant::now();
    let accepted = coordinator
        .backup_instance_group(group_request(instance_id, vec![volume.id]))
        .await
        .expect("group backup returns normally on timeout");

    // Three polls at 25ms each: the budget is only spent after the waits.
    assert!(started.elapsed() >= Duration::from_millis(75));
    let first_member = accepted.first().expect("accepted member");
    let member = store.backup(first_member.id).await.expect("read member");
    assert_eq!(member.status, BackupStatus::Error);
    assert_eq!(member.fail_reason.as_deref(), Some(TIMEOUT_REASON));
}

#[rstest]
#[tokio::test]
async fn quota_failure_mid_group_unwinds_accepted_members() {
    let harness = harness_with_limits(
        QuotaLimits {
            backups: Some(1),
            backup_gigabytes: Some(100),
        },
        quick_timings(),
    )
    .await;
    let instance_id = Uuid::new_v4();
    harness
        .compute
        .set_power_state(instance_id, PowerState::Active);
    let first = seed_attached_volume(&harness, instance_id).await;
    let second = seed_attached_volume(&harness, instance_id).await;

    let err = harness
        .coordinator
        .backup_instance_group(group_request(instance_id, vec![first.id, second.id]))
        .await
        .expect_err("second member exceeds the count limit");
    assert_eq!(
        err,
        GroupError::Orchestrator(OrchestratorError::Quota(QuotaError::BackupCountExceeded {
            allowed: 1,
            consumed: 1,
        }))
    );

    let reverted = harness.store.volume(first.id).await.expect("read volume");
    assert_eq!(reverted.status, VolumeStatus::InUse);
    assert_eq!(reverted.previous_status, None);
    // The unwind dispatches a deletion; wait for the record and the quota
    // release to land.
    let mut tries = 0;
    loop {
        let destroyed = harness.store.backups_by_volume(first.id).await.is_empty();
        let usage = harness.quotas.usage("proj").await;
        if destroyed && usage.backups.consumed() == 0 && usage.backup_gigabytes.consumed() == 0 {
            break;
        }
        tries += 1;
        assert!(tries < 200, "unwound member was never released");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    // The guest is still thawed exactly once.
    assert_eq!(harness.compute.thaw_calls(), vec![instance_id]);
}

#[rstest]
#[tokio::test]
async fn unknown_instance_is_rejected_before_any_freeze() {
    let harness = harness().await;
    let instance_id = Uuid::new_v4();
    let volume = seed_attached_volume(&harness, instance_id).await;

    let err = harness
        .coordinator
        .backup_instance_group(group_request(instance_id, vec![volume.id]))
        .await
        .expect_err("unknown instance");
    assert!(matches!(err, GroupError::InstanceUnavailable { .. }));
    assert!(harness.compute.freeze_calls().is_empty());
}

#[rstest]
#[tokio::test]
async fn member_volume_outside_in_use_fails_validation() {
    let harness = harness().await;
    let instance_id = Uuid::new_v4();
    harness
        .compute
        .set_power_state(instance_id, PowerState::Active);
    let volume = Volume::new("proj", 10, VolumeStatus::Available, "host-1", "zone-a");
    harness
        .store
        .insert_volume(volume.clone())
        .await
        .expect("seed volume");

    let err = harness
        .coordinator
        .backup_instance_group(group_request(instance_id, vec![volume.id]))
        .await
        .expect_err("members must be in-use");
    assert!(matches!(
        err,
        GroupError::Orchestrator(OrchestratorError::VolumeNotAvailable { .. })
    ));
    assert!(harness.compute.freeze_calls().is_empty());
    assert!(harness.store.backups_by_volume(volume.id).await.is_empty());
}

#[rstest]
#[tokio::test]
async fn empty_group_is_rejected() {
    let harness = harness().await;
    let err = harness
        .coordinator
        .backup_instance_group(group_request(Uuid::new_v4(), Vec::new()))
        .await
        .expect_err("empty group");
    assert_eq!(err, GroupError::EmptyGroup);
}

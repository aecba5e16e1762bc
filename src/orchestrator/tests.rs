//! Unit tests for the orchestrator's acceptance gates and dispatch paths.

use std::sync::Arc;
use std::time::Duration;

use rstest::rstest;
use uuid::Uuid;

use super::{BackupOrchestrator, CreateBackupRequest, OrchestratorError};
use crate::bus::{BusEnvelope, ExecutorRequest, InProcessBus, ServiceRecord, ServiceRegistry};
use crate::chain::ChainError;
use crate::model::{Attachment, Backup, BackupStatus, PowerState, Volume, VolumeStatus};
use crate::quota::{QuotaError, QuotaLedger, QuotaLimits};
use crate::store::RecordStore;
use crate::test_support::{FakeComputeAgent, FakeVolumeDriver};

struct Harness {
    store: Arc<RecordStore>,
    quotas: Arc<QuotaLedger>,
    volume_driver: Arc<FakeVolumeDriver>,
    compute: Arc<FakeComputeAgent>,
    orchestrator: BackupOrchestrator,
    // Keeps host-1's mailbox open so casts are accepted.
    mailbox: tokio::sync::mpsc::Receiver<BusEnvelope>,
}

async fn harness_with_limits(limits: QuotaLimits) -> Harness {
    let store = Arc::new(RecordStore::new());
    let quotas = Arc::new(QuotaLedger::new(limits));
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
    let mailbox = bus.register("host-1").await;
    let volume_driver = Arc::new(FakeVolumeDriver::new(store.clone(), "host-1", "zone-a"));
    let compute = Arc::new(FakeComputeAgent::new());
    let orchestrator = BackupOrchestrator::new(
        store.clone(),
        quotas.clone(),
        registry,
        bus,
        volume_driver.clone(),
        compute.clone(),
        Duration::from_millis(10),
    );
    Harness {
        store,
        quotas,
        volume_driver,
        compute,
        orchestrator,
        mailbox,
    }
}

async fn harness() -> Harness {
    harness_with_limits(QuotaLimits::default()).await
}

async fn seed_volume(harness: &Harness, status: VolumeStatus) -> Volume {
    let volume = Volume::new("proj", 10, status, "host-1", "zone-a");
    harness
        .store
        .insert_volume(volume.clone())
        .await
        .expect("seed volume");
    volume
}

async fn seed_available_backup(harness: &Harness, volume: &Volume, size_mb: u64) -> Backup {
    let mut backup = Backup::new(volume, "host-1");
    backup.status = BackupStatus::Available;
    backup.size_mb = size_mb;
    backup.service = Some("fake".to_owned());
    harness
        .store
        .insert_backup(backup.clone())
        .await
        .expect("seed backup");
    backup
}

#[rstest]
#[tokio::test]
async fn create_accepts_an_available_volume() {
    let mut harness = harness().await;
    let volume = seed_volume(&harness, VolumeStatus::Available).await;

    let backup = harness
        .orchestrator
        .create(CreateBackupRequest::full(volume.id))
        .await
        .expect("create");

    assert_eq!(backup.status, BackupStatus::Creating);
    assert_eq!(backup.parent_id, None);
    assert_eq!(backup.host, "host-1");

    let stored_volume = harness.store.volume(volume.id).await.expect("read volume");
    assert_eq!(stored_volume.status, VolumeStatus::BackingUp);
    assert_eq!(stored_volume.previous_status, Some(VolumeStatus::Available));

    let usage = harness.quotas.usage("proj").await;
    assert_eq!(usage.backups.in_use, 1);
    assert_eq!(usage.backup_gigabytes.in_use, 10);

    let envelope = harness.mailbox.recv().await.expect("dispatched");
    assert_eq!(
        envelope.request,
        ExecutorRequest::CreateBackup { backup_id: backup.id }
    );
}

#[rstest]
#[tokio::test]
async fn create_rejects_a_volume_outside_available() {
    let harness = harness().await;
    let volume = seed_volume(&harness, VolumeStatus::InUse).await;

    let err = harness
        .orchestrator
        .create(CreateBackupRequest::full(volume.id))
        .await
        .expect_err("status gate");
    assert!(matches!(err, OrchestratorError::VolumeNotAvailable { .. }));
    assert!(harness.store.backups_by_volume(volume.id).await.is_empty());
    assert_eq!(harness.quotas.usage("proj").await.backups.consumed(), 0);
}

#[rstest]
#[tokio::test]
async fn create_requires_an_enabled_backup_service() {
    let harness = harness().await;
    let volume = Volume::new("proj", 10, VolumeStatus::Available, "host-9", "zone-a");
    harness
        .store
        .insert_volume(volume.clone())
        .await
        .expect("seed volume");

    let err = harness
        .orchestrator
        .create(CreateBackupRequest::full(volume.id))
        .await
        .expect_err("no coverage");
    assert_eq!(
        err,
        OrchestratorError::NoBackupService {
            host: "host-9".to_owned(),
            availability_zone: "zone-a".to_owned(),
        }
    );
}

#[rstest]
#[tokio::test]
async fn create_over_quota_leaves_no_trace() {
    let harness = harness_with_limits(QuotaLimits {
        backups: Some(10),
        backup_gigabytes: Some(5),
    })
    .await;
    let volume = seed_volume(&harness, VolumeStatus::Available).await;

    let err = harness
        .orchestrator
        .create(CreateBackupRequest::full(volume.id))
        .await
        .expect_err("over quota");
    assert_eq!(
        err,
        OrchestratorError::Quota(QuotaError::CapacityExceeded {
            requested_gb: 10,
            consumed_gb: 0,
            limit_gb: 5,
        })
    );

    let stored_volume = harness.store.volume(volume.id).await.expect("read volume");
    assert_eq!(stored_volume.status, VolumeStatus::Available);
    assert!(harness.store.backups_by_volume(volume.id).await.is_empty());
}

#[rstest]
#[tokio::test]
async fn incremental_create_chains_off_the_latest_available_backup() {
    let mut harness = harness().await;
    let volume = seed_volume(&harness, VolumeStatus::Available).await;
    let parent = seed_available_backup(&harness, &volume, 1024).await;

    let request = CreateBackupRequest {
        incremental: true,
        ..CreateBackupRequest::full(volume.id)
    };
    let backup = harness.orchestrator.create(request).await.expect("create");
    assert_eq!(backup.parent_id, Some(parent.id));
    let _ = harness.mailbox.recv().await.expect("dispatched");
}

#[rstest]
#[tokio::test]
async fn incremental_create_with_a_creating_parent_rolls_the_reservation_back() {
    let harness = harness().await;
    let volume = seed_volume(&harness, VolumeStatus::Available).await;
    let pending = Backup::new(&volume, "host-1");
    harness
        .store
        .insert_backup(pending.clone())
        .await
        .expect("seed pending parent");

    let request = CreateBackupRequest {
        incremental: true,
        ..CreateBackupRequest::full(volume.id)
    };
    let err = harness
        .orchestrator
        .create(request)
        .await
        .expect_err("parent still creating");
    assert_eq!(
        err,
        OrchestratorError::Chain(ChainError::ParentStillCreating {
            backup_id: pending.id
        })
    );

    let usage = harness.quotas.usage("proj").await;
    assert_eq!(usage.backups.reserved, 0);
    assert_eq!(usage.backup_gigabytes.reserved, 0);
    let stored_volume = harness.store.volume(volume.id).await.expect("read volume");
    assert_eq!(stored_volume.status, VolumeStatus::Available);
}

#[rstest]
#[tokio::test]
async fn restore_onto_an_available_volume_dispatches() {
    let mut harness = harness().await;
    let source = seed_volume(&harness, VolumeStatus::Available).await;
    let backup = seed_available_backup(&harness, &source, 2048).await;
    let target = seed_volume(&harness, VolumeStatus::Available).await;

    let handle = harness
        .orchestrator
        .restore(backup.id, Some(target.id))
        .await
        .expect("restore");
    assert_eq!(handle.volume_id, target.id);

    let stored_volume = harness.store.volume(target.id).await.expect("read volume");
    assert_eq!(stored_volume.status, VolumeStatus::RestoringBackup);
    assert_eq!(stored_volume.previous_status, Some(VolumeStatus::Available));
    let stored_backup = harness.store.backup(backup.id).await.expect("read backup");
    assert_eq!(stored_backup.status, BackupStatus::Restoring);

    let envelope = harness.mailbox.recv().await.expect("dispatched");
    assert_eq!(
        envelope.request,
        ExecutorRequest::RestoreBackup {
            backup_id: backup.id,
            volume_id: target.id,
        }
    );
}

#[rstest]
#[tokio::test]
async fn restore_onto_an_in_use_volume_requires_powered_off_instances() {
    let mut harness = harness().await;
    let source = seed_volume(&harness, VolumeStatus::Available).await;
    let backup = seed_available_backup(&harness, &source, 2048).await;
    let instance_id = Uuid::new_v4();
    let mut target = Volume::new("proj", 10, VolumeStatus::InUse, "host-1", "zone-a");
    target.attachments.push(Attachment {
        id: Uuid::new_v4(),
        instance_id: Some(instance_id),
        attached_host: "host-1".to_owned(),
    });
    harness
        .store
        .insert_volume(target.clone())
        .await
        .expect("seed target");

    harness
        .compute
        .set_power_state(instance_id, PowerState::Active);
    let err = harness
        .orchestrator
        .restore(backup.id, Some(target.id))
        .await
        .expect_err("running instance");
    assert!(matches!(err, OrchestratorError::InvalidVolume { .. }));

    harness
        .compute
        .set_power_state(instance_id, PowerState::Shutoff);
    harness
        .orchestrator
        .restore(backup.id, Some(target.id))
        .await
        .expect("powered off");
    let stored_volume = harness.store.volume(target.id).await.expect("read volume");
    assert_eq!(stored_volume.previous_status, Some(VolumeStatus::InUse));
    let _ = harness.mailbox.recv().await.expect("dispatched");
}

#[rstest]
#[tokio::test]
async fn restore_rejects_a_target_too_small_for_the_backup() {
    let harness = harness().await;
    let source = seed_volume(&harness, VolumeStatus::Available).await;
    let backup = seed_available_backup(&harness, &source, 11 * 1024).await;
    let target = seed_volume(&harness, VolumeStatus::Available).await;

    let err = harness
        .orchestrator
        .restore(backup.id, Some(target.id))
        .await
        .expect_err("capacity");
    assert!(matches!(err, OrchestratorError::InvalidVolume { .. }));
    let stored_volume = harness.store.volume(target.id).await.expect("read volume");
    assert_eq!(stored_volume.status, VolumeStatus::Available);
}

#[rstest]
#[tokio::test]
async fn restore_without_a_target_provisions_one() {
    let mut harness = harness().await;
    let source = seed_volume(&harness, VolumeStatus::Available).await;
    // 500 MB rounds up to a whole-gigabyte volume.
    let backup = seed_available_backup(&harness, &source, 500).await;

    let handle = harness
        .orchestrator
        .restore(backup.id, None)
        .await
        .expect("restore");

    let created = harness
        .store
        .volume(handle.volume_id)
        .await
        .expect("read created volume");
    assert_eq!(created.size_gb, 1);
    assert_eq!(created.status, VolumeStatus::RestoringBackup);
    let _ = harness.mailbox.recv().await.expect("dispatched");
}

#[rstest]
#[tokio::test]
async fn restore_refuses_a_backup_of_unknown_size() {
    let harness = harness().await;
    let source = seed_volume(&harness, VolumeStatus::Available).await;
    let backup = seed_available_backup(&harness, &source, 0).await;

    let err = harness
        .orchestrator
        .restore(backup.id, None)
        .await
        .expect_err("size unknown");
    assert!(matches!(err, OrchestratorError::InvalidBackup { .. }));
}

#[rstest]
#[tokio::test]
async fn delete_refuses_a_backup_with_incremental_children() {
    let harness = harness().await;
    let volume = seed_volume(&harness, VolumeStatus::Available).await;
    let parent = seed_available_backup(&harness, &volume, 1024).await;
    let mut child = Backup::new(&volume, "host-1");
    child.status = BackupStatus::Available;
    child.parent_id = Some(parent.id);
    harness
        .store
        .insert_backup(child)
        .await
        .expect("seed child");

    let err = harness
        .orchestrator
        .delete(parent.id)
        .await
        .expect_err("children first");
    assert!(matches!(err, OrchestratorError::InvalidBackup { .. }));
    let stored = harness.store.backup(parent.id).await.expect("read backup");
    assert_eq!(stored.status, BackupStatus::Available);
}

#[rstest]
#[tokio::test]
async fn second_delete_fails_the_status_gate() {
    let mut harness = harness().await;
    let volume = seed_volume(&harness, VolumeStatus::Available).await;
    let backup = seed_available_backup(&harness, &volume, 1024).await;

    harness.orchestrator.delete(backup.id).await.expect("first");
    let stored = harness.store.backup(backup.id).await.expect("read backup");
    assert_eq!(stored.status, BackupStatus::Deleting);

    let err = harness
        .orchestrator
        .delete(backup.id)
        .await
        .expect_err("already deleting");
    assert!(matches!(err, OrchestratorError::InvalidBackup { .. }));
    // Exactly one dispatch went out.
    let _ = harness.mailbox.recv().await.expect("dispatched");
    assert!(harness.mailbox.try_recv().is_err());
}

#[rstest]
#[tokio::test]
async fn export_requires_an_available_backup() {
    let harness = harness().await;
    let volume = seed_volume(&harness, VolumeStatus::Available).await;
    let backup = Backup::new(&volume, "host-1");
    harness
        .store
        .insert_backup(backup.clone())
        .await
        .expect("seed backup");

    let err = harness
        .orchestrator
        .export(backup.id)
        .await
        .expect_err("still creating");
    assert!(matches!(err, OrchestratorError::InvalidBackup { .. }));
}

#[rstest]
#[tokio::test]
async fn import_with_no_registered_hosts_is_refused() {
    let store = Arc::new(RecordStore::new());
    let registry = Arc::new(ServiceRegistry::new());
    let bus = Arc::new(InProcessBus::new());
    let volume_driver = Arc::new(FakeVolumeDriver::new(store.clone(), "host-1", "zone-a"));
    let orchestrator = BackupOrchestrator::new(
        store,
        Arc::new(QuotaLedger::unlimited()),
        registry,
        bus,
        volume_driver,
        Arc::new(FakeComputeAgent::new()),
        Duration::from_millis(10),
    );

    let err = orchestrator
        .import(
            "proj",
            crate::model::ExportedRecord {
                service: "fake".to_owned(),
                record: String::new(),
            },
        )
        .await
        .expect_err("no hosts");
    assert_eq!(
        err,
        OrchestratorError::NoServiceFound {
            service: "fake".to_owned()
        }
    );
}

//! Scripted fakes shared across unit and integration tests.
//!
//! Each fake queues pre-seeded outcomes in FIFO order and records every
//! invocation so tests can assert on exactly what was driven, without a
//! real backend, volume service or hypervisor in the loop.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::driver::{
    BackupArtifact, BackupDriver, ComputeAgent, ComputeError, DriverError, DriverFuture,
    VolumeDriver, VolumeSpec,
};
use crate::model::{Backup, ImportedRecord, PowerState, Volume, VolumeStatus};
use crate::store::RecordStore;

/// Outcome to script for one driver operation.
#[derive(Clone, Debug)]
pub enum DriverOutcome {
    /// The operation completes successfully.
    Succeed,
    /// The operation fails with the given backend message.
    Fail(String),
    /// The operation never completes.
    Hang,
    /// The operation completes successfully once the gate is released
    /// via [`tokio::sync::Notify::notify_one`].
    Block(Arc<tokio::sync::Notify>),
}

/// Records a single call made into [`FakeBackupDriver`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DriverCall {
    /// `backup` was invoked for the backup id.
    Backup(Uuid),
    /// `restore` was invoked for the backup and volume ids.
    Restore(Uuid, Uuid),
    /// `delete` was invoked for the backup id.
    Delete(Uuid),
    /// `export_record` was invoked for the backup id.
    Export(Uuid),
    /// `import_record` was invoked.
    Import,
    /// `verify` was invoked for the backup id.
    Verify(Uuid),
}

#[derive(Debug, Default)]
struct BackupDriverState {
    outcomes: HashMap<&'static str, VecDeque<DriverOutcome>>,
    hang_volumes: Vec<Uuid>,
    calls: Vec<DriverCall>,
}

/// Backup driver that replays scripted outcomes.
///
/// Operations with no queued outcome succeed. Successful `backup` calls
/// report one stored object of `size_gb * 1024` megabytes, mirroring a
/// whole-volume copy.
#[derive(Debug)]
pub struct FakeBackupDriver {
    service: String,
    verify_supported: bool,
    state: Mutex<BackupDriverState>,
}

impl Default for FakeBackupDriver {
    fn default() -> Self {
        Self::new("fake")
    }
}

impl FakeBackupDriver {
    /// Creates a driver reporting the given service name, with `verify`
    /// supported.
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            verify_supported: true,
            state: Mutex::new(BackupDriverState::default()),
        }
    }

    /// Creates a driver whose `verify` capability is absent.
    #[must_use]
    pub fn without_verify(service: impl Into<String>) -> Self {
        Self {
            verify_supported: false,
            ..Self::new(service)
        }
    }

    /// Queues an outcome for the next `backup` call.
    pub fn push_backup_outcome(&self, outcome: DriverOutcome) {
        self.push_outcome("backup", outcome);
    }

    /// Queues an outcome for the next `restore` call.
    pub fn push_restore_outcome(&self, outcome: DriverOutcome) {
        self.push_outcome("restore", outcome);
    }

    /// Queues an outcome for the next `delete` call.
    pub fn push_delete_outcome(&self, outcome: DriverOutcome) {
        self.push_outcome("delete", outcome);
    }

    /// Queues an outcome for the next `verify` call.
    pub fn push_verify_outcome(&self, outcome: DriverOutcome) {
        self.push_outcome("verify", outcome);
    }

    /// Makes every `backup` call for the given volume hang forever,
    /// regardless of queued outcomes.
    pub fn hang_backups_of_volume(&self, volume_id: Uuid) {
        self.lock_state().hang_volumes.push(volume_id);
    }

    /// Returns a snapshot of all calls recorded so far.
    #[must_use]
    pub fn calls(&self) -> Vec<DriverCall> {
        self.lock_state().calls.clone()
    }

    fn push_outcome(&self, operation: &'static str, outcome: DriverOutcome) {
        self.lock_state()
            .outcomes
            .entry(operation)
            .or_default()
            .push_back(outcome);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BackupDriverState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn take(&self, operation: &'static str, call: DriverCall) -> DriverOutcome {
        let mut state = self.lock_state();
        state.calls.push(call);
        state
            .outcomes
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
            .unwrap_or(DriverOutcome::Succeed)
    }
}

async fn run_outcome(outcome: DriverOutcome) -> Result<(), DriverError> {
    match outcome {
        DriverOutcome::Succeed => Ok(()),
        DriverOutcome::Fail(message) => Err(DriverError::backend(message)),
        DriverOutcome::Hang => {
            std::future::pending::<()>().await;
            Ok(())
        }
        DriverOutcome::Block(gate) => {
            gate.notified().await;
            Ok(())
        }
    }
}

impl BackupDriver for FakeBackupDriver {
    fn service_name(&self) -> &str {
        &self.service
    }

    fn backup<'a>(
        &'a self,
        backup: &'a Backup,
        volume: &'a Volume,
    ) -> DriverFuture<'a, BackupArtifact, DriverError> {
        let outcome = if self.lock_state().hang_volumes.contains(&volume.id) {
            self.lock_state().calls.push(DriverCall::Backup(backup.id));
            DriverOutcome::Hang
        } else {
            self.take("backup", DriverCall::Backup(backup.id))
        };
        Box::pin(async move {
            run_outcome(outcome).await?;
            Ok(BackupArtifact {
                size_mb: volume.size_gb * 1024,
                container: Some(
                    backup
                        .container
                        .clone()
                        .unwrap_or_else(|| String::from("fake-container")),
                ),
                object_count: 1,
                service_metadata: Some(format!("fake:{}", backup.id)),
            })
        })
    }

    fn restore<'a>(
        &'a self,
        backup: &'a Backup,
        volume: &'a Volume,
    ) -> DriverFuture<'a, (), DriverError> {
        let outcome = self.take("restore", DriverCall::Restore(backup.id, volume.id));
        Box::pin(run_outcome(outcome))
    }

    fn delete<'a>(&'a self, backup: &'a Backup) -> DriverFuture<'a, (), DriverError> {
        let outcome = self.take("delete", DriverCall::Delete(backup.id));
        Box::pin(run_outcome(outcome))
    }

    fn export_record<'a>(&'a self, backup: &'a Backup) -> DriverFuture<'a, String, DriverError> {
        self.lock_state().calls.push(DriverCall::Export(backup.id));
        let record = ImportedRecord {
            display_name: backup.display_name.clone(),
            description: backup.description.clone(),
            container: backup.container.clone(),
            size_mb: backup.size_mb,
            service_metadata: backup.service_metadata.clone(),
            service: self.service.clone(),
            object_count: backup.object_count,
        };
        Box::pin(async move {
            serde_json::to_string(&record).map_err(|err| DriverError::MalformedRecord {
                message: err.to_string(),
            })
        })
    }

    fn import_record<'a>(
        &'a self,
        record: &'a str,
    ) -> DriverFuture<'a, ImportedRecord, DriverError> {
        self.lock_state().calls.push(DriverCall::Import);
        Box::pin(async move {
            serde_json::from_str(record).map_err(|err| DriverError::MalformedRecord {
                message: err.to_string(),
            })
        })
    }

    fn verify<'a>(&'a self, backup: &'a Backup) -> Option<DriverFuture<'a, (), DriverError>> {
        if !self.verify_supported {
            return None;
        }
        let outcome = self.take("verify", DriverCall::Verify(backup.id));
        Some(Box::pin(run_outcome(outcome)))
    }
}

/// Volume driver writing records straight into a shared [`RecordStore`].
///
/// Created volumes land in the configured status, `available` by default;
/// tests exercising the settle poll seed `creating` and flip the record
/// themselves.
#[derive(Debug)]
pub struct FakeVolumeDriver {
    store: Arc<RecordStore>,
    host: String,
    availability_zone: String,
    created_status: Mutex<VolumeStatus>,
    detached: Mutex<Vec<(Uuid, Uuid)>>,
}

impl FakeVolumeDriver {
    /// Creates a driver placing new volumes on the given host and zone.
    #[must_use]
    pub fn new(
        store: Arc<RecordStore>,
        host: impl Into<String>,
        availability_zone: impl Into<String>,
    ) -> Self {
        Self {
            store,
            host: host.into(),
            availability_zone: availability_zone.into(),
            created_status: Mutex::new(VolumeStatus::Available),
            detached: Mutex::new(Vec::new()),
        }
    }

    /// Sets the status newly created volumes are inserted with.
    pub fn set_created_status(&self, status: VolumeStatus) {
        *self
            .created_status
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = status;
    }

    /// Returns every `(volume_id, attachment_id)` pair detached so far.
    #[must_use]
    pub fn detachments(&self) -> Vec<(Uuid, Uuid)> {
        self.detached
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl VolumeDriver for FakeVolumeDriver {
    fn create_volume<'a>(&'a self, spec: &'a VolumeSpec) -> DriverFuture<'a, Uuid, DriverError> {
        let status = *self
            .created_status
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Box::pin(async move {
            let volume = Volume::new(
                spec.project_id.clone(),
                spec.size_gb,
                status,
                self.host.clone(),
                self.availability_zone.clone(),
            );
            let volume_id = volume.id;
            self.store
                .insert_volume(volume)
                .await
                .map_err(|err| DriverError::backend(err.to_string()))?;
            Ok(volume_id)
        })
    }

    fn detach_volume<'a>(
        &'a self,
        volume_id: Uuid,
        attachment_id: Uuid,
    ) -> DriverFuture<'a, (), DriverError> {
        self.detached
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((volume_id, attachment_id));
        Box::pin(async { Ok(()) })
    }
}

#[derive(Debug, Default)]
struct ComputeState {
    states: HashMap<Uuid, PowerState>,
    freeze_errors: HashMap<Uuid, VecDeque<ComputeError>>,
    thaw_errors: HashMap<Uuid, VecDeque<ComputeError>>,
    freeze_calls: Vec<Uuid>,
    thaw_calls: Vec<Uuid>,
}

/// Compute agent with per-instance power states and scripted failures.
#[derive(Debug, Default)]
pub struct FakeComputeAgent {
    state: Mutex<ComputeState>,
}

impl FakeComputeAgent {
    /// Creates an agent with no known instances.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an instance in the given power state.
    pub fn set_power_state(&self, instance_id: Uuid, state: PowerState) {
        self.lock_state().states.insert(instance_id, state);
    }

    /// Queues an error for the next `flush_and_freeze` on the instance.
    pub fn push_freeze_error(&self, instance_id: Uuid, error: ComputeError) {
        self.lock_state()
            .freeze_errors
            .entry(instance_id)
            .or_default()
            .push_back(error);
    }

    /// Queues an error for the next `thaw` on the instance.
    pub fn push_thaw_error(&self, instance_id: Uuid, error: ComputeError) {
        self.lock_state()
            .thaw_errors
            .entry(instance_id)
            .or_default()
            .push_back(error);
    }

    /// Returns the instances frozen so far, in call order.
    #[must_use]
    pub fn freeze_calls(&self) -> Vec<Uuid> {
        self.lock_state().freeze_calls.clone()
    }

    /// Returns the instances thawed so far, in call order.
    #[must_use]
    pub fn thaw_calls(&self) -> Vec<Uuid> {
        self.lock_state().thaw_calls.clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ComputeState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl ComputeAgent for FakeComputeAgent {
    fn power_state(&self, instance_id: Uuid) -> DriverFuture<'_, PowerState, ComputeError> {
        let state = self.lock_state().states.get(&instance_id).copied();
        Box::pin(async move { state.ok_or(ComputeError::InstanceNotFound { instance_id }) })
    }

    fn flush_and_freeze(&self, instance_id: Uuid) -> DriverFuture<'_, (), ComputeError> {
        let mut state = self.lock_state();
        state.freeze_calls.push(instance_id);
        let scripted = state
            .freeze_errors
            .get_mut(&instance_id)
            .and_then(VecDeque::pop_front);
        drop(state);
        Box::pin(async move {
            match scripted {
                Some(error) => Err(error),
                None => Ok(()),
            }
        })
    }

    fn thaw(&self, instance_id: Uuid) -> DriverFuture<'_, (), ComputeError> {
        let mut state = self.lock_state();
        state.thaw_calls.push(instance_id);
        let scripted = state
            .thaw_errors
            .get_mut(&instance_id)
            .and_then(VecDeque::pop_front);
        drop(state);
        Box::pin(async move {
            match scripted {
                Some(error) => Err(error),
                None => Ok(()),
            }
        })
    }
}

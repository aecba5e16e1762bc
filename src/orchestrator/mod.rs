//! Control-plane entry points for the backup engine.
//!
//! The orchestrator validates every request against the live records,
//! reserves quota, and hands the actual data movement to the owning host's
//! executor over the bus. Create, restore and delete return as soon as the
//! work is dispatched; callers poll record status for completion. Export,
//! import and status resets block on the executor so precondition failures
//! reach the caller.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{BusError, ExecutorRequest, ExecutorResponse, MessageBus, ServiceRegistry};
use crate::chain::{ChainError, ChainResolver};
use crate::driver::{ComputeAgent, VolumeDriver, VolumeSpec};
use crate::executor::ExecutorError;
use crate::model::{
    Backup, BackupStatus, ExportedRecord, RestoreHandle, Volume, VolumeStatus,
};
use crate::quota::{QuotaDelta, QuotaError, QuotaLedger};
use crate::store::{RecordStore, StoreError};

#[cfg(test)]
mod tests;

/// Errors surfaced synchronously to orchestrator callers.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum OrchestratorError {
    /// The source volume is not in a status the operation admits.
    #[error("volume {volume_id} is {status}, expected one of {expected:?}")]
    VolumeNotAvailable {
        /// Volume that failed the gate.
        volume_id: Uuid,
        /// Its status at call time.
        status: VolumeStatus,
        /// Statuses the operation admits.
        expected: Vec<VolumeStatus>,
    },
    /// No enabled backup service covers the volume's zone and host.
    #[error("no backup service enabled for host {host} in zone {availability_zone}")]
    NoBackupService {
        /// Host needing coverage.
        host: String,
        /// Zone needing coverage.
        availability_zone: String,
    },
    /// A volume failed a validation beyond the plain status gate.
    #[error("invalid volume: {reason}")]
    InvalidVolume {
        /// What failed.
        reason: String,
    },
    /// A backup failed a validation.
    #[error("invalid backup: {reason}")]
    InvalidBackup {
        /// What failed.
        reason: String,
    },
    /// No registered host can run the requested driver service.
    #[error("no backup service registered to handle service {service}")]
    NoServiceFound {
        /// Driver service nobody runs.
        service: String,
    },
    /// Provisioning a restore target volume failed.
    #[error("restore target provisioning failed: {reason}")]
    Provisioning {
        /// Backend failure detail.
        reason: String,
    },
    /// Quota was exhausted; no record was created.
    #[error(transparent)]
    Quota(#[from] QuotaError),
    /// Incremental parent resolution failed.
    #[error(transparent)]
    Chain(#[from] ChainError),
    /// The record store failed.
    #[error(transparent)]
    Store(StoreError),
    /// An executor rejected a synchronous request.
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    /// The bus could not reach the owning host.
    #[error("bus dispatch failed: {reason}")]
    Dispatch {
        /// Bus failure detail.
        reason: String,
    },
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<BusError> for OrchestratorError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Executor(inner) => Self::Executor(inner),
            other => Self::Dispatch {
                reason: other.to_string(),
            },
        }
    }
}

/// Parameters of a single-volume create request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreateBackupRequest {
    /// Volume to back up.
    pub volume_id: Uuid,
    /// Caller-supplied display name.
    pub display_name: Option<String>,
    /// Caller-supplied description.
    pub description: Option<String>,
    /// Backend namespace to write into, when the caller cares.
    pub container: Option<String>,
    /// Chain off the latest prior backup instead of copying everything.
    pub incremental: bool,
    /// Taken by a scheduled trigger; never chains and is never chained off.
    pub is_periodic: bool,
}

impl CreateBackupRequest {
    /// A full, on-demand backup of the volume with no extra metadata.
    #[must_use]
    pub fn full(volume_id: Uuid) -> Self {
        Self {
            volume_id,
            display_name: None,
            description: None,
            container: None,
            incremental: false,
            is_periodic: false,
        }
    }
}

/// Front door for backup operations.
pub struct BackupOrchestrator {
    store: Arc<RecordStore>,
    quotas: Arc<QuotaLedger>,
    chain: ChainResolver,
    registry: Arc<ServiceRegistry>,
    bus: Arc<dyn MessageBus>,
    volume_driver: Arc<dyn VolumeDriver>,
    compute: Arc<dyn ComputeAgent>,
    volume_poll_interval: Duration,
}

impl BackupOrchestrator {
    /// Wires an orchestrator over the shared record store and bus.
    #[must_use]
    pub fn new(
        store: Arc<RecordStore>,
        quotas: Arc<QuotaLedger>,
        registry: Arc<ServiceRegistry>,
        bus: Arc<dyn MessageBus>,
        volume_driver: Arc<dyn VolumeDriver>,
        compute: Arc<dyn ComputeAgent>,
        volume_poll_interval: Duration,
    ) -> Self {
        Self {
            chain: ChainResolver::new(store.clone()),
            store,
            quotas,
            registry,
            bus,
            volume_driver,
            compute,
            volume_poll_interval,
        }
    }

    /// Accepts a create request and dispatches it to the owning host.
    ///
    /// Returns the new record in status `creating`; completion is observed
    /// by polling.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::VolumeNotAvailable`] when the volume is
    /// not `available`, [`OrchestratorError::NoBackupService`] when no
    /// enabled service covers it, quota errors with nothing created, and
    /// chain errors when the incremental parent is still being written.
    pub async fn create(
        &self,
        request: CreateBackupRequest,
    ) -> Result<Backup, OrchestratorError> {
        let volume = self.store.volume(request.volume_id).await?;
        if volume.status != VolumeStatus::Available {
            return Err(OrchestratorError::VolumeNotAvailable {
                volume_id: volume.id,
                status: volume.status,
                expected: vec![VolumeStatus::Available],
            });
        }
        self.require_backup_service(&volume).await?;

        let backup = self
            .accept_backup(&volume, &request, &[VolumeStatus::Available])
            .await?;
        self.bus
            .cast(
                &backup.host,
                ExecutorRequest::CreateBackup {
                    backup_id: backup.id,
                },
            )
            .await?;
        info!(backup_id = %backup.id, volume_id = %volume.id, "create backup dispatched");
        Ok(backup)
    }

    /// Checks the live registry for an enabled service covering the volume.
    pub(crate) async fn require_backup_service(
        &self,
        volume: &Volume,
    ) -> Result<(), OrchestratorError> {
        if self
            .registry
            .is_backup_service_enabled(&volume.availability_zone, &volume.host)
            .await
        {
            Ok(())
        } else {
            Err(OrchestratorError::NoBackupService {
                host: volume.host.clone(),
                availability_zone: volume.availability_zone.clone(),
            })
        }
    }

    /// Reserves quota, resolves the chain parent, moves the volume into
    /// `backing-up` (stashing its current status) and inserts the
    /// `creating` record. The quota commit is tied to the insertion, not to
    /// eventual completion.
    ///
    /// Shared with the instance-group coordinator, which admits `in-use`
    /// volumes.
    ///
    /// # Errors
    ///
    /// Any failure after the reservation rolls it back and unwinds the
    /// partial state before propagating.
    pub(crate) async fn accept_backup(
        &self,
        volume: &Volume,
        request: &CreateBackupRequest,
        admissible: &[VolumeStatus],
    ) -> Result<Backup, OrchestratorError> {
        let reservation = self
            .quotas
            .reserve(&volume.project_id, QuotaDelta::for_new_backup(volume.size_gb))
            .await?;

        let parent_id = match self
            .chain
            .resolve_parent(volume.id, request.incremental, request.is_periodic)
            .await
        {
            Ok(parent_id) => parent_id,
            Err(err) => {
                self.rollback_reservation(reservation).await;
                return Err(err.into());
            }
        };

        let stashed = self
            .store
            .stash_and_transition_volume(volume.id, admissible, VolumeStatus::BackingUp)
            .await;
        if let Err(err) = stashed {
            self.rollback_reservation(reservation).await;
            return Err(match err {
                StoreError::VolumeStatusConflict { volume_id, expected, actual } => {
                    OrchestratorError::VolumeNotAvailable {
                        volume_id,
                        status: actual,
                        expected,
                    }
                }
                other => other.into(),
            });
        }

        let mut backup = Backup::new(volume, volume.host.clone());
        backup.display_name = request.display_name.clone();
        backup.description = request.description.clone();
        backup.container = request.container.clone();
        backup.parent_id = parent_id;
        backup.is_periodic = request.is_periodic;

        if let Err(err) = self.store.insert_backup(backup.clone()).await {
            self.revert_acceptance(volume.id).await;
            self.rollback_reservation(reservation).await;
            return Err(err.into());
        }
        self.quotas.commit(reservation).await?;
        debug!(backup_id = %backup.id, parent_id = ?parent_id, "backup accepted");
        Ok(backup)
    }

    async fn rollback_reservation(&self, reservation: crate::quota::ReservationId) {
        if let Err(err) = self.quotas.rollback(reservation).await {
            warn!(error = %err, "failed to roll back quota reservation");
        }
    }

    async fn revert_acceptance(&self, volume_id: Uuid) {
        let reverted = self
            .store
            .update_volume(volume_id, |volume| {
                volume.status = volume.previous_status.take().unwrap_or(VolumeStatus::Available);
            })
            .await;
        if let Err(err) = reverted {
            warn!(%volume_id, error = %err, "failed to revert volume after rejected backup");
        }
    }

    /// Starts restoring a backup onto a volume, provisioning one when the
    /// caller supplies none.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidBackup`] when the backup is not
    /// `available` or its size is unknown, and
    /// [`OrchestratorError::InvalidVolume`] when the target is in the wrong
    /// status, attached to a powered-on instance, or too small.
    pub async fn restore(
        &self,
        backup_id: Uuid,
        volume_id: Option<Uuid>,
    ) -> Result<RestoreHandle, OrchestratorError> {
        let backup = self.store.backup(backup_id).await?;
        if backup.status != BackupStatus::Available {
            return Err(OrchestratorError::InvalidBackup {
                reason: format!(
                    "restore requires backup status available but got {}",
                    backup.status
                ),
            });
        }
        if backup.size_mb == 0 {
            return Err(OrchestratorError::InvalidBackup {
                reason: "backup size is unknown; wait for the create to finish".to_owned(),
            });
        }

        let volume_id = match volume_id {
            Some(volume_id) => volume_id,
            None => self.provision_restore_target(&backup).await?,
        };
        let volume = self.store.volume(volume_id).await?;

        match volume.status {
            VolumeStatus::Available => {}
            VolumeStatus::InUse => self.require_attachments_powered_off(&volume).await?,
            status => {
                return Err(OrchestratorError::VolumeNotAvailable {
                    volume_id,
                    status,
                    expected: vec![VolumeStatus::Available, VolumeStatus::InUse],
                });
            }
        }
        if backup.size_mb > volume.size_gb * 1024 {
            return Err(OrchestratorError::InvalidVolume {
                reason: format!(
                    "volume size {} GB is too small to hold a {} MB backup",
                    volume.size_gb, backup.size_mb
                ),
            });
        }

        self.store
            .stash_and_transition_volume(
                volume_id,
                &[VolumeStatus::Available, VolumeStatus::InUse],
                VolumeStatus::RestoringBackup,
            )
            .await?;
        if let Err(err) = self
            .store
            .transition_backup(backup_id, &[BackupStatus::Available], BackupStatus::Restoring)
            .await
        {
            self.revert_acceptance(volume_id).await;
            return Err(match err {
                StoreError::BackupStatusConflict { actual, .. } => {
                    OrchestratorError::InvalidBackup {
                        reason: format!(
                            "restore requires backup status available but got {actual}"
                        ),
                    }
                }
                other => other.into(),
            });
        }

        self.bus
            .cast(
                &volume.host,
                ExecutorRequest::RestoreBackup {
                    backup_id,
                    volume_id,
                },
            )
            .await?;
        info!(%backup_id, %volume_id, "restore dispatched");
        Ok(RestoreHandle {
            backup_id,
            volume_id,
        })
    }

    /// Creates a target volume sized up to the next whole gigabyte and
    /// waits for it to leave `creating`.
    async fn provision_restore_target(&self, backup: &Backup) -> Result<Uuid, OrchestratorError> {
        let size_gb = backup.size_mb.div_ceil(1024).max(1);
        let spec = VolumeSpec {
            name: format!("restore_backup_{}", backup.id),
            description: "auto-created_from_restore_from_backup".to_owned(),
            size_gb,
            project_id: backup.project_id.clone(),
        };
        let volume_id = self
            .volume_driver
            .create_volume(&spec)
            .await
            .map_err(|err| OrchestratorError::Provisioning {
                reason: err.to_string(),
            })?;

        loop {
            let volume = self.store.volume(volume_id).await?;
            match volume.status {
                VolumeStatus::Creating => {
                    let notified = self.store.changed();
                    tokio::select! {
                        () = notified => {}
                        () = time::sleep(self.volume_poll_interval) => {}
                    }
                }
                VolumeStatus::Available => return Ok(volume_id),
                status => {
                    return Err(OrchestratorError::Provisioning {
                        reason: format!("restore target volume settled in status {status}"),
                    });
                }
            }
        }
    }

    /// Rejects an in-use target when any attached instance is running.
    async fn require_attachments_powered_off(
        &self,
        volume: &Volume,
    ) -> Result<(), OrchestratorError> {
        for attachment in &volume.attachments {
            let Some(instance_id) = attachment.instance_id else {
                continue;
            };
            let state = self.compute.power_state(instance_id).await.map_err(|err| {
                OrchestratorError::InvalidVolume {
                    reason: format!("cannot read power state of instance {instance_id}: {err}"),
                }
            })?;
            if !state.is_powered_off() {
                return Err(OrchestratorError::InvalidVolume {
                    reason: format!(
                        "volume {} is attached to instance {instance_id} which is {state}, \
                         power it off before restoring",
                        volume.id
                    ),
                });
            }
        }
        Ok(())
    }

    /// Marks a backup `deleting` and dispatches the deletion.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidBackup`] when the backup is not
    /// `available` or `error`, or when incremental children still reference
    /// it.
    pub async fn delete(&self, backup_id: Uuid) -> Result<(), OrchestratorError> {
        let backup = self.store.backup(backup_id).await?;
        if !matches!(backup.status, BackupStatus::Available | BackupStatus::Error) {
            return Err(OrchestratorError::InvalidBackup {
                reason: format!(
                    "delete requires backup status available or error but got {}",
                    backup.status
                ),
            });
        }
        let children = self.store.children_of(backup_id).await;
        if !children.is_empty() {
            return Err(OrchestratorError::InvalidBackup {
                reason: format!(
                    "backup {backup_id} has {} incremental dependents, delete them first",
                    children.len()
                ),
            });
        }
        if backup.is_active_restore_target {
            warn!(%backup_id, "deleting the volume's most recently restored backup");
        }

        let transitioned = self
            .store
            .transition_backup(
                backup_id,
                &[BackupStatus::Available, BackupStatus::Error],
                BackupStatus::Deleting,
            )
            .await;
        if let Err(err) = transitioned {
            return Err(match err {
                StoreError::BackupStatusConflict { actual, .. } => {
                    OrchestratorError::InvalidBackup {
                        reason: format!(
                            "delete requires backup status available or error but got {actual}"
                        ),
                    }
                }
                other => other.into(),
            });
        }
        self.bus
            .cast(&backup.host, ExecutorRequest::DeleteBackup { backup_id })
            .await?;
        info!(%backup_id, "delete dispatched");
        Ok(())
    }

    /// Exports a backup's record from its owning host.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidBackup`] when the backup is not
    /// `available`, or the executor's own rejection.
    pub async fn export(&self, backup_id: Uuid) -> Result<ExportedRecord, OrchestratorError> {
        let backup = self.store.backup(backup_id).await?;
        if backup.status != BackupStatus::Available {
            return Err(OrchestratorError::InvalidBackup {
                reason: format!(
                    "export requires backup status available but got {}",
                    backup.status
                ),
            });
        }
        let response = self
            .bus
            .call(&backup.host, ExecutorRequest::ExportRecord { backup_id })
            .await?;
        match response {
            ExecutorResponse::Exported(record) => Ok(record),
            other => Err(OrchestratorError::Dispatch {
                reason: format!("unexpected response to an export: {other:?}"),
            }),
        }
    }

    /// Imports an exported record, trying every registered host until one
    /// runs the record's driver service.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::NoServiceFound`] when no host is
    /// registered at all, or the executor-side outcome (possibly after
    /// failover) otherwise.
    pub async fn import(
        &self,
        project_id: &str,
        exported: ExportedRecord,
    ) -> Result<Backup, OrchestratorError> {
        let mut hosts = self.registry.enabled_hosts().await;
        let Some(first_host) = hosts.pop() else {
            return Err(OrchestratorError::NoServiceFound {
                service: exported.service,
            });
        };

        let placeholder = Backup::import_placeholder(project_id);
        self.store.insert_backup(placeholder.clone()).await?;
        info!(backup_id = %placeholder.id, service = exported.service, "import dispatched");

        let response = self
            .bus
            .call(
                &first_host,
                ExecutorRequest::ImportRecord {
                    backup_id: placeholder.id,
                    service: exported.service,
                    record: exported.record,
                    remaining_hosts: hosts,
                },
            )
            .await?;
        match response {
            ExecutorResponse::Imported(backup) => Ok(*backup),
            other => Err(OrchestratorError::Dispatch {
                reason: format!("unexpected response to an import: {other:?}"),
            }),
        }
    }

    /// Forwards an administrative status reset to the owning host.
    ///
    /// # Errors
    ///
    /// Propagates the executor's verification or precondition failure.
    pub async fn reset_status(
        &self,
        backup_id: Uuid,
        status: BackupStatus,
    ) -> Result<(), OrchestratorError> {
        let backup = self.store.backup(backup_id).await?;
        self.bus
            .call(&backup.host, ExecutorRequest::ResetStatus { backup_id, status })
            .await?;
        Ok(())
    }
}

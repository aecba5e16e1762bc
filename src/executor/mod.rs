//! Per-host backup executor.
//!
//! One executor runs co-located with the volume and backup drivers for its
//! host. It re-validates record status on every request (the bus is
//! at-least-once, so duplicates arrive), performs the driver work, and
//! always writes records back to a safe terminal state before reporting a
//! failure — a backend exception is never considered handled until the
//! statuses say what happened.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::{ExecutorRequest, ExecutorResponse, MessageBus};
use crate::driver::{BackupDriver, VolumeDriver};
use crate::model::{Backup, BackupStatus, ExportedRecord, Volume, VolumeStatus};
use crate::quota::{QuotaDelta, QuotaLedger};
use crate::store::{RecordStore, StoreError};

mod recovery;

/// Errors raised by executor operations.
///
/// Kept string-valued so they can cross any bus substrate unchanged.
#[derive(Clone, Debug, Deserialize, Error, Eq, PartialEq, Serialize)]
pub enum ExecutorError {
    /// A volume failed a status precondition.
    #[error("invalid volume: {reason}")]
    InvalidVolume {
        /// What was expected and what was found.
        reason: String,
    },
    /// A backup failed a status or service precondition.
    #[error("invalid backup: {reason}")]
    InvalidBackup {
        /// What was expected and what was found.
        reason: String,
    },
    /// The backup driver failed; the record's `fail_reason` carries this
    /// message too.
    #[error("backup driver failed: {reason}")]
    Driver {
        /// Driver failure detail.
        reason: String,
    },
    /// The record store failed.
    #[error("record store failure: {reason}")]
    Store {
        /// Store failure detail.
        reason: String,
    },
    /// The configured driver does not implement `verify`.
    #[error("backup service {service} does not support verify")]
    VerifyUnsupported {
        /// The driver service lacking the capability.
        service: String,
    },
    /// No host in the failover list runs the required driver service.
    #[error("cannot find a backup service to handle service {service}")]
    NoServiceFound {
        /// The driver service nobody runs.
        service: String,
    },
    /// Forwarding an import to a failover host failed at the bus level.
    #[error("failed to forward to a failover host: {reason}")]
    Forwarding {
        /// Bus failure detail.
        reason: String,
    },
}

impl From<StoreError> for ExecutorError {
    fn from(err: StoreError) -> Self {
        Self::Store {
            reason: err.to_string(),
        }
    }
}

/// Static configuration of one executor host.
///
/// Passed explicitly at construction; the executor keeps no process-global
/// driver lookup state.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecutorConfig {
    /// Host name this executor serves; records are owned by host name.
    pub host: String,
    /// Availability zone stamped onto backups written here.
    pub availability_zone: String,
}

/// Executes backup workflows against the drivers of one host.
pub struct BackupExecutor {
    config: ExecutorConfig,
    store: Arc<RecordStore>,
    quotas: Arc<QuotaLedger>,
    volume_driver: Arc<dyn VolumeDriver>,
    backup_driver: Arc<dyn BackupDriver>,
    bus: Arc<dyn MessageBus>,
}

impl BackupExecutor {
    /// Creates an executor for the given host.
    #[must_use]
    pub fn new(
        config: ExecutorConfig,
        store: Arc<RecordStore>,
        quotas: Arc<QuotaLedger>,
        volume_driver: Arc<dyn VolumeDriver>,
        backup_driver: Arc<dyn BackupDriver>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            config,
            store,
            quotas,
            volume_driver,
            backup_driver,
            bus,
        }
    }

    /// The host this executor serves.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.config.host
    }

    /// The availability zone this executor stamps onto backups.
    #[must_use]
    pub fn availability_zone(&self) -> &str {
        &self.config.availability_zone
    }

    /// The driver service configured on this host.
    #[must_use]
    pub fn driver_service(&self) -> &str {
        self.backup_driver.service_name()
    }

    /// Puts a volume back into its stashed pre-operation status, falling
    /// back to `available` when nothing was stashed.
    async fn settle_volume(&self, volume_id: Uuid) -> Result<Volume, ExecutorError> {
        let updated = self
            .store
            .update_volume(volume_id, |volume| {
                volume.status = volume.previous_status.take().unwrap_or(VolumeStatus::Available);
            })
            .await?;
        Ok(updated)
    }

    async fn mark_backup_error(
        &self,
        backup_id: Uuid,
        reason: &str,
    ) -> Result<Backup, ExecutorError> {
        let updated = self
            .store
            .update_backup(backup_id, |backup| {
                backup.status = BackupStatus::Error;
                backup.fail_reason = Some(reason.to_owned());
            })
            .await?;
        Ok(updated)
    }

    /// Runs the create workflow for an accepted backup.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::InvalidVolume`] when the volume left
    /// `backing-up`, or [`ExecutorError::Driver`] when the driver failed;
    /// in both cases the records have already been moved to their safe
    /// terminal states.
    pub async fn create_backup(&self, backup_id: Uuid) -> Result<(), ExecutorError> {
        let requested = self.store.backup(backup_id).await?;
        let volume = self.store.volume(requested.volume_id).await?;
        info!(%backup_id, volume_id = %volume.id, "create backup started");

        // At-least-once delivery: a redelivered create for a backup that is
        // no longer `creating` must not disturb the finished record. The
        // check and the host stamp are one store mutation so two deliveries
        // cannot both pass the gate.
        let backup = match self
            .store
            .transition_backup_with(
                backup_id,
                &[BackupStatus::Creating],
                BackupStatus::Creating,
                |record| {
                    record.host = self.config.host.clone();
                    record.service = Some(self.backup_driver.service_name().to_owned());
                },
            )
            .await
        {
            Ok(backup) => backup,
            Err(StoreError::BackupStatusConflict { actual, .. }) => {
                warn!(
                    %backup_id,
                    status = %actual,
                    "ignoring duplicate create request for a non-creating backup"
                );
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        if volume.status != VolumeStatus::BackingUp {
            let reason = format!(
                "create backup aborted, expected volume status backing-up but got {}",
                volume.status
            );
            self.settle_volume(volume.id).await?;
            self.mark_backup_error(backup_id, &reason).await?;
            return Err(ExecutorError::InvalidVolume { reason });
        }

        match self.backup_driver.backup(&backup, &volume).await {
            Ok(artifact) => {
                self.settle_volume(volume.id).await?;
                // Only a backup still `creating` may be completed: a group
                // coordinator that already forced `error` on this record
                // keeps its verdict and the late result is dropped.
                match self
                    .store
                    .transition_backup_with(
                        backup_id,
                        &[BackupStatus::Creating],
                        BackupStatus::Available,
                        |record| {
                            record.size_mb = artifact.size_mb;
                            record.object_count = artifact.object_count;
                            record.availability_zone = Some(self.config.availability_zone.clone());
                            if artifact.container.is_some() {
                                record.container = artifact.container;
                            }
                            if artifact.service_metadata.is_some() {
                                record.service_metadata = artifact.service_metadata;
                            }
                        },
                    )
                    .await
                {
                    Ok(_) => info!(%backup_id, "create backup finished"),
                    Err(StoreError::BackupStatusConflict { actual, .. }) => {
                        warn!(
                            %backup_id,
                            status = %actual,
                            "create backup finished late, keeping the record's verdict"
                        );
                    }
                    Err(err) => return Err(err.into()),
                }
                Ok(())
            }
            Err(err) => {
                let reason = err.to_string();
                warn!(%backup_id, %reason, "create backup failed");
                self.settle_volume(volume.id).await?;
                self.mark_backup_error(backup_id, &reason).await?;
                Err(ExecutorError::Driver { reason })
            }
        }
    }

    /// Runs the restore workflow.
    ///
    /// # Errors
    ///
    /// Returns a precondition error when volume, backup or recorded driver
    /// service do not match, or [`ExecutorError::Driver`] on backend
    /// failure. The backup itself is never corrupted by a failed restore:
    /// it reverts to `available` while the volume is marked
    /// `error_restoring`.
    pub async fn restore_backup(
        &self,
        backup_id: Uuid,
        volume_id: Uuid,
    ) -> Result<(), ExecutorError> {
        let backup = self.store.backup(backup_id).await?;
        let volume = self.store.volume(volume_id).await?;
        info!(%backup_id, %volume_id, "restore backup started");

        let backup = self
            .store
            .update_backup(backup_id, |record| {
                record.host = self.config.host.clone();
            })
            .await?;

        if volume.status != VolumeStatus::RestoringBackup {
            let reason = format!(
                "restore backup aborted, expected volume status restoring-backup but got {}",
                volume.status
            );
            self.store
                .update_backup(backup_id, |record| {
                    record.status = BackupStatus::Available;
                })
                .await?;
            self.store
                .update_volume(volume_id, |record| {
                    record.status = VolumeStatus::Error;
                    record.previous_status = None;
                })
                .await?;
            return Err(ExecutorError::InvalidVolume { reason });
        }

        if backup.status != BackupStatus::Restoring {
            let reason = format!(
                "restore backup aborted, expected backup status restoring but got {}",
                backup.status
            );
            self.mark_backup_error(backup_id, &reason).await?;
            self.store
                .update_volume(volume_id, |record| {
                    record.status = VolumeStatus::ErrorRestoring;
                    record.previous_status = None;
                })
                .await?;
            return Err(ExecutorError::InvalidBackup { reason });
        }

        let recorded_service = backup.service.clone().unwrap_or_default();
        if recorded_service != self.backup_driver.service_name() {
            let reason = format!(
                "restore backup aborted, the configured backup service [{}] is not the service \
                 that created this backup [{recorded_service}]",
                self.backup_driver.service_name()
            );
            self.store
                .update_backup(backup_id, |record| {
                    record.status = BackupStatus::Available;
                })
                .await?;
            self.store
                .update_volume(volume_id, |record| {
                    record.status = VolumeStatus::ErrorRestoring;
                    record.previous_status = None;
                })
                .await?;
            return Err(ExecutorError::InvalidBackup { reason });
        }

        match self.backup_driver.restore(&backup, &volume).await {
            Ok(()) => {
                self.settle_volume(volume_id).await?;
                match self
                    .store
                    .transition_backup(backup_id, &[BackupStatus::Restoring], BackupStatus::Available)
                    .await
                {
                    Ok(_) => {
                        self.move_active_marker(volume_id, backup_id).await?;
                        info!(%backup_id, %volume_id, "restore backup finished");
                    }
                    Err(StoreError::BackupStatusConflict { actual, .. }) => {
                        warn!(
                            %backup_id,
                            %volume_id,
                            status = %actual,
                            "restore backup finished late, keeping the record's verdict"
                        );
                    }
                    Err(err) => return Err(err.into()),
                }
                Ok(())
            }
            Err(err) => {
                let reason = err.to_string();
                warn!(%backup_id, %volume_id, %reason, "restore backup failed");
                self.store
                    .update_volume(volume_id, |record| {
                        record.status = VolumeStatus::ErrorRestoring;
                        record.previous_status = None;
                    })
                    .await?;
                self.store
                    .update_backup(backup_id, |record| {
                        record.status = BackupStatus::Available;
                    })
                    .await?;
                Err(ExecutorError::Driver { reason })
            }
        }
    }

    /// Marks `backup_id` as the volume's active restore target, clearing
    /// the flag from every other backup of the volume.
    async fn move_active_marker(
        &self,
        volume_id: Uuid,
        backup_id: Uuid,
    ) -> Result<(), ExecutorError> {
        for other in self.store.backups_by_volume(volume_id).await {
            if other.is_active_restore_target && other.id != backup_id {
                self.store
                    .update_backup(other.id, |record| {
                        record.is_active_restore_target = false;
                    })
                    .await?;
            }
        }
        self.store
            .update_backup(backup_id, |record| {
                record.is_active_restore_target = true;
            })
            .await?;
        Ok(())
    }

    /// Runs the delete workflow and destroys the record.
    ///
    /// Quota correction is best-effort: a failure to size or reserve the
    /// negative delta is logged and the deletion proceeds.
    ///
    /// # Errors
    ///
    /// Returns a precondition error when the backup is not `deleting` or
    /// was written by a different driver service, or
    /// [`ExecutorError::Driver`] when the driver fails the delete.
    pub async fn delete_backup(&self, backup_id: Uuid) -> Result<(), ExecutorError> {
        let backup = self.store.backup(backup_id).await?;
        info!(%backup_id, "delete backup started");

        if backup.status != BackupStatus::Deleting {
            let reason = format!(
                "delete backup aborted, expected backup status deleting but got {}",
                backup.status
            );
            self.mark_backup_error(backup_id, &reason).await?;
            return Err(ExecutorError::InvalidBackup { reason });
        }

        if let Some(recorded_service) = backup.service.as_deref() {
            if recorded_service != self.backup_driver.service_name() {
                let reason = format!(
                    "delete backup aborted, the configured backup service [{}] is not the service \
                     that created this backup [{recorded_service}]",
                    self.backup_driver.service_name()
                );
                self.mark_backup_error(backup_id, &reason).await?;
                return Err(ExecutorError::InvalidBackup { reason });
            }
            if let Err(err) = self.backup_driver.delete(&backup).await {
                let reason = err.to_string();
                self.mark_backup_error(backup_id, &reason).await?;
                return Err(ExecutorError::Driver { reason });
            }
        }

        // Size the quota release by the volume, not the backup: a backup
        // that never finished has size 0 but still holds a reservation.
        let reservation = match self.store.volume(backup.volume_id).await {
            Ok(volume) => {
                let delta = QuotaDelta::for_deleted_backup(volume.size_gb);
                match self.quotas.reserve(&backup.project_id, delta).await {
                    Ok(reservation) => Some(reservation),
                    Err(err) => {
                        warn!(%backup_id, error = %err, "failed to reserve quota release");
                        None
                    }
                }
            }
            Err(err) => {
                warn!(%backup_id, error = %err, "failed to size quota release");
                None
            }
        };

        if let Err(err) = self.store.destroy_backup(backup_id).await {
            // A racing duplicate delete may have destroyed the record
            // first; the release must not stay open against usage.
            if let Some(reservation) = reservation
                && let Err(rollback_err) = self.quotas.rollback(reservation).await
            {
                warn!(%backup_id, error = %rollback_err, "failed to roll back quota release");
            }
            return Err(err.into());
        }
        if let Some(reservation) = reservation
            && let Err(err) = self.quotas.commit(reservation).await
        {
            warn!(%backup_id, error = %err, "failed to commit quota release");
        }
        info!(%backup_id, "delete backup finished");
        Ok(())
    }

    /// Exports a backup's record through the driver.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::InvalidBackup`] when the backup is not
    /// `available`, was written by a different driver service, or the
    /// driver fails to encode it.
    pub async fn export_record(&self, backup_id: Uuid) -> Result<ExportedRecord, ExecutorError> {
        let backup = self.store.backup(backup_id).await?;
        info!(%backup_id, "export record started");

        if backup.status != BackupStatus::Available {
            return Err(ExecutorError::InvalidBackup {
                reason: format!(
                    "export record aborted, expected backup status available but got {}",
                    backup.status
                ),
            });
        }
        let recorded_service = backup.service.clone().unwrap_or_default();
        if recorded_service != self.backup_driver.service_name() {
            return Err(ExecutorError::InvalidBackup {
                reason: format!(
                    "export record aborted, the configured backup service [{}] is not the service \
                     that created this backup [{recorded_service}]",
                    self.backup_driver.service_name()
                ),
            });
        }

        let record = self
            .backup_driver
            .export_record(&backup)
            .await
            .map_err(|err| ExecutorError::InvalidBackup {
                reason: err.to_string(),
            })?;
        info!(%backup_id, "export record finished");
        Ok(ExportedRecord {
            service: recorded_service,
            record,
        })
    }

    /// Imports an exported record into the placeholder, forwarding along
    /// the failover host list when this host runs a different driver
    /// service.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::NoServiceFound`] when the failover list is
    /// exhausted (the placeholder is marked `error` with the reason), or
    /// [`ExecutorError::InvalidBackup`] when decoding or verification
    /// fails.
    pub async fn import_record(
        &self,
        backup_id: Uuid,
        service: String,
        record: String,
        remaining_hosts: Vec<String>,
    ) -> Result<Backup, ExecutorError> {
        if service != self.backup_driver.service_name() {
            return self
                .forward_import(backup_id, service, record, remaining_hosts)
                .await;
        }

        let fields = match self.backup_driver.import_record(&record).await {
            Ok(fields) => fields,
            Err(err) => {
                let reason = err.to_string();
                self.mark_backup_error(backup_id, &reason).await?;
                return Err(ExecutorError::InvalidBackup { reason });
            }
        };

        let imported = self
            .store
            .update_backup(backup_id, |target| {
                target.status = BackupStatus::Available;
                target.service = Some(self.backup_driver.service_name().to_owned());
                target.availability_zone = Some(self.config.availability_zone.clone());
                target.host = self.config.host.clone();
                target.display_name = fields.display_name.clone();
                target.description = fields.description.clone();
                target.container = fields.container.clone();
                target.size_mb = fields.size_mb;
                target.service_metadata = fields.service_metadata.clone();
                target.object_count = fields.object_count;
            })
            .await?;

        if let Some(verify) = self.backup_driver.verify(&imported) {
            if let Err(err) = verify.await {
                let reason = err.to_string();
                self.mark_backup_error(backup_id, &reason).await?;
                return Err(ExecutorError::InvalidBackup { reason });
            }
        } else {
            warn!(
                %backup_id,
                service = self.backup_driver.service_name(),
                "driver does not support verify, skipping verification of imported backup"
            );
        }

        info!(%backup_id, "import record finished");
        Ok(imported)
    }

    async fn forward_import(
        &self,
        backup_id: Uuid,
        service: String,
        record: String,
        mut remaining_hosts: Vec<String>,
    ) -> Result<Backup, ExecutorError> {
        let Some(next_host) = remaining_hosts.pop() else {
            let reason = format!(
                "import record failed, cannot find a backup service to perform the import; \
                 requested service {service}"
            );
            self.mark_backup_error(backup_id, &reason).await?;
            return Err(ExecutorError::NoServiceFound { service });
        };

        info!(%backup_id, %next_host, "forwarding import to the next failover host");
        let response = self
            .bus
            .call(
                &next_host,
                ExecutorRequest::ImportRecord {
                    backup_id,
                    service,
                    record,
                    remaining_hosts,
                },
            )
            .await
            .map_err(|err| match err {
                crate::bus::BusError::Executor(inner) => inner,
                other => ExecutorError::Forwarding {
                    reason: other.to_string(),
                },
            })?;
        match response {
            ExecutorResponse::Imported(backup) => Ok(*backup),
            other => Err(ExecutorError::Forwarding {
                reason: format!("unexpected response to a forwarded import: {other:?}"),
            }),
        }
    }

    /// Administratively resets a backup's status.
    ///
    /// Resetting to `available` from anywhere but `restoring` requires the
    /// driver to prove the backup intact via `verify`; resets to `error`,
    /// or aborting a restore back to `available`, are applied directly.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::VerifyUnsupported`] when verification is
    /// needed but the driver lacks it, or [`ExecutorError::InvalidBackup`]
    /// for service mismatches, failed verification and unsupported targets.
    pub async fn reset_status(
        &self,
        backup_id: Uuid,
        status: BackupStatus,
    ) -> Result<(), ExecutorError> {
        let backup = self.store.backup(backup_id).await?;
        info!(%backup_id, target = %status, "reset backup status started");

        if let Some(recorded_service) = backup.service.as_deref()
            && recorded_service != self.backup_driver.service_name()
        {
            return Err(ExecutorError::InvalidBackup {
                reason: format!(
                    "reset status aborted, the configured backup service [{}] is not the service \
                     that created this backup [{recorded_service}]",
                    self.backup_driver.service_name()
                ),
            });
        }

        match status {
            BackupStatus::Available if backup.status != BackupStatus::Restoring => {
                let Some(verify) = self.backup_driver.verify(&backup) else {
                    return Err(ExecutorError::VerifyUnsupported {
                        service: self.backup_driver.service_name().to_owned(),
                    });
                };
                verify.await.map_err(|err| ExecutorError::InvalidBackup {
                    reason: err.to_string(),
                })?;
                self.store
                    .update_backup(backup_id, |record| {
                        record.status = BackupStatus::Available;
                        record.fail_reason = None;
                    })
                    .await?;
                Ok(())
            }
            BackupStatus::Available | BackupStatus::Error => {
                self.store
                    .update_backup(backup_id, |record| {
                        record.status = status;
                    })
                    .await?;
                Ok(())
            }
            other => Err(ExecutorError::InvalidBackup {
                reason: format!("backup status cannot be reset to {other}"),
            }),
        }
    }

    /// Runs one bus request to completion, producing the reply for `call`s.
    ///
    /// # Errors
    ///
    /// Propagates the underlying operation's error; `cast` callers never
    /// see it (the service loop logs it instead).
    pub async fn handle(
        &self,
        request: ExecutorRequest,
    ) -> Result<ExecutorResponse, ExecutorError> {
        match request {
            ExecutorRequest::CreateBackup { backup_id } => {
                self.create_backup(backup_id).await?;
                Ok(ExecutorResponse::Ack)
            }
            ExecutorRequest::RestoreBackup {
                backup_id,
                volume_id,
            } => {
                self.restore_backup(backup_id, volume_id).await?;
                Ok(ExecutorResponse::Ack)
            }
            ExecutorRequest::DeleteBackup { backup_id } => {
                self.delete_backup(backup_id).await?;
                Ok(ExecutorResponse::Ack)
            }
            ExecutorRequest::ExportRecord { backup_id } => {
                let exported = self.export_record(backup_id).await?;
                Ok(ExecutorResponse::Exported(exported))
            }
            ExecutorRequest::ImportRecord {
                backup_id,
                service,
                record,
                remaining_hosts,
            } => {
                let imported = self
                    .import_record(backup_id, service, record, remaining_hosts)
                    .await?;
                Ok(ExecutorResponse::Imported(Box::new(imported)))
            }
            ExecutorRequest::ResetStatus { backup_id, status } => {
                self.reset_status(backup_id, status).await?;
                Ok(ExecutorResponse::Ack)
            }
        }
    }
}

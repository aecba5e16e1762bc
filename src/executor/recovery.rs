//! Startup sweep over records orphaned by an executor crash.

use tracing::{error, info, warn};

use crate::driver::VolumeDriver;
use crate::model::{BackupStatus, Volume, VolumeStatus};

use super::BackupExecutor;

impl BackupExecutor {
    /// Repairs records stranded mid-operation by a previous incarnation of
    /// this host before any new request is accepted.
    ///
    /// Volumes caught `backing-up` keep their status after orphaned worker
    /// attachments are detached; volumes caught `restoring-backup` are
    /// forced to `error_restoring` because partial restore data cannot be
    /// trusted. Backups caught `creating` become `error`, `restoring`
    /// reverts to `available`, and `deleting` is finished synchronously.
    /// One bad record never stops the sweep.
    pub async fn recover_on_startup(&self) {
        info!(host = self.config.host, "starting crash recovery sweep");

        for volume in self.store.volumes_by_host(&self.config.host).await {
            match volume.status {
                VolumeStatus::BackingUp => {
                    self.detach_orphaned_attachments(&volume).await;
                }
                VolumeStatus::RestoringBackup => {
                    self.detach_orphaned_attachments(&volume).await;
                    let outcome = self
                        .store
                        .update_volume(volume.id, |record| {
                            record.status = VolumeStatus::ErrorRestoring;
                            record.previous_status = None;
                        })
                        .await;
                    if let Err(err) = outcome {
                        error!(volume_id = %volume.id, error = %err, "failed to fail interrupted restore");
                    }
                }
                _ => {}
            }
        }

        for backup in self.store.backups_by_host(&self.config.host).await {
            let outcome = match backup.status {
                BackupStatus::Creating => {
                    warn!(backup_id = %backup.id, "resetting interrupted backup create to error");
                    self.store
                        .update_backup(backup.id, |record| {
                            record.status = BackupStatus::Error;
                            record.fail_reason =
                                Some("incomplete backup, reset on restart".to_owned());
                        })
                        .await
                        .map(|_| ())
                        .map_err(super::ExecutorError::from)
                }
                BackupStatus::Restoring => {
                    warn!(backup_id = %backup.id, "reverting interrupted restore source to available");
                    self.store
                        .update_backup(backup.id, |record| {
                            record.status = BackupStatus::Available;
                        })
                        .await
                        .map(|_| ())
                        .map_err(super::ExecutorError::from)
                }
                BackupStatus::Deleting => {
                    info!(backup_id = %backup.id, "resuming interrupted backup delete");
                    self.delete_backup(backup.id).await
                }
                _ => Ok(()),
            };
            if let Err(err) = outcome {
                error!(backup_id = %backup.id, error = %err, "crash recovery of backup failed");
            }
        }

        info!(host = self.config.host, "crash recovery sweep finished");
    }

    /// Detaches attachments left behind by this host's backup workers.
    ///
    /// Worker attachments are recognised by carrying this host and no
    /// instance; real guest attachments are never touched.
    async fn detach_orphaned_attachments(&self, volume: &Volume) {
        for attachment in &volume.attachments {
            let orphaned =
                attachment.attached_host == self.config.host && attachment.instance_id.is_none();
            if !orphaned {
                continue;
            }
            if let Err(err) = self
                .volume_driver
                .detach_volume(volume.id, attachment.id)
                .await
            {
                warn!(
                    volume_id = %volume.id,
                    attachment_id = %attachment.id,
                    error = %err,
                    "failed to detach orphaned worker attachment"
                );
                continue;
            }
            if let Err(err) = self.store.remove_attachment(volume.id, attachment.id).await {
                warn!(
                    volume_id = %volume.id,
                    attachment_id = %attachment.id,
                    error = %err,
                    "failed to drop detached attachment record"
                );
            }
        }
    }
}

//! In-process transactional store for volume and backup records.
//!
//! The orchestrator and executors never mutate records directly; every
//! status change goes through this store, either as a plain update or as a
//! conditional transition keyed on the expected prior status. The
//! conditional form is the record-scoped mutual exclusion used to serialise
//! concurrent workflows: a race loser observes a typed conflict instead of
//! clobbering another task's write.
//!
//! Every mutation signals a change notifier so poll loops can wait on
//! notification-or-interval instead of busy-sleeping.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::model::{Backup, BackupStatus, Volume, VolumeStatus};


/// Errors returned by the record store.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StoreError {
    /// The requested volume does not exist.
    #[error("volume {volume_id} not found")]
    VolumeNotFound {
        /// Identifier that failed to resolve.
        volume_id: Uuid,
    },
    /// The requested backup does not exist (or was destroyed).
    #[error("backup {backup_id} not found")]
    BackupNotFound {
        /// Identifier that failed to resolve.
        backup_id: Uuid,
    },
    /// An insert collided with an existing record id.
    #[error("record {id} already exists")]
    DuplicateRecord {
        /// Colliding identifier.
        id: Uuid,
    },
    /// A conditional volume transition observed an unexpected status.
    #[error("volume {volume_id} is {actual}, expected one of {expected:?}")]
    VolumeStatusConflict {
        /// Volume whose transition was rejected.
        volume_id: Uuid,
        /// Statuses the caller would have accepted.
        expected: Vec<VolumeStatus>,
        /// Status actually observed.
        actual: VolumeStatus,
    },
    /// A conditional backup transition observed an unexpected status.
    #[error("backup {backup_id} is {actual}, expected one of {expected:?}")]
    BackupStatusConflict {
        /// Backup whose transition was rejected.
        backup_id: Uuid,
        /// Statuses the caller would have accepted.
        expected: Vec<BackupStatus>,
        /// Status actually observed.
        actual: BackupStatus,
    },
}

#[derive(Debug, Default)]
struct Records {
    volumes: HashMap<Uuid, Volume>,
    backups: HashMap<Uuid, Backup>,
}

/// Shared store of volume and backup records.
#[derive(Debug, Default)]
pub struct RecordStore {
    records: Mutex<Records>,
    changed: Notify,
}

impl RecordStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Completes the next time any record is mutated.
    ///
    /// Register the future (poll it once, or hold it inside `select!`)
    /// before re-reading state: notifications are not buffered for futures
    /// created afterwards.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }

    /// Inserts a volume record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DuplicateRecord`] when the id is already known.
    pub async fn insert_volume(&self, volume: Volume) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        if records.volumes.contains_key(&volume.id) {
            return Err(StoreError::DuplicateRecord { id: volume.id });
        }
        records.volumes.insert(volume.id, volume);
        drop(records);
        self.changed.notify_waiters();
        Ok(())
    }

    /// Reads a volume record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::VolumeNotFound`] when the id is unknown.
    pub async fn volume(&self, volume_id: Uuid) -> Result<Volume, StoreError> {
        let records = self.records.lock().await;
        records
            .volumes
            .get(&volume_id)
            .cloned()
            .ok_or(StoreError::VolumeNotFound { volume_id })
    }

    /// Applies an arbitrary update to a volume record and returns the
    /// updated copy.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::VolumeNotFound`] when the id is unknown.
    pub async fn update_volume<F>(&self, volume_id: Uuid, apply: F) -> Result<Volume, StoreError>
    where
        F: FnOnce(&mut Volume),
    {
        let mut records = self.records.lock().await;
        let volume = records
            .volumes
            .get_mut(&volume_id)
            .ok_or(StoreError::VolumeNotFound { volume_id })?;
        apply(volume);
        let updated = volume.clone();
        drop(records);
        self.changed.notify_waiters();
        Ok(updated)
    }

    /// Moves a volume to `next` only when its current status is one of
    /// `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::VolumeNotFound`] for unknown ids and
    /// [`StoreError::VolumeStatusConflict`] when another task got there
    /// first.
    pub async fn transition_volume(
        &self,
        volume_id: Uuid,
        expected: &[VolumeStatus],
        next: VolumeStatus,
    ) -> Result<Volume, StoreError> {
        let mut records = self.records.lock().await;
        let volume = records
            .volumes
            .get_mut(&volume_id)
            .ok_or(StoreError::VolumeNotFound { volume_id })?;
        if !expected.contains(&volume.status) {
            return Err(StoreError::VolumeStatusConflict {
                volume_id,
                expected: expected.to_vec(),
                actual: volume.status,
            });
        }
        volume.status = next;
        let updated = volume.clone();
        drop(records);
        self.changed.notify_waiters();
        Ok(updated)
    }

    /// Moves a volume to `next` while stashing its current status into
    /// `previous_status`, only when the current status is one of `expected`.
    ///
    /// The stash is what the executor settles the volume back to once the
    /// operation finishes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::VolumeNotFound`] for unknown ids and
    /// [`StoreError::VolumeStatusConflict`] when another task got there
    /// first.
    pub async fn stash_and_transition_volume(
        &self,
        volume_id: Uuid,
        expected: &[VolumeStatus],
        next: VolumeStatus,
    ) -> Result<Volume, StoreError> {
        let mut records = self.records.lock().await;
        let volume = records
            .volumes
            .get_mut(&volume_id)
            .ok_or(StoreError::VolumeNotFound { volume_id })?;
        if !expected.contains(&volume.status) {
            return Err(StoreError::VolumeStatusConflict {
                volume_id,
                expected: expected.to_vec(),
                actual: volume.status,
            });
        }
        volume.previous_status = Some(volume.status);
        volume.status = next;
        let updated = volume.clone();
        drop(records);
        self.changed.notify_waiters();
        Ok(updated)
    }

    /// Lists volumes owned by the given host.
    pub async fn volumes_by_host(&self, host: &str) -> Vec<Volume> {
        let records = self.records.lock().await;
        records
            .volumes
            .values()
            .filter(|volume| volume.host == host)
            .cloned()
            .collect()
    }

    /// Removes one attachment from a volume record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::VolumeNotFound`] when the volume is unknown.
    /// A missing attachment id is ignored; the detach already happened.
    pub async fn remove_attachment(
        &self,
        volume_id: Uuid,
        attachment_id: Uuid,
    ) -> Result<(), StoreError> {
        self.update_volume(volume_id, |volume| {
            volume
                .attachments
                .retain(|attachment| attachment.id != attachment_id);
        })
        .await
        .map(|_| ())
    }

    /// Inserts a backup record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DuplicateRecord`] when the id is already known.
    pub async fn insert_backup(&self, backup: Backup) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        if records.backups.contains_key(&backup.id) {
            return Err(StoreError::DuplicateRecord { id: backup.id });
        }
        records.backups.insert(backup.id, backup);
        drop(records);
        self.changed.notify_waiters();
        Ok(())
    }

    /// Reads a backup record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::BackupNotFound`] when the id is unknown.
    pub async fn backup(&self, backup_id: Uuid) -> Result<Backup, StoreError> {
        let records = self.records.lock().await;
        records
            .backups
            .get(&backup_id)
            .cloned()
            .ok_or(StoreError::BackupNotFound { backup_id })
    }

    /// Applies an arbitrary update to a backup record and returns the
    /// updated copy.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::BackupNotFound`] when the id is unknown.
    pub async fn update_backup<F>(&self, backup_id: Uuid, apply: F) -> Result<Backup, StoreError>
    where
        F: FnOnce(&mut Backup),
    {
        let mut records = self.records.lock().await;
        let backup = records
            .backups
            .get_mut(&backup_id)
            .ok_or(StoreError::BackupNotFound { backup_id })?;
        apply(backup);
        let updated = backup.clone();
        drop(records);
        self.changed.notify_waiters();
        Ok(updated)
    }

    /// Moves a backup to `next` only when its current status is one of
    /// `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::BackupNotFound`] for unknown ids and
    /// [`StoreError::BackupStatusConflict`] when another task got there
    /// first.
    pub async fn transition_backup(
        &self,
        backup_id: Uuid,
        expected: &[BackupStatus],
        next: BackupStatus,
    ) -> Result<Backup, StoreError> {
        let mut records = self.records.lock().await;
        let backup = records
            .backups
            .get_mut(&backup_id)
            .ok_or(StoreError::BackupNotFound { backup_id })?;
        if !expected.contains(&backup.status) {
            return Err(StoreError::BackupStatusConflict {
                backup_id,
                expected: expected.to_vec(),
                actual: backup.status,
            });
        }
        backup.status = next;
        let updated = backup.clone();
        drop(records);
        self.changed.notify_waiters();
        Ok(updated)
    }

    /// Like [`Self::transition_backup`], but also applies `apply` to the
    /// record in the same mutation, so a terminal write and its payload
    /// cannot be torn apart by a concurrent writer.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::BackupNotFound`] for unknown ids and
    /// [`StoreError::BackupStatusConflict`] when another task got there
    /// first; `apply` does not run on conflict.
    pub async fn transition_backup_with<F>(
        &self,
        backup_id: Uuid,
        expected: &[BackupStatus],
        next: BackupStatus,
        apply: F,
    ) -> Result<Backup, StoreError>
    where
        F: FnOnce(&mut Backup),
    {
        let mut records = self.records.lock().await;
        let backup = records
            .backups
            .get_mut(&backup_id)
            .ok_or(StoreError::BackupNotFound { backup_id })?;
        if !expected.contains(&backup.status) {
            return Err(StoreError::BackupStatusConflict {
                backup_id,
                expected: expected.to_vec(),
                actual: backup.status,
            });
        }
        backup.status = next;
        apply(backup);
        let updated = backup.clone();
        drop(records);
        self.changed.notify_waiters();
        Ok(updated)
    }

    /// Lists every backup of a volume, across all projects.
    ///
    /// This is an elevated-scope read: incremental-chain resolution must
    /// see backups regardless of which project created them.
    pub async fn backups_by_volume(&self, volume_id: Uuid) -> Vec<Backup> {
        let records = self.records.lock().await;
        records
            .backups
            .values()
            .filter(|backup| backup.volume_id == volume_id)
            .cloned()
            .collect()
    }

    /// Lists backups owned by the given host.
    pub async fn backups_by_host(&self, host: &str) -> Vec<Backup> {
        let records = self.records.lock().await;
        records
            .backups
            .values()
            .filter(|backup| backup.host == host)
            .cloned()
            .collect()
    }

    /// Lists backups owned by the given project.
    pub async fn backups_by_project(&self, project_id: &str) -> Vec<Backup> {
        let records = self.records.lock().await;
        records
            .backups
            .values()
            .filter(|backup| backup.project_id == project_id)
            .cloned()
            .collect()
    }

    /// Lists the incremental children of a backup.
    pub async fn children_of(&self, parent_id: Uuid) -> Vec<Backup> {
        let records = self.records.lock().await;
        records
            .backups
            .values()
            .filter(|backup| backup.parent_id == Some(parent_id))
            .cloned()
            .collect()
    }

    /// Removes a backup record permanently and returns its last state.
    ///
    /// Status discipline (destroy only from `deleting`) is the executor's
    /// responsibility, not the store's.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::BackupNotFound`] when the id is unknown.
    pub async fn destroy_backup(&self, backup_id: Uuid) -> Result<Backup, StoreError> {
        let mut records = self.records.lock().await;
        let removed = records
            .backups
            .remove(&backup_id)
            .ok_or(StoreError::BackupNotFound { backup_id })?;
        drop(records);
        self.changed.notify_waiters();
        Ok(removed)
    }
}

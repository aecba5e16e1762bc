//! Incremental-chain parent selection.
//!
//! Periodic backups never chain and are invisible to chain resolution;
//! among the remaining backups of a volume the newest one becomes the
//! parent, provided it is `available`. A parent that is still `creating`
//! rejects the request rather than racing against it; any other
//! non-`available` candidate silently degrades the request to a full
//! backup.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::model::BackupStatus;
use crate::store::RecordStore;

/// Errors raised during parent resolution.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ChainError {
    /// The would-be parent has not finished being created.
    #[error("the parent backup {backup_id} is currently being created")]
    ParentStillCreating {
        /// The candidate parent.
        backup_id: Uuid,
    },
}

/// Selects incremental parents out of the record store.
#[derive(Clone, Debug)]
pub struct ChainResolver {
    store: Arc<RecordStore>,
}

impl ChainResolver {
    /// Creates a resolver reading from the given store.
    #[must_use]
    pub const fn new(store: Arc<RecordStore>) -> Self {
        Self { store }
    }

    /// Returns the parent backup id for a new backup of `volume_id`, or
    /// `None` for a full backup.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::ParentStillCreating`] when the newest
    /// non-periodic backup of the volume is still `creating`.
    pub async fn resolve_parent(
        &self,
        volume_id: Uuid,
        incremental: bool,
        periodic: bool,
    ) -> Result<Option<Uuid>, ChainError> {
        if periodic || !incremental {
            return Ok(None);
        }

        let backups = self.store.backups_by_volume(volume_id).await;
        let latest = backups
            .into_iter()
            .filter(|backup| !backup.is_periodic)
            .max_by_key(|backup| backup.created_at);
        let Some(candidate) = latest else {
            info!(%volume_id, "no backups eligible as a parent, doing a full backup");
            return Ok(None);
        };

        match candidate.status {
            BackupStatus::Available => {
                info!(
                    %volume_id,
                    parent_id = %candidate.id,
                    "found parent backup, doing an incremental backup"
                );
                Ok(Some(candidate.id))
            }
            BackupStatus::Creating => Err(ChainError::ParentStillCreating {
                backup_id: candidate.id,
            }),
            status => {
                debug!(
                    %volume_id,
                    parent_id = %candidate.id,
                    %status,
                    "newest backup is not available, falling back to a full backup"
                );
                Ok(None)
            }
        }
    }
}

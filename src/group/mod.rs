//! VM-consistent backup of every volume attached to one instance.
//!
//! The coordinator freezes the guest filesystem when the instance is
//! running, accepts one backup per member volume through the orchestrator,
//! fans the work out to the owning hosts, and waits for every member to
//! reach a terminal status before thawing. Freeze is an optimization:
//! a guest that cannot be frozen still gets a crash-consistent group.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{ExecutorRequest, MessageBus};
use crate::driver::{ComputeAgent, ComputeError};
use crate::model::{Backup, BackupStatus, PowerState, VolumeStatus};
use crate::orchestrator::{BackupOrchestrator, CreateBackupRequest, OrchestratorError};
use crate::store::{RecordStore, StoreError};

#[cfg(test)]
mod tests;

/// Reason written onto members still running when the poll budget runs out.
pub const TIMEOUT_REASON: &str = "backup not finished within time budget";

/// Errors surfaced to group-backup callers.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum GroupError {
    /// The group names no volumes.
    #[error("an instance group backup needs at least one volume")]
    EmptyGroup,
    /// The instance's power state could not be established.
    #[error("cannot establish the state of instance {instance_id}: {reason}")]
    InstanceUnavailable {
        /// Instance whose state is unknown.
        instance_id: Uuid,
        /// Compute-side failure detail.
        reason: String,
    },
    /// A member failed validation or acceptance; accepted members were
    /// unwound.
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    /// The record store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Parameters of one instance-group backup.
///
/// Name, description, container and the chaining flags apply to every
/// member alike.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GroupBackupRequest {
    /// Instance whose volumes are backed up together.
    pub instance_id: Uuid,
    /// Member volumes, each attached to the instance.
    pub volume_ids: Vec<Uuid>,
    /// Display name applied to every member backup.
    pub display_name: Option<String>,
    /// Description applied to every member backup, behind the correlation
    /// prefix.
    pub description: Option<String>,
    /// Backend namespace for every member.
    pub container: Option<String>,
    /// Chain each member off its volume's latest prior backup.
    pub incremental: bool,
    /// Taken by a scheduled trigger.
    pub is_periodic: bool,
}

/// Timing knobs of the completion wait and the thaw retry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GroupTimings {
    /// Interval between completion polls.
    pub poll_interval: Duration,
    /// Number of polls before pending members are failed.
    pub max_polls: u32,
    /// Delay before the single thaw retry after an API timeout.
    pub thaw_retry_delay: Duration,
}

impl Default for GroupTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_polls: 720,
            thaw_retry_delay: Duration::from_secs(20),
        }
    }
}

/// Coordinates freeze, fan-out, completion wait and thaw.
pub struct InstanceGroupCoordinator {
    store: Arc<RecordStore>,
    orchestrator: Arc<BackupOrchestrator>,
    compute: Arc<dyn ComputeAgent>,
    bus: Arc<dyn MessageBus>,
    timings: GroupTimings,
}

impl InstanceGroupCoordinator {
    /// Creates a coordinator sharing the orchestrator's store and bus.
    #[must_use]
    pub fn new(
        store: Arc<RecordStore>,
        orchestrator: Arc<BackupOrchestrator>,
        compute: Arc<dyn ComputeAgent>,
        bus: Arc<dyn MessageBus>,
        timings: GroupTimings,
    ) -> Self {
        Self {
            store,
            orchestrator,
            compute,
            bus,
            timings,
        }
    }

    /// Backs up every member volume of the instance as one consistent
    /// group.
    ///
    /// Returns the accepted records in status `creating`, snapshotted at
    /// acceptance; the final per-member outcome is read from the store.
    /// The call itself blocks until every member is terminal or the poll
    /// budget runs out.
    ///
    /// # Errors
    ///
    /// Validation and acceptance failures propagate after every
    /// already-accepted member has been unwound; the guest is always
    /// thawed when a freeze was attempted.
    pub async fn backup_instance_group(
        &self,
        request: GroupBackupRequest,
    ) -> Result<Vec<Backup>, GroupError> {
        if request.volume_ids.is_empty() {
            return Err(GroupError::EmptyGroup);
        }
        let state = self
            .compute
            .power_state(request.instance_id)
            .await
            .map_err(|err| GroupError::InstanceUnavailable {
                instance_id: request.instance_id,
                reason: err.to_string(),
            })?;
        self.validate_members(&request).await?;

        // Freeze before any member is accepted so every copy observes the
        // same quiesced filesystem. Every freeze failure downgrades to a
        // warning.
        let freeze_attempted = state == PowerState::Active;
        if freeze_attempted {
            if let Err(err) = self.compute.flush_and_freeze(request.instance_id).await {
                warn!(
                    instance_id = %request.instance_id,
                    error = %err,
                    "could not freeze the guest filesystem, group will be crash-consistent"
                );
            }
        } else {
            debug!(
                instance_id = %request.instance_id,
                %state,
                "instance not running, skipping filesystem freeze"
            );
        }

        let outcome = self.accept_and_await(&request).await;
        if freeze_attempted {
            self.thaw(request.instance_id).await;
        }
        outcome
    }

    /// Every member must exist, be `in-use`, and be covered by an enabled
    /// backup service.
    async fn validate_members(&self, request: &GroupBackupRequest) -> Result<(), GroupError> {
        for &volume_id in &request.volume_ids {
            let volume = self.store.volume(volume_id).await?;
            if volume.status != VolumeStatus::InUse {
                return Err(GroupError::Orchestrator(
                    OrchestratorError::VolumeNotAvailable {
                        volume_id,
                        status: volume.status,
                        expected: vec![VolumeStatus::InUse],
                    },
                ));
            }
            self.orchestrator.require_backup_service(&volume).await?;
        }
        Ok(())
    }

    async fn accept_and_await(
        &self,
        request: &GroupBackupRequest,
    ) -> Result<Vec<Backup>, GroupError> {
        // The correlation prefix keeps members of concurrent group calls
        // distinguishable in free text.
        let correlation = Uuid::new_v4().simple().to_string();
        let description = match &request.description {
            Some(text) => format!("{correlation} {text}"),
            None => correlation.clone(),
        };

        let mut accepted: Vec<Backup> = Vec::with_capacity(request.volume_ids.len());
        for &volume_id in &request.volume_ids {
            let volume = match self.store.volume(volume_id).await {
                Ok(volume) => volume,
                Err(err) => {
                    self.unwind(&accepted).await;
                    return Err(err.into());
                }
            };
            let member = CreateBackupRequest {
                volume_id,
                display_name: request.display_name.clone(),
                description: Some(description.clone()),
                container: request.container.clone(),
                incremental: request.incremental,
                is_periodic: request.is_periodic,
            };
            match self
                .orchestrator
                .accept_backup(&volume, &member, &[VolumeStatus::InUse])
                .await
            {
                Ok(backup) => accepted.push(backup),
                Err(err) => {
                    self.unwind(&accepted).await;
                    return Err(err.into());
                }
            }
        }
        info!(
            instance_id = %request.instance_id,
            members = accepted.len(),
            correlation,
            "instance group accepted"
        );

        for backup in &accepted {
            if let Err(err) = self
                .bus
                .cast(
                    &backup.host,
                    ExecutorRequest::CreateBackup {
                        backup_id: backup.id,
                    },
                )
                .await
            {
                // The member stays `creating` and the poll budget will
                // fail it with the timeout reason.
                warn!(backup_id = %backup.id, error = %err, "failed to dispatch group member");
            }
        }

        self.await_completion(&accepted).await?;
        Ok(accepted)
    }

    /// Reverts members accepted before a later member failed: volume
    /// settled back, backup failed, deletion dispatched so the quota
    /// reservation is released.
    async fn unwind(&self, accepted: &[Backup]) {
        for backup in accepted {
            let failed = self
                .store
                .update_backup(backup.id, |record| {
                    record.status = BackupStatus::Error;
                    record.fail_reason = Some("instance group backup aborted".to_owned());
                })
                .await;
            if let Err(err) = failed {
                warn!(backup_id = %backup.id, error = %err, "failed to fail unwound member");
                continue;
            }
            let settled = self
                .store
                .update_volume(backup.volume_id, |volume| {
                    volume.status = volume.previous_status.take().unwrap_or(VolumeStatus::InUse);
                })
                .await;
            if let Err(err) = settled {
                warn!(volume_id = %backup.volume_id, error = %err, "failed to settle unwound volume");
            }
            if let Err(err) = self.orchestrator.delete(backup.id).await {
                warn!(backup_id = %backup.id, error = %err, "failed to dispatch unwind deletion");
            }
        }
    }

    /// Polls the members until every one is terminal, failing stragglers
    /// when the budget runs out. Holds no lock while waiting and returns
    /// normally on timeout.
    async fn await_completion(&self, accepted: &[Backup]) -> Result<(), GroupError> {
        let mut polls = 0u32;
        loop {
            let mut pending = Vec::new();
            for backup in accepted {
                match self.store.backup(backup.id).await {
                    Ok(current) if !current.status.is_terminal() => pending.push(backup.id),
                    // A member destroyed while we waited is terminal too.
                    Ok(_) | Err(StoreError::BackupNotFound { .. }) => {}
                    Err(err) => return Err(err.into()),
                }
            }
            if pending.is_empty() {
                return Ok(());
            }
            polls += 1;
            // The budget is max_polls full waits; the check sits after the
            // increment, so strictly-greater gives exactly that many.
            if polls > self.timings.max_polls {
                for backup_id in pending {
                    warn!(%backup_id, "group member ran out of time, forcing error");
                    let forced = self
                        .store
                        .update_backup(backup_id, |record| {
                            record.status = BackupStatus::Error;
                            record.fail_reason = Some(TIMEOUT_REASON.to_owned());
                        })
                        .await;
                    if let Err(err) = forced {
                        warn!(%backup_id, error = %err, "failed to fail timed-out member");
                    }
                }
                return Ok(());
            }
            let notified = self.store.changed();
            tokio::select! {
                () = notified => {}
                () = time::sleep(self.timings.poll_interval) => {}
            }
        }
    }

    /// Thaws the guest, retrying once after an API timeout; gone or
    /// already-thawed guests are not errors.
    async fn thaw(&self, instance_id: Uuid) {
        let result = match self.compute.thaw(instance_id).await {
            Err(ComputeError::ApiTimeout) => {
                warn!(%instance_id, "thaw timed out, retrying once");
                time::sleep(self.timings.thaw_retry_delay).await;
                self.compute.thaw(instance_id).await
            }
            other => other,
        };
        match result {
            Ok(())
            | Err(ComputeError::InstanceNotFound { .. } | ComputeError::AlreadyThawed { .. }) => {}
            Err(err) => {
                warn!(%instance_id, error = %err, "failed to thaw the guest filesystem");
            }
        }
    }
}

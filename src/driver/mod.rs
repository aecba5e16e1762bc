//! Capability seams consumed by the orchestration core.
//!
//! Concrete backup transports, volume-storage backends and the compute
//! guest agent live outside this crate; the core depends only on the
//! traits here. Implementations return boxed futures through
//! [`DriverFuture`] so the traits stay object-safe.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;
use uuid::Uuid;

use crate::model::{Backup, ImportedRecord, PowerState, Volume};

pub mod sim;

/// Boxed future returned by capability methods.
pub type DriverFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Failure reported by a backup or volume driver.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DriverError {
    /// The backend rejected or failed the operation.
    #[error("{message}")]
    Backend {
        /// Backend-supplied failure detail.
        message: String,
    },
    /// The supplied record blob could not be decoded.
    #[error("malformed backup record: {message}")]
    MalformedRecord {
        /// Decoder failure detail.
        message: String,
    },
}

impl DriverError {
    /// Wraps a backend failure message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

/// Outcome of a successful driver backup.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BackupArtifact {
    /// Bytes written, in megabytes.
    pub size_mb: u64,
    /// Container the bytes were written into, when the driver picked one.
    pub container: Option<String>,
    /// Number of objects stored.
    pub object_count: u64,
    /// Opaque driver bookkeeping to persist on the record.
    pub service_metadata: Option<String>,
}

/// A backup transport driver, keyed by its service name.
///
/// `verify` and `durably_committed` are optional capabilities: a `None`
/// return means the driver does not implement them.
pub trait BackupDriver: Send + Sync {
    /// Name routing restores, deletes and exports back to this driver type.
    fn service_name(&self) -> &str;

    /// Copies the volume's data into the backup store.
    fn backup<'a>(
        &'a self,
        backup: &'a Backup,
        volume: &'a Volume,
    ) -> DriverFuture<'a, BackupArtifact, DriverError>;

    /// Writes the backup's data onto the destination volume.
    fn restore<'a>(
        &'a self,
        backup: &'a Backup,
        volume: &'a Volume,
    ) -> DriverFuture<'a, (), DriverError>;

    /// Removes the backup's data from the backup store.
    fn delete<'a>(&'a self, backup: &'a Backup) -> DriverFuture<'a, (), DriverError>;

    /// Encodes everything needed to re-import the backup elsewhere.
    fn export_record<'a>(&'a self, backup: &'a Backup) -> DriverFuture<'a, String, DriverError>;

    /// Decodes an exported blob into the required record fields.
    fn import_record<'a>(
        &'a self,
        record: &'a str,
    ) -> DriverFuture<'a, ImportedRecord, DriverError>;

    /// Checks the integrity of a stored backup, when supported.
    fn verify<'a>(
        &'a self,
        _backup: &'a Backup,
    ) -> Option<DriverFuture<'a, (), DriverError>> {
        None
    }

    /// Reports whether a still-running backup has been durably initiated,
    /// when the backend can know that. Not consulted by the group poll
    /// loop; see DESIGN.md.
    fn durably_committed<'a>(
        &'a self,
        _backup: &'a Backup,
    ) -> Option<DriverFuture<'a, bool, DriverError>> {
        None
    }
}

/// Request to provision a restore target volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeSpec {
    /// Human-friendly volume name.
    pub name: String,
    /// Free-text description.
    pub description: String,
    /// Size in gigabytes.
    pub size_gb: u64,
    /// Owning project.
    pub project_id: String,
}

/// Volume-storage backend operations the core needs.
///
/// `create_volume` registers the new record in the shared store in status
/// `creating`; the backend settles it to `available` (or `error`)
/// asynchronously and the caller polls the store.
pub trait VolumeDriver: Send + Sync {
    /// Provisions a new volume and returns its id.
    fn create_volume<'a>(&'a self, spec: &'a VolumeSpec) -> DriverFuture<'a, Uuid, DriverError>;

    /// Detaches one attachment from a volume on the backend.
    fn detach_volume<'a>(
        &'a self,
        volume_id: Uuid,
        attachment_id: Uuid,
    ) -> DriverFuture<'a, (), DriverError>;
}

/// Failure reported by the compute guest agent.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ComputeError {
    /// The instance does not exist (any more).
    #[error("instance {instance_id} not found")]
    InstanceNotFound {
        /// Instance that failed to resolve.
        instance_id: Uuid,
    },
    /// The compute API did not answer in time.
    #[error("compute API timed out")]
    ApiTimeout,
    /// The in-guest command failed.
    #[error("guest command failed: {message}")]
    ExecFailed {
        /// Guest-side failure detail.
        message: String,
    },
    /// The guest agent is not enabled for the instance.
    #[error("guest agent is not enabled on instance {instance_id}")]
    GuestAgentDisabled {
        /// Instance missing the agent.
        instance_id: Uuid,
    },
    /// The guest agent is enabled but not responding.
    #[error("guest agent is not available on instance {instance_id}")]
    GuestAgentUnavailable {
        /// Instance whose agent is down.
        instance_id: Uuid,
    },
    /// The filesystem is already frozen.
    #[error("instance {instance_id} is already frozen")]
    AlreadyFrozen {
        /// Instance already frozen.
        instance_id: Uuid,
    },
    /// The filesystem is already thawed.
    #[error("instance {instance_id} is already thawed")]
    AlreadyThawed {
        /// Instance already thawed.
        instance_id: Uuid,
    },
    /// Any other compute-side failure.
    #[error("{message}")]
    Other {
        /// Failure detail.
        message: String,
    },
}

/// Guest-agent operations used around instance-consistent backups.
pub trait ComputeAgent: Send + Sync {
    /// Reads the instance's power state.
    fn power_state(&self, instance_id: Uuid) -> DriverFuture<'_, PowerState, ComputeError>;

    /// Flushes guest caches to disk and freezes the filesystem.
    fn flush_and_freeze(&self, instance_id: Uuid) -> DriverFuture<'_, (), ComputeError>;

    /// Thaws a previously frozen filesystem.
    fn thaw(&self, instance_id: Uuid) -> DriverFuture<'_, (), ComputeError>;
}

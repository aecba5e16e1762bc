//! Core records for the backup orchestration engine.
//!
//! Volumes are owned by the volume-storage backend; the orchestrator reads
//! their size, host and status and writes status (plus the pre-restore
//! stash). Backups are owned by this crate and move through the lifecycle
//! described on [`BackupStatus`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a volume as seen by the orchestrator.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum VolumeStatus {
    /// Ready for attach, backup or restore.
    #[serde(rename = "available")]
    Available,
    /// Attached to at least one instance.
    #[serde(rename = "in-use")]
    InUse,
    /// Being provisioned by the volume backend.
    #[serde(rename = "creating")]
    Creating,
    /// A backup of this volume is in progress.
    #[serde(rename = "backing-up")]
    BackingUp,
    /// A backup is being restored onto this volume.
    #[serde(rename = "restoring-backup")]
    RestoringBackup,
    /// The volume backend reported a failure.
    #[serde(rename = "error")]
    Error,
    /// A restore onto this volume failed; its contents are suspect.
    #[serde(rename = "error_restoring")]
    ErrorRestoring,
}

impl VolumeStatus {
    /// Returns the wire representation of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::InUse => "in-use",
            Self::Creating => "creating",
            Self::BackingUp => "backing-up",
            Self::RestoringBackup => "restoring-backup",
            Self::Error => "error",
            Self::ErrorRestoring => "error_restoring",
        }
    }
}

impl std::fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a backup record.
///
/// Legal transitions: `creating → {available, error}`,
/// `available → deleting → (destroyed)` and
/// `available → restoring → available`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum BackupStatus {
    /// Accepted; the executor has not finished writing it yet.
    #[serde(rename = "creating")]
    Creating,
    /// Complete and restorable; `size_mb` is authoritative.
    #[serde(rename = "available")]
    Available,
    /// Terminally failed; see `fail_reason`.
    #[serde(rename = "error")]
    Error,
    /// Currently the source of a restore.
    #[serde(rename = "restoring")]
    Restoring,
    /// Deletion dispatched; the record disappears on completion.
    #[serde(rename = "deleting")]
    Deleting,
}

impl BackupStatus {
    /// Returns the wire representation of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Available => "available",
            Self::Error => "error",
            Self::Restoring => "restoring",
            Self::Deleting => "deleting",
        }
    }

    /// True when the status is an end state of the create workflow.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Available | Self::Error)
    }
}

impl std::fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Guest power state reported by the compute agent.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum PowerState {
    /// The guest is running.
    #[serde(rename = "active")]
    Active,
    /// The guest is powered off.
    #[serde(rename = "shutoff")]
    Shutoff,
    /// The guest is paused.
    #[serde(rename = "paused")]
    Paused,
    /// The guest is suspended to disk.
    #[serde(rename = "suspended")]
    Suspended,
    /// The guest is shelved and its resources released.
    #[serde(rename = "shelved_offloaded")]
    ShelvedOffloaded,
}

impl PowerState {
    /// Wire name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Shutoff => "shutoff",
            Self::Paused => "paused",
            Self::Suspended => "suspended",
            Self::ShelvedOffloaded => "shelved_offloaded",
        }
    }

    /// True when the guest cannot be writing to its disks.
    #[must_use]
    pub const fn is_powered_off(self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attachment of a volume to an instance (or to a host for maintenance).
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Attachment {
    /// Attachment identifier.
    pub id: Uuid,
    /// Instance holding the attachment, if any. Host-side maintenance
    /// attachments carry no instance.
    pub instance_id: Option<Uuid>,
    /// Host that performed the attach.
    pub attached_host: String,
}

/// A network-attached block volume.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Volume {
    /// Volume identifier.
    pub id: Uuid,
    /// Owning project, used for quota accounting.
    pub project_id: String,
    /// Size in gigabytes; immutable after creation.
    pub size_gb: u64,
    /// Current lifecycle status.
    pub status: VolumeStatus,
    /// Status stashed before a backup or restore so it can be put back
    /// afterwards.
    pub previous_status: Option<VolumeStatus>,
    /// Host owning the volume and its executor.
    pub host: String,
    /// Availability zone of the backing storage.
    pub availability_zone: String,
    /// Current attachments.
    pub attachments: Vec<Attachment>,
}

impl Volume {
    /// Creates an unattached volume record in the given status.
    #[must_use]
    pub fn new(
        project_id: impl Into<String>,
        size_gb: u64,
        status: VolumeStatus,
        host: impl Into<String>,
        availability_zone: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id: project_id.into(),
            size_gb,
            status,
            previous_status: None,
            host: host.into(),
            availability_zone: availability_zone.into(),
            attachments: Vec::new(),
        }
    }
}

/// A point-in-time copy of a volume's data plus its lifecycle state.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Backup {
    /// Backup identifier.
    pub id: Uuid,
    /// Volume this backup was taken from. A nil id marks an import
    /// placeholder whose source volume lives elsewhere.
    pub volume_id: Uuid,
    /// Owning project, used for quota accounting.
    pub project_id: String,
    /// Caller-supplied display name.
    pub display_name: Option<String>,
    /// Caller-supplied free-text description.
    pub description: Option<String>,
    /// Current lifecycle status.
    pub status: BackupStatus,
    /// Size in megabytes; `0` until the executor reports the real size.
    pub size_mb: u64,
    /// Backend-defined namespace the backup was written into.
    pub container: Option<String>,
    /// Parent in the incremental chain. Weak reference only; deleting a
    /// parent with children is rejected rather than cascaded.
    pub parent_id: Option<Uuid>,
    /// Host whose executor owns this backup.
    pub host: String,
    /// Name of the backup driver that produced the backup. Restores,
    /// deletes and exports must be routed to the same driver type.
    pub service: Option<String>,
    /// Failure detail when status is `error`.
    pub fail_reason: Option<String>,
    /// Creation timestamp; orders incremental-chain candidates.
    pub created_at: DateTime<Utc>,
    /// Availability zone of the executor that wrote the backup.
    pub availability_zone: Option<String>,
    /// Number of objects the driver stored, when known.
    pub object_count: u64,
    /// Opaque driver bookkeeping carried through export/import.
    pub service_metadata: Option<String>,
    /// Taken by a scheduled trigger; excluded from incremental-chain
    /// resolution.
    pub is_periodic: bool,
    /// Most recent backup successfully restored onto its volume.
    pub is_active_restore_target: bool,
}

impl Backup {
    /// Creates a `creating` record for the given volume.
    #[must_use]
    pub fn new(volume: &Volume, host: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            volume_id: volume.id,
            project_id: volume.project_id.clone(),
            display_name: None,
            description: None,
            status: BackupStatus::Creating,
            size_mb: 0,
            container: None,
            parent_id: None,
            host: host.into(),
            service: None,
            fail_reason: None,
            created_at: Utc::now(),
            availability_zone: None,
            object_count: 0,
            service_metadata: None,
            is_periodic: false,
            is_active_restore_target: false,
        }
    }

    /// Creates an import placeholder owned by the given project. The volume
    /// reference is nil until the exporting record is applied.
    #[must_use]
    pub fn import_placeholder(project_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            volume_id: Uuid::nil(),
            project_id: project_id.into(),
            display_name: None,
            description: None,
            status: BackupStatus::Creating,
            size_mb: 0,
            container: None,
            parent_id: None,
            host: String::new(),
            service: None,
            fail_reason: None,
            created_at: Utc::now(),
            availability_zone: None,
            object_count: 0,
            service_metadata: None,
            is_periodic: false,
            is_active_restore_target: false,
        }
    }
}

/// Field set a driver must return from `import_record` for a backup to be
/// reconstructed on the importing deployment.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ImportedRecord {
    /// Display name of the exported backup.
    pub display_name: Option<String>,
    /// Description of the exported backup.
    pub description: Option<String>,
    /// Container the backup bytes live in.
    pub container: Option<String>,
    /// Size of the backup in megabytes.
    pub size_mb: u64,
    /// Opaque driver bookkeeping.
    pub service_metadata: Option<String>,
    /// Driver service that wrote the backup.
    pub service: String,
    /// Number of stored objects.
    pub object_count: u64,
}

/// Result of a restore request: the identifiers to poll for completion.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RestoreHandle {
    /// Backup being restored.
    pub backup_id: Uuid,
    /// Volume the backup is being written onto.
    pub volume_id: Uuid,
}

/// An exported backup record: the driver blob plus the service needed to
/// re-import it.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ExportedRecord {
    /// Driver service that can interpret the blob.
    pub service: String,
    /// Opaque driver-encoded description of the backup.
    pub record: String,
}

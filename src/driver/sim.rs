//! Metadata-only backup driver for development and the serve skeleton.
//!
//! `SimDriver` moves no bytes: a backup "writes" a record sized after the
//! source volume and every restore/delete succeeds immediately. Export and
//! import round-trip the record fields through JSON, which makes the driver
//! useful for exercising the orchestration paths end to end.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Backup, ImportedRecord, Volume, VolumeStatus};
use crate::store::RecordStore;

use super::{BackupArtifact, BackupDriver, DriverError, DriverFuture, VolumeDriver, VolumeSpec};

/// Default container name used when the caller supplied none.
pub const SIM_CONTAINER: &str = "sim-backups";

#[derive(Debug, Deserialize, Serialize)]
struct SimRecord {
    display_name: Option<String>,
    description: Option<String>,
    container: Option<String>,
    size_mb: u64,
    service_metadata: Option<String>,
    service: String,
    object_count: u64,
}

/// Backup driver that simulates a transport by recording metadata only.
#[derive(Debug)]
pub struct SimDriver {
    service: String,
}

impl SimDriver {
    /// Creates a sim driver advertising the given service name.
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new("sim")
    }
}

impl BackupDriver for SimDriver {
    fn service_name(&self) -> &str {
        &self.service
    }

    fn backup<'a>(
        &'a self,
        backup: &'a Backup,
        volume: &'a Volume,
    ) -> DriverFuture<'a, BackupArtifact, DriverError> {
        Box::pin(async move {
            Ok(BackupArtifact {
                size_mb: volume.size_gb.saturating_mul(1024),
                container: Some(
                    backup
                        .container
                        .clone()
                        .unwrap_or_else(|| SIM_CONTAINER.to_owned()),
                ),
                object_count: 1,
                service_metadata: Some(format!("sim:{}", backup.id)),
            })
        })
    }

    fn restore<'a>(
        &'a self,
        _backup: &'a Backup,
        _volume: &'a Volume,
    ) -> DriverFuture<'a, (), DriverError> {
        Box::pin(async move { Ok(()) })
    }

    fn delete<'a>(&'a self, _backup: &'a Backup) -> DriverFuture<'a, (), DriverError> {
        Box::pin(async move { Ok(()) })
    }

    fn export_record<'a>(&'a self, backup: &'a Backup) -> DriverFuture<'a, String, DriverError> {
        Box::pin(async move {
            let record = SimRecord {
                display_name: backup.display_name.clone(),
                description: backup.description.clone(),
                container: backup.container.clone(),
                size_mb: backup.size_mb,
                service_metadata: backup.service_metadata.clone(),
                service: self.service.clone(),
                object_count: backup.object_count,
            };
            serde_json::to_string(&record)
                .map_err(|err| DriverError::backend(err.to_string()))
        })
    }

    fn import_record<'a>(
        &'a self,
        record: &'a str,
    ) -> DriverFuture<'a, ImportedRecord, DriverError> {
        Box::pin(async move {
            let decoded: SimRecord =
                serde_json::from_str(record).map_err(|err| DriverError::MalformedRecord {
                    message: err.to_string(),
                })?;
            Ok(ImportedRecord {
                display_name: decoded.display_name,
                description: decoded.description,
                container: decoded.container,
                size_mb: decoded.size_mb,
                service_metadata: decoded.service_metadata,
                service: decoded.service,
                object_count: decoded.object_count,
            })
        })
    }

    fn verify<'a>(&'a self, _backup: &'a Backup) -> Option<DriverFuture<'a, (), DriverError>> {
        Some(Box::pin(async move { Ok(()) }))
    }
}

/// Volume backend that registers new volumes directly in the shared store.
///
/// Volumes come up `available` immediately and detaches always succeed, so
/// restore provisioning and the startup sweep can run without real storage.
#[derive(Debug)]
pub struct SimVolumeDriver {
    store: Arc<RecordStore>,
    host: String,
    availability_zone: String,
}

impl SimVolumeDriver {
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
        }
    }
}

impl VolumeDriver for SimVolumeDriver {
    fn create_volume<'a>(&'a self, spec: &'a VolumeSpec) -> DriverFuture<'a, Uuid, DriverError> {
        Box::pin(async move {
            let volume = Volume::new(
                spec.project_id.clone(),
                spec.size_gb,
                VolumeStatus::Available,
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
        _volume_id: Uuid,
        _attachment_id: Uuid,
    ) -> DriverFuture<'a, (), DriverError> {
        Box::pin(async { Ok(()) })
    }
}

//! Per-project quota ledger with two-phase reservations.
//!
//! A reservation holds signed deltas for the backup count and backup
//! capacity of one project. It must be explicitly committed (folded into
//! in-use usage) or rolled back; the ledger performs no automatic cleanup
//! of abandoned reservations.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Limits applied to one project. `None` means unlimited.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct QuotaLimits {
    /// Maximum number of live backups.
    pub backups: Option<u64>,
    /// Maximum total backup capacity in gigabytes.
    pub backup_gigabytes: Option<u64>,
}

/// Signed usage deltas held by a reservation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct QuotaDelta {
    /// Change in backup count.
    pub backups: i64,
    /// Change in backup gigabytes.
    pub backup_gigabytes: i64,
}

impl QuotaDelta {
    /// Delta for accepting one new backup of a volume of the given size.
    #[must_use]
    pub fn for_new_backup(size_gb: u64) -> Self {
        Self {
            backups: 1,
            backup_gigabytes: i64::try_from(size_gb).unwrap_or(i64::MAX),
        }
    }

    /// Delta for releasing one backup of a volume of the given size.
    #[must_use]
    pub fn for_deleted_backup(size_gb: u64) -> Self {
        Self {
            backups: -1,
            backup_gigabytes: -i64::try_from(size_gb).unwrap_or(i64::MAX),
        }
    }
}

/// In-use plus reserved usage for one resource.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ResourceUsage {
    /// Committed usage.
    pub in_use: i64,
    /// Usage held by uncommitted reservations.
    pub reserved: i64,
}

impl ResourceUsage {
    /// Committed plus reserved usage, the figure quota checks run against.
    #[must_use]
    pub const fn consumed(self) -> i64 {
        self.in_use + self.reserved
    }
}

/// Usage snapshot for one project.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ProjectUsage {
    /// Backup-count usage.
    pub backups: ResourceUsage,
    /// Backup-gigabytes usage.
    pub backup_gigabytes: ResourceUsage,
}

/// Errors raised by the quota ledger.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum QuotaError {
    /// The requested capacity does not fit under the gigabyte limit.
    #[error(
        "requested backup of {requested_gb}G exceeds quota: {consumed_gb}G of {limit_gb}G already consumed"
    )]
    CapacityExceeded {
        /// Gigabytes the caller asked for.
        requested_gb: i64,
        /// Gigabytes already in use or reserved.
        consumed_gb: i64,
        /// The project's gigabyte limit.
        limit_gb: u64,
    },
    /// The backup-count limit is exhausted.
    #[error("backup count quota exceeded: {consumed} of {allowed} backups already consumed")]
    BackupCountExceeded {
        /// Backups permitted in total.
        allowed: u64,
        /// Backups already in use or reserved.
        consumed: i64,
    },
    /// Commit or rollback referenced an unknown (or already settled)
    /// reservation.
    #[error("reservation {reservation_id} is not open")]
    UnknownReservation {
        /// Identifier that failed to resolve.
        reservation_id: Uuid,
    },
}

/// Handle to an open reservation.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ReservationId(Uuid);

#[derive(Debug)]
struct OpenReservation {
    project_id: String,
    delta: QuotaDelta,
}

#[derive(Debug, Default)]
struct Ledger {
    usage: HashMap<String, ProjectUsage>,
    limits: HashMap<String, QuotaLimits>,
    open: HashMap<Uuid, OpenReservation>,
}

/// Reserve/commit/rollback ledger for backup quota.
#[derive(Debug)]
pub struct QuotaLedger {
    default_limits: QuotaLimits,
    ledger: Mutex<Ledger>,
}

impl QuotaLedger {
    /// Creates a ledger applying `default_limits` to projects without an
    /// explicit override.
    #[must_use]
    pub fn new(default_limits: QuotaLimits) -> Self {
        Self {
            default_limits,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Creates a ledger with no limits, for deployments that meter
    /// elsewhere.
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(QuotaLimits::default())
    }

    /// Overrides the limits of one project.
    pub async fn set_project_limits(&self, project_id: impl Into<String>, limits: QuotaLimits) {
        let mut ledger = self.ledger.lock().await;
        ledger.limits.insert(project_id.into(), limits);
    }

    /// Reserves the given deltas against a project's limits.
    ///
    /// The capacity check runs before the count check, so a request that
    /// violates both limits reports the capacity failure. Negative deltas
    /// always succeed; they free usage once committed.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::CapacityExceeded`] or
    /// [`QuotaError::BackupCountExceeded`] carrying the requested amount,
    /// current consumption and limit.
    pub async fn reserve(
        &self,
        project_id: &str,
        delta: QuotaDelta,
    ) -> Result<ReservationId, QuotaError> {
        let mut ledger = self.ledger.lock().await;
        let limits = ledger
            .limits
            .get(project_id)
            .copied()
            .unwrap_or(self.default_limits);
        let usage = ledger.usage.entry(project_id.to_owned()).or_default();

        if delta.backup_gigabytes > 0
            && let Some(limit_gb) = limits.backup_gigabytes
        {
            let consumed_gb = usage.backup_gigabytes.consumed();
            let within = consumed_gb
                .checked_add(delta.backup_gigabytes)
                .is_some_and(|total| total <= i64::try_from(limit_gb).unwrap_or(i64::MAX));
            if !within {
                return Err(QuotaError::CapacityExceeded {
                    requested_gb: delta.backup_gigabytes,
                    consumed_gb,
                    limit_gb,
                });
            }
        }
        if delta.backups > 0
            && let Some(allowed) = limits.backups
        {
            let consumed = usage.backups.consumed();
            let within = consumed
                .checked_add(delta.backups)
                .is_some_and(|total| total <= i64::try_from(allowed).unwrap_or(i64::MAX));
            if !within {
                return Err(QuotaError::BackupCountExceeded { allowed, consumed });
            }
        }

        usage.backups.reserved += delta.backups;
        usage.backup_gigabytes.reserved += delta.backup_gigabytes;
        let id = Uuid::new_v4();
        ledger.open.insert(
            id,
            OpenReservation {
                project_id: project_id.to_owned(),
                delta,
            },
        );
        Ok(ReservationId(id))
    }

    /// Commits a reservation, folding its deltas into in-use usage.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::UnknownReservation`] when the reservation was
    /// never opened or has already been settled.
    pub async fn commit(&self, reservation: ReservationId) -> Result<(), QuotaError> {
        let mut ledger = self.ledger.lock().await;
        let open = ledger
            .open
            .remove(&reservation.0)
            .ok_or(QuotaError::UnknownReservation {
                reservation_id: reservation.0,
            })?;
        let usage = ledger.usage.entry(open.project_id).or_default();
        usage.backups.reserved -= open.delta.backups;
        usage.backups.in_use += open.delta.backups;
        usage.backup_gigabytes.reserved -= open.delta.backup_gigabytes;
        usage.backup_gigabytes.in_use += open.delta.backup_gigabytes;
        Ok(())
    }

    /// Rolls a reservation back, releasing its held deltas.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::UnknownReservation`] when the reservation was
    /// never opened or has already been settled.
    pub async fn rollback(&self, reservation: ReservationId) -> Result<(), QuotaError> {
        let mut ledger = self.ledger.lock().await;
        let open = ledger
            .open
            .remove(&reservation.0)
            .ok_or(QuotaError::UnknownReservation {
                reservation_id: reservation.0,
            })?;
        let usage = ledger.usage.entry(open.project_id).or_default();
        usage.backups.reserved -= open.delta.backups;
        usage.backup_gigabytes.reserved -= open.delta.backup_gigabytes;
        Ok(())
    }

    /// Returns the usage snapshot for a project.
    pub async fn usage(&self, project_id: &str) -> ProjectUsage {
        let ledger = self.ledger.lock().await;
        ledger.usage.get(project_id).copied().unwrap_or_default()
    }
}

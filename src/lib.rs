//! Core library for the volback backup orchestration service.
//!
//! The crate models volumes and backups as shared in-memory records, walks
//! them through their lifecycle state machines, and coordinates backup
//! operations across hosts: an orchestrator accepts requests, reserves
//! quota, resolves incremental chains, and dispatches work over a message
//! bus to per-host executors that drive the backup and volume drivers.

pub mod bus;
pub mod chain;
pub mod config;
pub mod driver;
pub mod executor;
pub mod group;
pub mod model;
pub mod orchestrator;
pub mod quota;
pub mod service;
pub mod store;
pub mod test_support;

pub use bus::{
    BusEnvelope, BusError, ExecutorRequest, ExecutorResponse, InProcessBus, MessageBus,
    ServiceRegistry,
};
pub use chain::{ChainError, ChainResolver};
pub use config::{ConfigError, ServiceConfig};
pub use driver::{
    BackupArtifact, BackupDriver, ComputeAgent, ComputeError, DriverError, VolumeDriver,
};
pub use executor::{BackupExecutor, ExecutorConfig, ExecutorError};
pub use group::{GroupBackupRequest, GroupError, GroupTimings, InstanceGroupCoordinator};
pub use model::{Backup, BackupStatus, ExportedRecord, PowerState, Volume, VolumeStatus};
pub use orchestrator::{BackupOrchestrator, CreateBackupRequest, OrchestratorError};
pub use quota::{QuotaError, QuotaLedger, QuotaLimits};
pub use service::ExecutorService;
pub use store::{RecordStore, StoreError};

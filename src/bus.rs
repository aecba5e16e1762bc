//! Host-addressed message bus and the live backup-service registry.
//!
//! Operations are dispatched to the executor owning a record either as a
//! `cast` (fire-and-forget; the caller polls record status for the
//! outcome) or as a `call` (request/response; export needs the blob and
//! import needs host failover). Delivery is assumed at-least-once: the
//! executor's status preconditions make duplicate requests harmless.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot};
use uuid::Uuid;

use crate::executor::ExecutorError;
use crate::model::{Backup, BackupStatus, ExportedRecord};

/// Boxed future returned by bus methods.
pub type BusFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BusError>> + Send + 'a>>;

/// An operation addressed to the executor owning a record.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum ExecutorRequest {
    /// Run the create workflow for an accepted backup.
    CreateBackup {
        /// Backup to create.
        backup_id: Uuid,
    },
    /// Run the restore workflow.
    RestoreBackup {
        /// Backup to restore from.
        backup_id: Uuid,
        /// Volume to restore onto.
        volume_id: Uuid,
    },
    /// Run the delete workflow.
    DeleteBackup {
        /// Backup to delete.
        backup_id: Uuid,
    },
    /// Export a backup's record as an opaque blob.
    ExportRecord {
        /// Backup to export.
        backup_id: Uuid,
    },
    /// Import an exported blob, forwarding along `remaining_hosts` when the
    /// local driver service does not match.
    ImportRecord {
        /// Placeholder record to populate.
        backup_id: Uuid,
        /// Driver service that wrote the blob.
        service: String,
        /// The opaque blob.
        record: String,
        /// Failover hosts still worth trying.
        remaining_hosts: Vec<String>,
    },
    /// Administratively reset a backup's status.
    ResetStatus {
        /// Backup to reset.
        backup_id: Uuid,
        /// Target status.
        status: BackupStatus,
    },
}

/// Response to a `call`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum ExecutorResponse {
    /// The operation completed with nothing to return.
    Ack,
    /// Result of `ExportRecord`.
    Exported(ExportedRecord),
    /// Result of `ImportRecord`.
    Imported(Box<Backup>),
}

/// Errors surfaced by bus dispatch.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BusError {
    /// No executor is registered under the host name.
    #[error("no executor registered for host {host}")]
    UnknownHost {
        /// Host that failed to resolve.
        host: String,
    },
    /// The executor's channel is gone (service stopped).
    #[error("executor on host {host} is no longer accepting requests")]
    ChannelClosed {
        /// Host whose channel closed.
        host: String,
    },
    /// The remote executor ran the request and failed.
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

/// Dispatches named operations to executor hosts.
pub trait MessageBus: Send + Sync {
    /// Sends a request without awaiting its outcome.
    fn cast<'a>(&'a self, host: &'a str, request: ExecutorRequest) -> BusFuture<'a, ()>;

    /// Sends a request and awaits the executor's response.
    fn call<'a>(
        &'a self,
        host: &'a str,
        request: ExecutorRequest,
    ) -> BusFuture<'a, ExecutorResponse>;
}

/// One delivered request plus its optional reply channel.
#[derive(Debug)]
pub struct BusEnvelope {
    /// The request to run.
    pub request: ExecutorRequest,
    /// Present for `call`s; the executor sends its outcome here.
    pub reply: Option<oneshot::Sender<Result<ExecutorResponse, ExecutorError>>>,
}

const MAILBOX_DEPTH: usize = 64;

/// In-process bus backed by per-host mpsc mailboxes.
#[derive(Debug, Default)]
pub struct InProcessBus {
    routes: Mutex<HashMap<String, mpsc::Sender<BusEnvelope>>>,
}

impl InProcessBus {
    /// Creates a bus with no registered hosts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a host and returns its mailbox. Re-registering replaces
    /// the previous mailbox (the old service's channel closes).
    pub async fn register(&self, host: impl Into<String>) -> mpsc::Receiver<BusEnvelope> {
        let (sender, receiver) = mpsc::channel(MAILBOX_DEPTH);
        let mut routes = self.routes.lock().await;
        routes.insert(host.into(), sender);
        receiver
    }

    async fn sender_for(&self, host: &str) -> Result<mpsc::Sender<BusEnvelope>, BusError> {
        let routes = self.routes.lock().await;
        routes
            .get(host)
            .cloned()
            .ok_or_else(|| BusError::UnknownHost {
                host: host.to_owned(),
            })
    }
}

impl MessageBus for InProcessBus {
    fn cast<'a>(&'a self, host: &'a str, request: ExecutorRequest) -> BusFuture<'a, ()> {
        Box::pin(async move {
            let sender = self.sender_for(host).await?;
            sender
                .send(BusEnvelope {
                    request,
                    reply: None,
                })
                .await
                .map_err(|_| BusError::ChannelClosed {
                    host: host.to_owned(),
                })
        })
    }

    fn call<'a>(
        &'a self,
        host: &'a str,
        request: ExecutorRequest,
    ) -> BusFuture<'a, ExecutorResponse> {
        Box::pin(async move {
            let sender = self.sender_for(host).await?;
            let (reply, outcome) = oneshot::channel();
            sender
                .send(BusEnvelope {
                    request,
                    reply: Some(reply),
                })
                .await
                .map_err(|_| BusError::ChannelClosed {
                    host: host.to_owned(),
                })?;
            let result = outcome.await.map_err(|_| BusError::ChannelClosed {
                host: host.to_owned(),
            })?;
            result.map_err(BusError::Executor)
        })
    }
}

/// One registered backup service.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServiceRecord {
    /// Host the service runs on.
    pub host: String,
    /// Availability zone the service covers.
    pub availability_zone: String,
    /// Driver service name configured on the host.
    pub driver_service: String,
    /// Whether the service is accepting work.
    pub enabled: bool,
}

/// Live registry of backup services, consulted on every lookup.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: Mutex<HashMap<String, ServiceRecord>>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a service record.
    pub async fn register(&self, record: ServiceRecord) {
        let mut services = self.services.lock().await;
        services.insert(record.host.clone(), record);
    }

    /// Enables or disables a registered service. Unknown hosts are ignored.
    pub async fn set_enabled(&self, host: &str, enabled: bool) {
        let mut services = self.services.lock().await;
        if let Some(record) = services.get_mut(host) {
            record.enabled = enabled;
        }
    }

    /// True when an enabled service covers both the zone and the host.
    pub async fn is_backup_service_enabled(&self, availability_zone: &str, host: &str) -> bool {
        let services = self.services.lock().await;
        services.get(host).is_some_and(|record| {
            record.enabled && record.availability_zone == availability_zone
        })
    }

    /// Hosts of every enabled service.
    pub async fn enabled_hosts(&self) -> Vec<String> {
        let services = self.services.lock().await;
        let mut hosts: Vec<String> = services
            .values()
            .filter(|record| record.enabled)
            .map(|record| record.host.clone())
            .collect();
        hosts.sort();
        hosts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[tokio::test]
    async fn cast_delivers_to_the_registered_mailbox() {
        let bus = InProcessBus::new();
        let mut mailbox = bus.register("host-1").await;
        let backup_id = Uuid::new_v4();
        bus.cast("host-1", ExecutorRequest::DeleteBackup { backup_id })
            .await
            .expect("cast");
        let envelope = mailbox.recv().await.expect("delivered");
        assert_eq!(envelope.request, ExecutorRequest::DeleteBackup { backup_id });
        assert!(envelope.reply.is_none());
    }

    #[rstest]
    #[tokio::test]
    async fn cast_to_unknown_host_fails() {
        let bus = InProcessBus::new();
        let err = bus
            .cast("nowhere", ExecutorRequest::DeleteBackup { backup_id: Uuid::new_v4() })
            .await
            .expect_err("unknown host");
        assert_eq!(err, BusError::UnknownHost { host: String::from("nowhere") });
    }

    #[rstest]
    #[tokio::test]
    async fn call_round_trips_the_reply() {
        let bus = std::sync::Arc::new(InProcessBus::new());
        let mut mailbox = bus.register("host-1").await;
        tokio::spawn(async move {
            if let Some(envelope) = mailbox.recv().await
                && let Some(reply) = envelope.reply
            {
                let _ = reply.send(Ok(ExecutorResponse::Ack));
            }
        });
        let response = bus
            .call("host-1", ExecutorRequest::ExportRecord { backup_id: Uuid::new_v4() })
            .await
            .expect("call");
        assert_eq!(response, ExecutorResponse::Ack);
    }

    #[rstest]
    #[tokio::test]
    async fn call_surfaces_executor_errors() {
        let bus = std::sync::Arc::new(InProcessBus::new());
        let mut mailbox = bus.register("host-1").await;
        tokio::spawn(async move {
            if let Some(envelope) = mailbox.recv().await
                && let Some(reply) = envelope.reply
            {
                let _ = reply.send(Err(ExecutorError::InvalidBackup {
                    reason: String::from("status must be available"),
                }));
            }
        });
        let err = bus
            .call("host-1", ExecutorRequest::ExportRecord { backup_id: Uuid::new_v4() })
            .await
            .expect_err("remote failure");
        assert_eq!(
            err,
            BusError::Executor(ExecutorError::InvalidBackup {
                reason: String::from("status must be available"),
            })
        );
    }

    #[rstest]
    #[tokio::test]
    async fn registry_matches_zone_and_host() {
        let registry = ServiceRegistry::new();
        registry
            .register(ServiceRecord {
                host: String::from("host-1"),
                availability_zone: String::from("zone-a"),
                driver_service: String::from("sim"),
                enabled: true,
            })
            .await;

        assert!(registry.is_backup_service_enabled("zone-a", "host-1").await);
        assert!(!registry.is_backup_service_enabled("zone-b", "host-1").await);
        assert!(!registry.is_backup_service_enabled("zone-a", "host-2").await);

        registry.set_enabled("host-1", false).await;
        assert!(!registry.is_backup_service_enabled("zone-a", "host-1").await);
        assert!(registry.enabled_hosts().await.is_empty());
    }
}

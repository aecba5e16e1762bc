//! Ties one executor to its bus mailbox.
//!
//! The service runs the crash-recovery sweep, announces itself in the
//! registry, then consumes requests until the mailbox closes. Each request
//! runs in its own task behind a concurrency limit; failures of casts are
//! written to the records by the executor and logged here, never returned
//! anywhere.

use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tracing::{info, warn};

use crate::bus::{BusEnvelope, ServiceRecord, ServiceRegistry};
use crate::executor::BackupExecutor;

/// Request loop wrapping a [`BackupExecutor`].
pub struct ExecutorService {
    executor: Arc<BackupExecutor>,
    registry: Arc<ServiceRegistry>,
    limit: Arc<Semaphore>,
}

impl ExecutorService {
    /// Creates a service running at most `max_concurrent_operations`
    /// requests at once.
    #[must_use]
    pub fn new(
        executor: Arc<BackupExecutor>,
        registry: Arc<ServiceRegistry>,
        max_concurrent_operations: usize,
    ) -> Self {
        Self {
            executor,
            registry,
            limit: Arc::new(Semaphore::new(max_concurrent_operations)),
        }
    }

    /// Recovers, registers and serves the mailbox until it closes.
    ///
    /// Spawned tasks may still be running when this returns; they only
    /// touch the shared store and finish on their own.
    pub async fn serve(&self, mut mailbox: mpsc::Receiver<BusEnvelope>) {
        self.executor.recover_on_startup().await;
        self.registry
            .register(ServiceRecord {
                host: self.executor.host().to_owned(),
                availability_zone: self.executor.availability_zone().to_owned(),
                driver_service: self.executor.driver_service().to_owned(),
                enabled: true,
            })
            .await;
        info!(
            host = self.executor.host(),
            service = self.executor.driver_service(),
            "backup service registered"
        );

        while let Some(envelope) = mailbox.recv().await {
            let Ok(permit) = self.limit.clone().acquire_owned().await else {
                break;
            };
            let executor = self.executor.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let result = executor.handle(envelope.request).await;
                match envelope.reply {
                    Some(reply) => {
                        // A caller that gave up on the reply is not an error.
                        reply.send(result).ok();
                    }
                    None => {
                        if let Err(err) = result {
                            warn!(
                                host = executor.host(),
                                error = %err,
                                "asynchronous request failed; outcome recorded on the records"
                            );
                        }
                    }
                }
            });
        }
        info!(host = self.executor.host(), "backup service mailbox closed");
    }
}

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

use crate::ClientError;
use crate::config::{ConcurrencySettings, Domain, OperationKind};

/// Pool selector for admission control.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AdmissionKey {
    pub domain: Domain,
    pub kind: OperationKind,
    pub project: String,
}

impl AdmissionKey {
    pub fn new(domain: Domain, kind: OperationKind, project: impl Into<String>) -> Self {
        Self {
            domain,
            kind,
            project: project.into(),
        }
    }
}

/// Permit to have one request in flight. Released on drop.
#[derive(Debug)]
pub struct Ticket {
    key: AdmissionKey,
    _permit: OwnedSemaphorePermit,
}

impl Ticket {
    pub fn key(&self) -> &AdmissionKey {
        &self.key
    }
}

/// Registry of bounded pools, one per [`AdmissionKey`].
///
/// Pools are created lazily on first use and live as long as the controller,
/// which lives as long as the client that owns it.
#[derive(Debug)]
pub struct AdmissionController {
    settings: ConcurrencySettings,
    pools: Mutex<HashMap<AdmissionKey, Arc<Semaphore>>>,
}

impl AdmissionController {
    pub fn new(settings: ConcurrencySettings) -> Self {
        Self {
            settings,
            pools: Mutex::new(HashMap::new()),
        }
    }

    fn pool(&self, key: &AdmissionKey) -> Arc<Semaphore> {
        let mut pools = self.pools.lock();
        Arc::clone(pools.entry(key.clone()).or_insert_with(|| {
            Arc::new(Semaphore::new(self.settings.limit(key.domain, key.kind)))
        }))
    }

    /// Waits until the pool for `key` has room.
    pub async fn acquire(&self, key: AdmissionKey) -> Result<Ticket, ClientError> {
        let permit = self
            .pool(&key)
            .acquire_owned()
            .await
            .map_err(|_| ClientError::Config(format!("admission pool for {key:?} is closed")))?;
        trace!(?key, "admission ticket acquired");
        Ok(Ticket {
            key,
            _permit: permit,
        })
    }

    /// Returns a ticket early. Dropping it has the same effect.
    pub fn release(ticket: Ticket) {
        trace!(key = ?ticket.key, "admission ticket released");
        drop(ticket);
    }

    /// Runs `operation` while holding a ticket for `key`.
    ///
    /// The ticket is released when the operation finishes, fails or is cancelled.
    pub async fn guard<F, T>(&self, key: AdmissionKey, operation: F) -> Result<T, ClientError>
    where
        F: Future<Output = T>,
    {
        let ticket = self.acquire(key).await?;
        let output = operation.await;
        Self::release(ticket);
        Ok(output)
    }

    /// Tickets currently available for `key`.
    pub fn available(&self, key: &AdmissionKey) -> usize {
        self.pool(key).available_permits()
    }

    /// Configured size of the pool for `key`.
    pub fn capacity(&self, key: &AdmissionKey) -> usize {
        self.settings.limit(key.domain, key.kind)
    }
}

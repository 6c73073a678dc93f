//! Exclusive per-resource reservations.
//!
//! A reservation serializes work on one resource (a repository, an upload
//! session, a remote) across concurrent request handlers. Holders keep an
//! owned guard for as long as they need exclusivity; waiters queue on the
//! same tokio mutex.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::content::{RepositoryId, UploadId};

/// A resource that can be reserved.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Resource {
    /// Version creation on a repository.
    Repository(RepositoryId),
    /// Chunk appends on an upload.
    Upload(UploadId),
    /// A remote source used by sync tasks.
    Remote(String),
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Repository(id) => write!(f, "repository:{id}"),
            Resource::Upload(id) => write!(f, "upload:{id}"),
            Resource::Remote(name) => write!(f, "remote:{name}"),
        }
    }
}

type LockMap = Arc<DashMap<Resource, Arc<Mutex<()>>>>;

/// Shared table of reservation locks.
#[derive(Debug, Clone, Default)]
pub struct Reservations {
    locks: LockMap,
}

impl Reservations {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, resource: &Resource) -> Arc<Mutex<()>> {
        self.locks
            .entry(resource.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait until `resource` is free, then hold it.
    #[tracing::instrument(skip(self), fields(%resource))]
    pub async fn acquire(&self, resource: Resource) -> Reservation {
        let lock = self.lock_for(&resource);
        let guard = match lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!("waiting for reservation");
                lock.lock_owned().await
            }
        };
        Reservation {
            resource,
            locks: self.locks.clone(),
            guard: Some(guard),
        }
    }

    /// Hold `resource` only if nobody else does.
    pub fn try_acquire(&self, resource: Resource) -> Option<Reservation> {
        let guard = self.lock_for(&resource).try_lock_owned().ok()?;
        Some(Reservation {
            resource,
            locks: self.locks.clone(),
            guard: Some(guard),
        })
    }

    /// Number of resources with a live lock entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no resource is tracked.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Exclusive hold on a resource, released on drop.
pub struct Reservation {
    resource: Resource,
    locks: LockMap,
    guard: Option<OwnedMutexGuard<()>>,
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("resource", &self.resource)
            .finish()
    }
}

impl Reservation {
    /// The held resource.
    pub fn resource(&self) -> &Resource {
        &self.resource
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Forget the lock once only the table references it.
        self.locks
            .remove_if(&self.resource, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exclusive_until_dropped() {
        let reservations = Reservations::new();
        let repo = Resource::Repository(RepositoryId::new());

        let held = reservations.acquire(repo.clone()).await;
        assert!(reservations.try_acquire(repo.clone()).is_none());
        assert_eq!(held.resource(), &repo);

        drop(held);
        assert!(reservations.is_empty());
        assert!(reservations.try_acquire(repo).is_some());
    }

    #[tokio::test]
    async fn distinct_resources_do_not_block() {
        let reservations = Reservations::new();
        let _a = reservations.acquire(Resource::Remote("a".into())).await;
        let _b = reservations.acquire(Resource::Remote("b".into())).await;
        assert_eq!(reservations.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn waiters_resume_after_release() {
        let reservations = Reservations::new();
        let resource = Resource::Upload(UploadId::new());
        let held = reservations.acquire(resource.clone()).await;

        let waiter = {
            let reservations = reservations.clone();
            let resource = resource.clone();
            tokio::spawn(async move {
                let _r = reservations.acquire(resource).await;
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(held);
        waiter.await.unwrap();
    }
}

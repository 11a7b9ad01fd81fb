use crate::engine::{Acquired, MutexEngine, MutexError};
use crate::network::PeerNetwork;
use crate::request::{ResourceId, Timestamp};
use std::future::Future;
use std::time::Duration;

/// Scoped access to resources guarded by a `MutexEngine`.
///
/// A `CriticalSection` releases its resource when dropped, so callers cannot
/// forget the release on an early return.
pub struct ResourceManager<N> {
    engine: MutexEngine<N>,
}

impl<N: PeerNetwork + 'static> ResourceManager<N> {
    pub fn new(engine: MutexEngine<N>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &MutexEngine<N> {
        &self.engine
    }

    /// Enters the critical section of `resource`.
    pub async fn lock(&self, resource: impl Into<ResourceId>) -> Result<CriticalSection<N>, MutexError> {
        let acquired = self.engine.acquire(resource).await?;
        Ok(CriticalSection::new(self.engine.clone(), acquired))
    }

    /// Like `lock`, with an explicit deadline.
    pub async fn lock_timeout(
        &self,
        resource: impl Into<ResourceId>,
        timeout: Duration,
    ) -> Result<CriticalSection<N>, MutexError> {
        let acquired = self.engine.acquire_timeout(resource, timeout).await?;
        Ok(CriticalSection::new(self.engine.clone(), acquired))
    }

    /// Runs `f` inside the critical section of `resource` and releases it
    /// afterwards.
    pub async fn with_resource<F, Fut, T>(&self, resource: impl Into<ResourceId>, f: F) -> Result<T, MutexError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let section = self.lock(resource).await?;
        let value = f().await;
        section.release().await?;
        Ok(value)
    }
}

/// A held resource. Released explicitly with `release`, or in the background
/// when dropped.
pub struct CriticalSection<N: PeerNetwork + 'static> {
    engine: Option<MutexEngine<N>>,
    acquired: Acquired,
}

impl<N: PeerNetwork + 'static> CriticalSection<N> {
    fn new(engine: MutexEngine<N>, acquired: Acquired) -> Self {
        Self {
            engine: Some(engine),
            acquired,
        }
    }

    pub fn resource(&self) -> &ResourceId {
        &self.acquired.resource
    }

    /// Timestamp of the request that won the resource.
    pub fn request_timestamp(&self) -> Timestamp {
        self.acquired.request_timestamp
    }

    /// Releases the resource and waits for deferred peers to be answered.
    pub async fn release(mut self) -> Result<Timestamp, MutexError> {
        match self.engine.take() {
            Some(engine) => engine.release(self.acquired.resource.clone()).await,
            None => Err(MutexError::NotHeld {
                resource: self.acquired.resource.clone(),
            }),
        }
    }
}

impl<N: PeerNetwork + 'static> Drop for CriticalSection<N> {
    fn drop(&mut self) {
        let Some(engine) = self.engine.take() else {
            return;
        };
        let resource = self.acquired.resource.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = engine.release(resource.clone()).await {
                        tracing::warn!(resource = %resource, error = %e, "Background release failed");
                    }
                });
            }
            Err(_) => tracing::error!(
                resource = %resource,
                "Critical section dropped outside a runtime; resource stays held"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::MutexEngineBuilder;
    use crate::network::local::{LocalNetwork, LocalRouter};
    use crate::state_machine::LockState;
    use std::sync::Arc;

    fn cluster() -> (ResourceManager<LocalNetwork>, MutexEngine<LocalNetwork>) {
        let router = LocalRouter::new();
        let mut engines = Vec::new();
        for (id, peer) in [("P1", "P2"), ("P2", "P1")] {
            let engine = MutexEngineBuilder::new()
                .id(id)
                .peers([peer])
                .with_network(router.network(id))
                .build()
                .unwrap();
            router.register(id.into(), Arc::new(engine.clone()));
            engines.push(engine);
        }
        let p2 = engines.pop().unwrap();
        let p1 = engines.pop().unwrap();
        (ResourceManager::new(p1), p2)
    }

    #[tokio::test]
    async fn test_with_resource_releases_afterwards() {
        let (manager, _p2) = cluster();

        let value = manager
            .with_resource("R", || async {
                assert_eq!(manager.engine().status("R").state, LockState::Held);
                42
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(manager.engine().status("R").state, LockState::Released);
    }

    #[tokio::test]
    async fn test_explicit_release() {
        let (manager, _p2) = cluster();
        let section = manager.lock("R").await.unwrap();
        assert_eq!(section.resource(), &ResourceId::from("R"));
        assert!(section.request_timestamp() > 0);

        section.release().await.unwrap();
        assert_eq!(manager.engine().status("R").state, LockState::Released);
    }

    #[tokio::test]
    async fn test_drop_releases_in_background() {
        let (manager, p2) = cluster();
        let section = manager.lock("R").await.unwrap();
        drop(section);

        // P2 gets in once the spawned release has run.
        p2.acquire_timeout("R", Duration::from_secs(5)).await.unwrap();
        assert_eq!(manager.engine().status("R").state, LockState::Released);
    }
}

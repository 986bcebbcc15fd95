//! Client connection pools.
//!
//! A [`ClientPoolManager`] owns `pool_count` independent [`ClientPool`]s and
//! picks one per calling worker thread, so callers on different threads rarely
//! contend on the same connection. Within a pool there is at most one live
//! connection per endpoint address.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use tracing::debug;
use tramline_core::{Endpoint, NanoClock};

use super::connection::ClientConnection;
use super::error::TransportError;
use crate::config::ClientConfig;

#[derive(Default)]
struct EndpointSlot {
    current: ArcSwapOption<ClientConnection>,
    // Serializes creation so concurrent callers share one connect.
    create: tokio::sync::Mutex<()>,
}

impl EndpointSlot {
    fn working(&self) -> Option<Arc<ClientConnection>> {
        self.current.load_full().filter(|conn| conn.is_working())
    }
}

// ---------------------------------------------------------------------------
// ClientPool
// ---------------------------------------------------------------------------

/// Connections of one worker slot, keyed by endpoint address.
pub struct ClientPool {
    config: Arc<ClientConfig>,
    clock: Arc<dyn NanoClock>,
    slots: DashMap<String, Arc<EndpointSlot>>,
}

impl ClientPool {
    #[must_use]
    pub fn new(config: Arc<ClientConfig>, clock: Arc<dyn NanoClock>) -> Self {
        Self {
            config,
            clock,
            slots: DashMap::new(),
        }
    }

    /// Returns the working connection to `endpoint`, connecting (and logging
    /// in) if there is none. A disconnected connection is replaced.
    ///
    /// # Errors
    ///
    /// Propagates the connect or login failure.
    pub async fn find_or_create(
        &self,
        endpoint: &Endpoint,
    ) -> Result<Arc<ClientConnection>, TransportError> {
        let slot = Arc::clone(
            self.slots
                .entry(endpoint.address.clone())
                .or_default()
                .value(),
        );
        if let Some(conn) = slot.working() {
            return Ok(conn);
        }

        let _creating = slot.create.lock().await;
        if let Some(conn) = slot.working() {
            return Ok(conn);
        }
        debug!(%endpoint, "opening pooled connection");
        let conn =
            ClientConnection::connect(endpoint.clone(), &self.config, Arc::clone(&self.clock))
                .await?;
        slot.current.store(Some(Arc::clone(&conn)));
        Ok(conn)
    }

    /// Live connections, for the timeout sweeper.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<ClientConnection>> {
        self.slots
            .iter()
            .filter_map(|slot| slot.current.load_full())
            .collect()
    }

    /// Drops disconnected connections. Returns how many were removed.
    pub fn evict_disconnected(&self) -> usize {
        let mut evicted = 0;
        for slot in self.slots.iter() {
            let dead = slot
                .current
                .load_full()
                .is_some_and(|conn| !conn.is_working());
            if dead {
                slot.current.store(None);
                evicted += 1;
            }
        }
        evicted
    }

    /// Closes every connection.
    pub fn close(&self) {
        for slot in self.slots.iter() {
            if let Some(conn) = slot.current.swap(None) {
                conn.close();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ClientPoolManager
// ---------------------------------------------------------------------------

/// Fixed set of pools, one picked per calling thread.
pub struct ClientPoolManager {
    config: Arc<ClientConfig>,
    pools: Vec<ClientPool>,
}

impl ClientPoolManager {
    #[must_use]
    pub fn new(config: ClientConfig, clock: Arc<dyn NanoClock>) -> Self {
        let config = Arc::new(config);
        let pools = (0..config.pool_count.max(1))
            .map(|_| ClientPool::new(Arc::clone(&config), Arc::clone(&clock)))
            .collect();
        Self { config, pools }
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// The pool bound to the current thread.
    #[must_use]
    pub fn current(&self) -> &ClientPool {
        let mut hasher = ahash::AHasher::default();
        std::thread::current().id().hash(&mut hasher);
        #[allow(clippy::cast_possible_truncation)]
        let index = hasher.finish() as usize % self.pools.len();
        &self.pools[index]
    }

    /// # Errors
    ///
    /// Propagates the connect or login failure.
    pub async fn find_or_create(
        &self,
        endpoint: &Endpoint,
    ) -> Result<Arc<ClientConnection>, TransportError> {
        self.current().find_or_create(endpoint).await
    }

    #[must_use]
    pub fn connections(&self) -> Vec<Arc<ClientConnection>> {
        self.pools.iter().flat_map(ClientPool::connections).collect()
    }

    pub fn evict_disconnected(&self) -> usize {
        self.pools.iter().map(ClientPool::evict_disconnected).sum()
    }

    pub fn close(&self) {
        for pool in &self.pools {
            pool.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::net::TcpListener;
    use tramline_core::MonotonicClock;

    use super::*;

    async fn counting_listener() -> (Endpoint, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(socket);
            }
        });
        (Endpoint::new(format!("127.0.0.1:{port}"), false), accepted)
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_connection() {
        let (endpoint, accepted) = counting_listener().await;
        let pool = Arc::new(ClientPool::new(
            Arc::new(ClientConfig::default()),
            Arc::new(MonotonicClock),
        ));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            let endpoint = endpoint.clone();
            tasks.push(tokio::spawn(async move {
                pool.find_or_create(&endpoint).await.unwrap()
            }));
        }
        let mut conns = Vec::new();
        for task in tasks {
            conns.push(task.await.unwrap());
        }
        assert!(conns.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_connection_is_replaced() {
        let (endpoint, accepted) = counting_listener().await;
        let pool = ClientPool::new(Arc::new(ClientConfig::default()), Arc::new(MonotonicClock));
        let first = pool.find_or_create(&endpoint).await.unwrap();
        first.close();
        assert_eq!(pool.evict_disconnected(), 1);
        assert!(pool.connections().is_empty());
        let second = pool.find_or_create(&endpoint).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn manager_picks_a_stable_pool_per_thread() {
        let manager = ClientPoolManager::new(
            ClientConfig {
                pool_count: 3,
                ..ClientConfig::default()
            },
            Arc::new(MonotonicClock),
        );
        assert_eq!(manager.pool_count(), 3);
        let a: *const ClientPool = manager.current();
        let b: *const ClientPool = manager.current();
        assert_eq!(a, b);
    }
}

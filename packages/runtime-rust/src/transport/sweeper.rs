//! Background expiry of requests whose reply never arrived.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::pool::ClientPoolManager;

/// Periodically fails pending requests older than the read timeout and drops
/// disconnected connections from the pools.
pub struct TimeoutSweeper {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TimeoutSweeper {
    /// Spawns the sweep loop. Must be called inside a tokio runtime.
    #[must_use]
    pub fn start(pools: Arc<ClientPoolManager>, interval: Duration, timeout: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        sweep(&pools, timeout);
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });
        Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Stops the loop and waits for it to exit.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for TimeoutSweeper {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// One pass over every pooled connection.
pub fn sweep(pools: &ClientPoolManager, timeout: Duration) -> usize {
    let now = Instant::now();
    let expired: usize = pools
        .connections()
        .iter()
        .map(|conn| conn.check_timeout(now, timeout))
        .sum();
    let evicted = pools.evict_disconnected();
    if expired > 0 || evicted > 0 {
        debug!(expired, evicted, "sweep complete");
    }
    expired
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures_util::StreamExt;
    use tokio::net::TcpListener;
    use tokio_util::codec::Framed;
    use tramline_core::{Endpoint, MonotonicClock};

    use super::*;
    use crate::config::ClientConfig;
    use crate::transport::error::TransportError;
    use crate::transport::framing::FrameCodec;

    #[tokio::test]
    async fn sweeper_expires_unanswered_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, FrameCodec);
            while framed.next().await.is_some() {}
        });

        let pools = Arc::new(ClientPoolManager::new(
            ClientConfig::default(),
            Arc::new(MonotonicClock),
        ));
        let endpoint = Endpoint::new(format!("127.0.0.1:{port}"), false);
        let conn = pools.find_or_create(&endpoint).await.unwrap();
        let pending = conn.send(Bytes::from_static(b"h"), Bytes::new()).await.unwrap();

        let mut sweeper = TimeoutSweeper::start(
            Arc::clone(&pools),
            Duration::from_millis(10),
            Duration::from_millis(30),
        );
        let result = tokio::time::timeout(Duration::from_secs(2), pending.wait())
            .await
            .unwrap();
        assert!(matches!(result, Err(TransportError::RequestTimeout { .. })));
        sweeper.stop().await;
    }
}

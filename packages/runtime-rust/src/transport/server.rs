//! Provider-side TCP server.
//!
//! Lifecycle follows a deferred startup pattern:
//! 1. `new()` stores config without binding
//! 2. `start()` binds the listener and returns the actual port
//! 3. `serve()` accepts connections until the shutdown future resolves, then
//!    drains in-flight requests and closes every connection

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};
use tramline_core::wire::RawFrame;
use tramline_core::Endpoint;

use super::dispatch::{Dispatcher, ServerConnection};
use super::framing::FrameCodec;
use super::lifecycle::{LifecycleState, ServerLifecycle};
use crate::config::ServerConfig;
use crate::service::Engine;

type ConnectionRegistry = DashMap<u64, Arc<ServerConnection>>;

pub struct WireServer {
    config: ServerConfig,
    engine: Arc<Engine>,
    listener: Option<TcpListener>,
    lifecycle: Arc<ServerLifecycle>,
    connections: Arc<ConnectionRegistry>,
}

impl WireServer {
    #[must_use]
    pub fn new(config: ServerConfig, engine: Arc<Engine>) -> Self {
        Self {
            config,
            engine,
            listener: None,
            lifecycle: Arc::new(ServerLifecycle::new()),
            connections: Arc::new(DashMap::new()),
        }
    }

    #[must_use]
    pub fn lifecycle(&self) -> Arc<ServerLifecycle> {
        Arc::clone(&self.lifecycle)
    }

    /// Open connections, shared with the accept loop.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Binds the listener. Port 0 picks a free port.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();
        info!(host = %self.config.host, port, "tramline listener bound");
        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns an error if [`start`](Self::start) was not called first.
    pub async fn serve(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;
        let local = listener.local_addr()?;
        let endpoint = Endpoint::new(
            format!("{}:{}", self.config.host, local.port()),
            self.config.login,
        );
        let dispatcher = Arc::new(Dispatcher::new(
            self.engine,
            Arc::clone(&self.lifecycle),
            endpoint.clone(),
            self.config.allow_map_codec,
        ));
        let lifecycle = self.lifecycle;
        let connections = self.connections;
        let capacity = self.config.outbound_channel_capacity.max(1);
        let next_id = AtomicU64::new(1);

        lifecycle.set_serving();
        info!(%endpoint, "serving");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let id = next_id.fetch_add(1, Ordering::Relaxed);
                        tokio::spawn(run_connection(
                            stream,
                            peer,
                            id,
                            capacity,
                            Arc::clone(&dispatcher),
                            Arc::clone(&lifecycle),
                            Arc::clone(&connections),
                        ));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                () = &mut shutdown => break,
            }
        }
        drop(listener);

        lifecycle.begin_drain();
        info!(
            connections = connections.len(),
            in_flight = lifecycle.in_flight(),
            "draining"
        );
        if lifecycle.wait_for_drain(self.config.drain_timeout).await {
            info!("all in-flight requests drained");
        } else {
            warn!(
                in_flight = lifecycle.in_flight(),
                "drain timeout expired with requests still running"
            );
        }
        Ok(())
    }
}

async fn run_connection(
    stream: TcpStream,
    peer: SocketAddr,
    id: u64,
    capacity: usize,
    dispatcher: Arc<Dispatcher>,
    lifecycle: Arc<ServerLifecycle>,
    connections: Arc<ConnectionRegistry>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(conn = id, error = %e, "set_nodelay failed");
    }
    let (read_half, write_half) = stream.into_split();
    let (outbound, mut outbound_rx) = mpsc::channel::<RawFrame>(capacity);
    let conn = Arc::new(ServerConnection::new(id, peer, outbound));
    connections.insert(id, Arc::clone(&conn));
    debug!(conn = id, %peer, "connection accepted");

    // Ends once every sender is gone, after flushing queued replies.
    let writer = tokio::spawn(async move {
        let mut sink = FramedWrite::new(write_half, FrameCodec);
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                warn!(conn = id, error = %e, "write failed");
                break;
            }
        }
    });

    let mut frames = FramedRead::new(read_half, FrameCodec);
    let mut changes = lifecycle.subscribe();
    let clock = Arc::clone(dispatcher.clock());
    loop {
        tokio::select! {
            next = frames.next() => match next {
                Some(Ok(frame)) => {
                    let received = clock.nano_time();
                    dispatcher.dispatch(&conn, frame, received).await;
                }
                Some(Err(e)) => {
                    warn!(conn = id, %peer, error = %e, "malformed frame, closing connection");
                    break;
                }
                None => break,
            },
            changed = changes.changed() => {
                if changed.is_err() || *changes.borrow() == LifecycleState::Stopped {
                    break;
                }
            }
        }
    }

    connections.remove(&id);
    drop(conn);
    if let Err(e) = writer.await {
        debug!(conn = id, error = %e, "writer task ended abnormally");
    }
    debug!(conn = id, %peer, "connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn engine() -> Arc<Engine> {
        Engine::builder(EngineConfig::default()).build()
    }

    #[test]
    fn new_creates_server_without_binding() {
        let server = WireServer::new(ServerConfig::default(), engine());
        assert!(server.listener.is_none());
        assert_eq!(server.lifecycle().state(), LifecycleState::Starting);
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let mut server = WireServer::new(ServerConfig::default(), engine());
        let port = server.start().await.unwrap();
        assert!(port > 0);
        assert!(server.listener.is_some());
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let server = WireServer::new(ServerConfig::default(), engine());
        assert!(server.serve(std::future::pending::<()>()).await.is_err());
    }

    #[tokio::test]
    async fn shutdown_future_stops_serving() {
        let mut server = WireServer::new(ServerConfig::default(), engine());
        server.start().await.unwrap();
        let lifecycle = server.lifecycle();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let serving = tokio::spawn(server.serve(async move {
            let _ = rx.await;
        }));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(lifecycle.state(), LifecycleState::Serving);
        tx.send(()).unwrap();
        serving.await.unwrap().unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    }
}

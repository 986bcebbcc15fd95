//! One client-side TCP connection with message-id correlation.
//!
//! Every connection runs two tasks: a writer draining a bounded outbound
//! channel into the socket (backpressure for callers), and a reader that
//! decodes reply frames and completes the pending request with the same
//! message id. Neither task ever runs business code.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};
use tramline_core::wire::frame::MAX_FRAME_LEN;
use tramline_core::wire::{
    decode_header, decode_login, encode_header, LoginRequest, LoginResponse, MsgType, RawFrame,
    RequestHeader, ResponseHeader, WireFormat,
};
use tramline_core::{Endpoint, NanoClock, ProtocolError};

use super::error::TransportError;
use super::framing::FrameCodec;
use crate::config::ClientConfig;

// ---------------------------------------------------------------------------
// ConnectionStatus
// ---------------------------------------------------------------------------

/// Client connection state machine:
/// Connecting -> TryLogin -> Working -> Disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionStatus {
    Connecting = 0,
    TryLogin = 1,
    Working = 2,
    Disconnected = 3,
}

impl ConnectionStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Connecting,
            1 => Self::TryLogin,
            2 => Self::Working,
            _ => Self::Disconnected,
        }
    }
}

// ---------------------------------------------------------------------------
// Pending requests
// ---------------------------------------------------------------------------

/// A decoded reply, plus when the reader task saw it.
#[derive(Debug)]
pub struct ReceivedFrame {
    pub header: ResponseHeader,
    pub body: Bytes,
    /// Clock reading at arrival, for the stage trace.
    pub received_at: u64,
}

type ReplyResult = Result<ReceivedFrame, TransportError>;

struct Pending {
    tx: oneshot::Sender<ReplyResult>,
    sent_at: Instant,
}

/// Handle to one in-flight request.
#[derive(Debug)]
pub struct PendingReply {
    msg_id: u64,
    rx: oneshot::Receiver<ReplyResult>,
}

impl PendingReply {
    #[must_use]
    pub fn msg_id(&self) -> u64 {
        self.msg_id
    }

    /// Waits for the correlated reply.
    ///
    /// # Errors
    ///
    /// Returns the transport error the reply was completed with, or
    /// [`TransportError::Disconnected`] if the connection went away first.
    pub async fn wait(self) -> ReplyResult {
        self.rx.await.map_err(|_| TransportError::Disconnected)?
    }
}

// ---------------------------------------------------------------------------
// ClientConnection
// ---------------------------------------------------------------------------

pub struct ClientConnection {
    endpoint: Endpoint,
    status: AtomicU8,
    next_msg_id: parking_lot::Mutex<u64>,
    pending: DashMap<u64, Pending>,
    outbound: mpsc::Sender<RawFrame>,
    format: OnceLock<WireFormat>,
    closed: watch::Sender<bool>,
    clock: Arc<dyn NanoClock>,
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("endpoint", &self.endpoint)
            .field("status", &self.status())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl ClientConnection {
    /// Opens a connection to `endpoint`, logging in when both sides support it.
    ///
    /// # Errors
    ///
    /// Returns a connect, login or timeout error. A failed login closes the
    /// socket.
    pub async fn connect(
        endpoint: Endpoint,
        config: &ClientConfig,
        clock: Arc<dyn NanoClock>,
    ) -> Result<Arc<Self>, TransportError> {
        let address = endpoint.address.clone();
        let connecting = TcpStream::connect(&address);
        let stream = match tokio::time::timeout(config.connect_timeout, connecting).await {
            Err(_) => return Err(TransportError::ConnectTimeout { address }),
            Ok(Err(source)) => return Err(TransportError::Connect { address, source }),
            Ok(Ok(stream)) => stream,
        };
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let (outbound, mut outbound_rx) =
            mpsc::channel::<RawFrame>(config.outbound_channel_capacity.max(1));
        let (closed, mut closed_rx) = watch::channel(false);
        let conn = Arc::new(Self {
            endpoint,
            status: AtomicU8::new(ConnectionStatus::Connecting as u8),
            next_msg_id: parking_lot::Mutex::new(1),
            pending: DashMap::new(),
            outbound,
            format: OnceLock::new(),
            closed,
            clock,
        });

        let writer_conn = Arc::clone(&conn);
        let mut writer_closed = conn.closed.subscribe();
        tokio::spawn(async move {
            let mut sink = FramedWrite::new(write_half, FrameCodec);
            loop {
                tokio::select! {
                    next = outbound_rx.recv() => {
                        let Some(frame) = next else { break };
                        if let Err(e) = sink.send(frame).await {
                            warn!(endpoint = %writer_conn.endpoint, error = %e, "write failed");
                            break;
                        }
                    }
                    _ = writer_closed.changed() => break,
                }
            }
            writer_conn.on_disconnect();
        });

        let reader_conn = Arc::clone(&conn);
        tokio::spawn(async move {
            let mut frames = FramedRead::new(read_half, FrameCodec);
            loop {
                tokio::select! {
                    next = frames.next() => match next {
                        Some(Ok(frame)) => reader_conn.on_frame(frame),
                        Some(Err(e)) => {
                            warn!(endpoint = %reader_conn.endpoint, error = %e, "read failed");
                            break;
                        }
                        None => break,
                    },
                    _ = closed_rx.changed() => break,
                }
            }
            reader_conn.on_disconnect();
        });

        if config.login && conn.endpoint.login {
            conn.set_status(ConnectionStatus::TryLogin);
            if let Err(e) = conn.login(config).await {
                conn.close();
                return Err(e);
            }
        }
        conn.set_status(ConnectionStatus::Working);
        info!(endpoint = %conn.endpoint, format = conn.format().as_str(), "connection ready");
        Ok(conn)
    }

    async fn login(&self, config: &ClientConfig) -> Result<(), TransportError> {
        let header = encode_header(&RequestHeader::login())?;
        let body = encode_header(&LoginRequest::new(config.request_map_codec))?;
        let reply = self.send(header, body).await?;
        let msg_id = reply.msg_id();
        let frame = match tokio::time::timeout(config.login_timeout, reply.wait()).await {
            Ok(frame) => frame?,
            Err(_) => {
                self.pending.remove(&msg_id);
                return Err(TransportError::LoginTimeout);
            }
        };
        if frame.header.msg_type != MsgType::LoginResponse {
            return Err(ProtocolError::UnexpectedMsgType {
                expected: MsgType::LoginResponse.as_str(),
                actual: frame.header.msg_type.into(),
            }
            .into());
        }
        if !frame.header.is_success() {
            return Err(TransportError::Login(frame.header.reason));
        }
        let granted: LoginResponse = decode_login(&frame.body)?;
        let _ = self.format.set(granted.format());
        debug!(endpoint = %self.endpoint, map_codec = granted.use_map_codec, "login accepted");
        Ok(())
    }

    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: ConnectionStatus) {
        // Disconnected is terminal.
        let _ = self
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != ConnectionStatus::Disconnected as u8).then_some(status as u8)
            });
    }

    #[must_use]
    pub fn is_working(&self) -> bool {
        self.status() == ConnectionStatus::Working
    }

    /// Argument encoding granted at login, compact without one.
    #[must_use]
    pub fn format(&self) -> WireFormat {
        self.format.get().copied().unwrap_or_default()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Queues a frame and registers its reply slot.
    ///
    /// Message ids are assigned in the order frames enter the outbound
    /// channel, so they increase strictly along the wire.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Disconnected`] if the connection is gone, or a
    /// protocol error for an oversized frame.
    pub async fn send(&self, header: Bytes, body: Bytes) -> Result<PendingReply, TransportError> {
        if self.status() == ConnectionStatus::Disconnected {
            return Err(TransportError::Disconnected);
        }
        let len = header.len() + body.len();
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: MAX_FRAME_LEN,
            }
            .into());
        }
        let permit = self
            .outbound
            .reserve()
            .await
            .map_err(|_| TransportError::Disconnected)?;
        let (tx, rx) = oneshot::channel();
        let msg_id = {
            let mut next = self.next_msg_id.lock();
            let msg_id = *next;
            *next += 1;
            self.pending.insert(
                msg_id,
                Pending {
                    tx,
                    sent_at: Instant::now(),
                },
            );
            permit.send(RawFrame::new(msg_id, header, body));
            msg_id
        };
        // Raced with a disconnect that already drained the pending map.
        if self.status() == ConnectionStatus::Disconnected && self.pending.remove(&msg_id).is_some()
        {
            return Err(TransportError::Disconnected);
        }
        Ok(PendingReply { msg_id, rx })
    }

    fn on_frame(&self, frame: RawFrame) {
        let received_at = self.clock.nano_time();
        let msg_id = frame.msg_id;
        let Some((_, pending)) = self.pending.remove(&msg_id) else {
            debug!(endpoint = %self.endpoint, msg_id, "reply for unknown or expired request");
            return;
        };
        let reply = match decode_header::<ResponseHeader>(&frame.header) {
            Ok(header) => Ok(ReceivedFrame {
                header,
                body: frame.body,
                received_at,
            }),
            Err(e) => {
                warn!(endpoint = %self.endpoint, msg_id, error = %e, "undecodable reply header");
                Err(e.into())
            }
        };
        let _ = pending.tx.send(reply);
    }

    fn fail_all(&self, err: impl Fn(u64) -> TransportError) -> usize {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for msg_id in ids {
            if let Some((_, pending)) = self.pending.remove(&msg_id) {
                let _ = pending.tx.send(Err(err(msg_id)));
                failed += 1;
            }
        }
        failed
    }

    fn on_disconnect(&self) {
        let previous = self
            .status
            .swap(ConnectionStatus::Disconnected as u8, Ordering::AcqRel);
        let failed = self.fail_all(|_| TransportError::Disconnected);
        if previous != ConnectionStatus::Disconnected as u8 {
            info!(endpoint = %self.endpoint, failed, "connection closed");
        }
        let _ = self.closed.send(true);
    }

    /// Closes the socket and fails every pending request.
    pub fn close(&self) {
        self.on_disconnect();
    }

    /// Expires requests waiting longer than `timeout`, completing each with
    /// [`TransportError::RequestTimeout`]. Returns how many expired.
    pub fn check_timeout(&self, now: Instant, timeout: Duration) -> usize {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.sent_at) >= timeout)
            .map(|entry| *entry.key())
            .collect();
        let mut count = 0;
        for msg_id in expired {
            if let Some((_, pending)) = self.pending.remove(&msg_id) {
                let _ = pending.tx.send(Err(TransportError::RequestTimeout { msg_id }));
                count += 1;
            }
        }
        if count > 0 {
            warn!(endpoint = %self.endpoint, count, "requests timed out");
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use tokio_util::codec::Framed;
    use tramline_core::MonotonicClock;

    use super::*;

    async fn listener() -> (TcpListener, Endpoint) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, Endpoint::new(format!("127.0.0.1:{port}"), false))
    }

    async fn connect(endpoint: Endpoint) -> Result<Arc<ClientConnection>, TransportError> {
        ClientConnection::connect(endpoint, &ClientConfig::default(), Arc::new(MonotonicClock)).await
    }

    fn reply(msg_id: u64, reason: &str) -> RawFrame {
        let header = encode_header(&ResponseHeader::response(200, reason)).unwrap();
        RawFrame::new(msg_id, header, Bytes::new())
    }

    #[tokio::test]
    async fn replies_are_matched_by_msg_id() {
        let (listener, endpoint) = listener().await;
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, FrameCodec);
            let mut ids = Vec::new();
            for _ in 0..3 {
                ids.push(framed.next().await.unwrap().unwrap().msg_id);
            }
            // Reply in reverse order.
            for id in ids.into_iter().rev() {
                framed.send(reply(id, &format!("r{id}"))).await.unwrap();
            }
            let _ = framed.next().await;
        });

        let conn = connect(endpoint).await.unwrap();
        let mut replies = Vec::new();
        for _ in 0..3 {
            replies.push(conn.send(Bytes::from_static(b"h"), Bytes::new()).await.unwrap());
        }
        let ids: Vec<u64> = replies.iter().map(PendingReply::msg_id).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        for pending in replies {
            let id = pending.msg_id();
            let frame = pending.wait().await.unwrap();
            assert_eq!(frame.header.reason, format!("r{id}"));
            assert!(frame.received_at > 0);
        }
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn disconnect_fails_pending_requests() {
        let (listener, endpoint) = listener().await;
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, FrameCodec);
            let _ = framed.next().await;
            // Dropping the socket closes the connection without a reply.
        });

        let conn = connect(endpoint).await.unwrap();
        let pending = conn.send(Bytes::from_static(b"h"), Bytes::new()).await.unwrap();
        assert!(matches!(pending.wait().await, Err(TransportError::Disconnected)));
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
        assert!(conn.send(Bytes::from_static(b"h"), Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn stale_requests_expire() {
        let (listener, endpoint) = listener().await;
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, FrameCodec);
            while framed.next().await.is_some() {}
        });

        let conn = connect(endpoint).await.unwrap();
        let pending = conn.send(Bytes::from_static(b"h"), Bytes::new()).await.unwrap();
        let msg_id = pending.msg_id();
        assert_eq!(conn.check_timeout(Instant::now(), Duration::from_secs(60)), 0);
        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(conn.check_timeout(later, Duration::from_secs(60)), 1);
        assert!(matches!(
            pending.wait().await,
            Err(TransportError::RequestTimeout { msg_id: id }) if id == msg_id
        ));
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let (listener, endpoint) = listener().await;
        drop(listener);
        let err = connect(endpoint).await.unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }
}

//! Server-side handling of one inbound frame.
//!
//! Every frame moves through
//! `Received -> Decoded -> Resolved -> Queued -> Executing -> Responded -> Terminal`.
//! The steps up to `Queued` run on the connection's reader task; from
//! `Executing` on, work happens on the operation's executor. Failures before
//! the record exists are answered directly, except an undecodable header,
//! which has no reliable message type and is dropped.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use tramline_core::wire::message::ZIP_NONE;
use tramline_core::wire::{
    decode_header, decode_login, encode_header, LoginRequest, LoginResponse, MsgType, RawFrame,
    RequestHeader, ResponseHeader, WireFormat, PROTOCOL_NAME,
};
use tramline_core::{
    Endpoint, Invocation, InvocationContext, InvocationError, LocalKey, LocalValue, NanoClock,
    ProtocolError, Response,
};

use super::codec::encode_response;
use super::error::TransportError;
use super::lifecycle::ServerLifecycle;
use crate::service::{Engine, OperationExecutor, ResponseSender, StartTimes};

/// Progress of one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Received,
    Decoded,
    Resolved,
    Queued,
    Executing,
    Responded,
    Terminal,
}

// ---------------------------------------------------------------------------
// ServerConnection
// ---------------------------------------------------------------------------

/// Server half of one accepted socket.
#[derive(Debug)]
pub struct ServerConnection {
    id: u64,
    peer: SocketAddr,
    format: parking_lot::RwLock<WireFormat>,
    outbound: mpsc::Sender<RawFrame>,
}

impl ServerConnection {
    #[must_use]
    pub fn new(id: u64, peer: SocketAddr, outbound: mpsc::Sender<RawFrame>) -> Self {
        Self {
            id,
            peer,
            format: parking_lot::RwLock::new(WireFormat::Compact),
            outbound,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Argument encoding granted at login. Compact until then.
    #[must_use]
    pub fn format(&self) -> WireFormat {
        *self.format.read()
    }

    fn set_format(&self, format: WireFormat) {
        *self.format.write() = format;
    }

    /// Queues a frame for the connection's writer task.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] once the writer has gone.
    pub async fn send(&self, frame: RawFrame) -> Result<(), TransportError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn reply(
        &self,
        msg_id: u64,
        context: Option<&InvocationContext>,
        response: &Response,
    ) -> Result<(), TransportError> {
        let (header, body) = match encode_response(context, response) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(conn = self.id, msg_id, error = %e, "response not encodable, sending failure");
                encode_response(
                    context,
                    &Response::failure(InvocationError::producer_fail(
                        "response could not be encoded",
                    )),
                )?
            }
        };
        self.send(RawFrame::new(msg_id, header, body)).await
    }
}

/// Sends the provider response back on the connection the request came in on.
struct ConnectionResponder {
    conn: Arc<ServerConnection>,
    msg_id: u64,
}

#[async_trait]
impl ResponseSender for ConnectionResponder {
    async fn send_response(
        &mut self,
        invocation: Option<&Invocation>,
        response: &Response,
    ) -> anyhow::Result<()> {
        self.conn
            .reply(self.msg_id, invocation.map(Invocation::context), response)
            .await?;
        trace!(conn = self.conn.id, msg_id = self.msg_id, state = ?DispatchState::Responded);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Routes inbound frames of every connection of one server.
pub struct Dispatcher {
    engine: Arc<Engine>,
    lifecycle: Arc<ServerLifecycle>,
    endpoint: Endpoint,
    allow_map_codec: bool,
}

impl Dispatcher {
    /// `endpoint` is the server's own published address, recorded on every
    /// provider invocation.
    #[must_use]
    pub fn new(
        engine: Arc<Engine>,
        lifecycle: Arc<ServerLifecycle>,
        endpoint: Endpoint,
        allow_map_codec: bool,
    ) -> Self {
        Self {
            engine,
            lifecycle,
            endpoint,
            allow_map_codec,
        }
    }

    /// Clock used to stamp frame arrival.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn NanoClock> {
        self.engine.factory().clock()
    }

    /// Handles one frame that arrived at `received` (engine clock nanos).
    ///
    /// Returns the state reached on the calling task: `Queued` when the request
    /// was handed to an executor, `Responded` when it was answered directly and
    /// `Received` when it was dropped.
    pub async fn dispatch(
        &self,
        conn: &Arc<ServerConnection>,
        frame: RawFrame,
        received: u64,
    ) -> DispatchState {
        let header: RequestHeader = match decode_header(&frame.header) {
            Ok(header) => header,
            Err(e) => {
                warn!(conn = conn.id, peer = %conn.peer, msg_id = frame.msg_id, error = %e,
                    "undecodable request header, dropping frame");
                return DispatchState::Received;
            }
        };
        match header.msg_type {
            MsgType::Login => self.login(conn, frame.msg_id, &frame.body).await,
            MsgType::Request => self.request(conn, header, frame, received).await,
            other => {
                warn!(conn = conn.id, msg_id = frame.msg_id, msg_type = other.as_str(),
                    "unexpected message type from client, dropping frame");
                DispatchState::Received
            }
        }
    }

    async fn login(&self, conn: &Arc<ServerConnection>, msg_id: u64, body: &[u8]) -> DispatchState {
        let mut header = ResponseHeader::login_response();
        let granted = match decode_login::<LoginRequest>(body) {
            Ok(request) if request.protocol == PROTOCOL_NAME => {
                let use_map_codec = request.use_map_codec && self.allow_map_codec;
                conn.set_format(if use_map_codec {
                    WireFormat::Named
                } else {
                    WireFormat::Compact
                });
                debug!(conn = conn.id, peer = %conn.peer, map_codec = use_map_codec, "login accepted");
                use_map_codec
            }
            Ok(request) => {
                warn!(conn = conn.id, protocol = %request.protocol, "login with unsupported protocol");
                header.status_code = 400;
                header.reason = format!("unsupported protocol {}", request.protocol);
                false
            }
            Err(e) => {
                warn!(conn = conn.id, error = %e, "undecodable login body");
                header.status_code = 400;
                header.reason = "malformed login".to_string();
                false
            }
        };
        let response = LoginResponse {
            protocol: PROTOCOL_NAME.to_string(),
            zip_name: ZIP_NONE.to_string(),
            use_map_codec: granted,
        };
        let sent = encode_login_reply(&header, &response);
        match sent {
            Ok((header, body)) => {
                if let Err(e) = conn.send(RawFrame::new(msg_id, header, body)).await {
                    debug!(conn = conn.id, error = %e, "connection closed before login reply");
                }
            }
            Err(e) => warn!(conn = conn.id, error = %e, "login reply not encodable"),
        }
        DispatchState::Responded
    }

    async fn reply_now(&self, conn: &ServerConnection, msg_id: u64, err: InvocationError) -> DispatchState {
        debug!(conn = conn.id, msg_id, status = err.status.as_u16(), message = %err.message,
            "request rejected before execution");
        if let Err(e) = conn.reply(msg_id, None, &Response::failure(err)).await {
            debug!(conn = conn.id, error = %e, "connection closed before reply");
        }
        DispatchState::Responded
    }

    async fn request(
        &self,
        conn: &Arc<ServerConnection>,
        header: RequestHeader,
        frame: RawFrame,
        received: u64,
    ) -> DispatchState {
        let msg_id = frame.msg_id;
        trace!(conn = conn.id, msg_id, state = ?DispatchState::Decoded);
        if !self.lifecycle.state().admits_requests() {
            return self
                .reply_now(conn, msg_id, InvocationError::service_unavailable("server is draining"))
                .await;
        }

        let operation = match self.engine.operations().resolve(
            &header.dest_microservice,
            &header.schema_id,
            &header.operation_name,
        ) {
            Ok(operation) => operation,
            Err(e) => return self.reply_now(conn, msg_id, e.into()).await,
        };
        trace!(conn = conn.id, msg_id, operation = %operation.meta.op_ref(), state = ?DispatchState::Resolved);

        let executor = self.engine.executors().get(operation.meta.executor());
        let reactive = matches!(*executor, OperationExecutor::Reactive);
        let clock = Arc::clone(self.engine.factory().clock());
        let scheduled = if reactive { 0 } else { clock.nano_time() };
        // Captured now so a later login cannot change how this body decodes.
        let format = conn.format();
        let admitted = self.lifecycle.admit();
        let engine = Arc::clone(&self.engine);
        let endpoint = self.endpoint.clone();
        let mut responder = ConnectionResponder {
            conn: Arc::clone(conn),
            msg_id,
        };
        let body: Bytes = frame.body;
        let uri = format!(
            "{}/{}/{}",
            header.dest_microservice, header.schema_id, header.operation_name
        );
        let context = header.context;

        executor.execute(async move {
            let _admitted = admitted;
            let executed = if reactive { 0 } else { clock.nano_time() };
            trace!(conn = responder.conn.id, msg_id, state = ?DispatchState::Executing);
            let times = StartTimes {
                received,
                scheduled,
                executed,
            };
            let create = || {
                let args = format
                    .decode_args(operation.meta.params(), &body)
                    .map_err(|e| InvocationError::bad_request(format!("undecodable arguments: {e}")))?;
                let mut invocation =
                    engine
                        .factory()
                        .for_provider(endpoint, Arc::clone(&operation.meta), args);
                invocation.merge_context(context);
                invocation
                    .local_mut()
                    .insert(LocalKey::RequestUri, LocalValue::Text(uri));
                Ok(invocation)
            };
            engine.flow().run_provider(times, create, &mut responder).await;
            trace!(conn = responder.conn.id, msg_id, state = ?DispatchState::Terminal);
        });
        DispatchState::Queued
    }
}

fn encode_login_reply(
    header: &ResponseHeader,
    response: &LoginResponse,
) -> Result<(Bytes, Bytes), ProtocolError> {
    Ok((encode_header(header)?, encode_header(response)?))
}

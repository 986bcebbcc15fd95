//! Consumer-side transport over pooled TCP connections.

use std::sync::Arc;

use async_trait::async_trait;
use tramline_core::{Invocation, InvocationError, NanoClock, Response};

use super::codec::{decode_response, encode_request, merge_response_context};
use super::error::TransportError;
use super::pool::ClientPoolManager;
use super::sweeper::TimeoutSweeper;
use crate::config::ClientConfig;
use crate::service::Transport;

/// Where an outbound call went on the wire, attached to the invocation as its
/// transport context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireCallInfo {
    pub address: String,
    pub msg_id: u64,
}

/// [`Transport`] sending invocations as REQUEST frames.
pub struct WireClient {
    pools: Arc<ClientPoolManager>,
    sweeper: parking_lot::Mutex<Option<TimeoutSweeper>>,
}

impl WireClient {
    /// Creates the pools and starts the request timeout sweeper. Must be called
    /// inside a tokio runtime.
    #[must_use]
    pub fn start(config: ClientConfig, clock: Arc<dyn NanoClock>) -> Self {
        let interval = config.sweep_interval;
        let timeout = config.request_timeout;
        let pools = Arc::new(ClientPoolManager::new(config, clock));
        let sweeper = TimeoutSweeper::start(Arc::clone(&pools), interval, timeout);
        Self {
            pools,
            sweeper: parking_lot::Mutex::new(Some(sweeper)),
        }
    }

    #[must_use]
    pub fn pools(&self) -> &Arc<ClientPoolManager> {
        &self.pools
    }

    /// Stops the sweeper and closes every pooled connection. Pending requests
    /// fail with a disconnect.
    pub async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(mut sweeper) = sweeper {
            sweeper.stop().await;
        }
        self.pools.close();
    }

    async fn exchange(&self, invocation: &mut Invocation) -> Result<Response, TransportError> {
        let Some(endpoint) = invocation.endpoint().cloned() else {
            return Ok(Response::failure(InvocationError::consumer_fail(
                "invocation has no endpoint",
            )));
        };

        invocation.trace_mut().start_get_connection();
        let conn = self.pools.find_or_create(&endpoint).await;
        invocation.trace_mut().finish_get_connection();
        let conn = conn?;

        invocation.trace_mut().start_send();
        let (header, body) = encode_request(invocation, conn.format())?;
        let pending = conn.send(header, body).await?;
        // Stamped once the frame is queued for the writer task.
        invocation.trace_mut().finish_write_to_buffer();
        invocation.set_transport_context(WireCallInfo {
            address: endpoint.address.clone(),
            msg_id: pending.msg_id(),
        });

        let frame = pending.wait().await?;
        invocation
            .trace_mut()
            .finish_receive_response_at(frame.received_at);

        invocation.trace_mut().start_filters_response();
        let response = decode_response(&frame.header, &frame.body);
        merge_response_context(invocation, &frame.header);
        invocation.trace_mut().finish_filters_response();
        Ok(response?)
    }
}

#[async_trait]
impl Transport for WireClient {
    fn name(&self) -> &'static str {
        "tramline"
    }

    async fn send(&self, invocation: &mut Invocation) -> Response {
        match self.exchange(invocation).await {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(
                    operation = %invocation.qualified_name(),
                    error = %err,
                    "wire call failed"
                );
                Response::failure(err.to_invocation_error())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{SinkExt, StreamExt};
    use http::StatusCode;
    use tokio::net::TcpListener;
    use tokio_util::codec::Framed;
    use tramline_core::wire::{decode_header, encode_header, RawFrame, RequestHeader, ResponseHeader};
    use tramline_core::{
        Endpoint, InvocationFactory, MonotonicClock, OperationMeta, OperationRef, ReferenceConfig,
    };

    use super::*;
    use crate::transport::framing::FrameCodec;

    fn invocation(endpoint: Endpoint) -> Invocation {
        let factory = InvocationFactory::new("caller", Arc::new(MonotonicClock));
        let meta = OperationMeta::new(OperationRef::new("orders", "Orders", "get"));
        let mut inv = factory.for_consumer(
            ReferenceConfig::new("app", "orders", "0+"),
            Arc::new(meta),
            Vec::new(),
        );
        let now = inv.trace().now();
        inv.on_start(now);
        inv.set_endpoint(endpoint);
        inv
    }

    #[tokio::test]
    async fn reply_is_decoded_and_stages_stamped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, FrameCodec);
            while let Some(Ok(frame)) = framed.next().await {
                let request: RequestHeader = decode_header(&frame.header).unwrap();
                let header = ResponseHeader::response(409, request.operation_name);
                let reply = RawFrame::new(frame.msg_id, encode_header(&header).unwrap(), Vec::new());
                framed.send(reply).await.unwrap();
            }
        });

        let client = WireClient::start(ClientConfig::default(), Arc::new(MonotonicClock));
        let mut inv = invocation(Endpoint::new(format!("127.0.0.1:{port}"), false));
        let response = client.send(&mut inv).await;
        let err = response.error().unwrap();
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.message, "get");
        let info = inv.transport_context::<WireCallInfo>().unwrap();
        assert_eq!(info.msg_id, 1);
        assert!(inv.trace().calc_get_connection() >= 0.0);
        assert!(inv.trace().calc_wait() >= 0.0);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_consumer_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = WireClient::start(ClientConfig::default(), Arc::new(MonotonicClock));
        let mut inv = invocation(Endpoint::new(format!("127.0.0.1:{port}"), false));
        let response = client.send(&mut inv).await;
        assert_eq!(
            response.error().unwrap().status,
            tramline_core::error::consumer_fail_status()
        );
        client.shutdown().await;
    }
}

//! Terminal consumer handler: sends the request over the active transport.

use std::sync::Arc;

use async_trait::async_trait;
use tramline_core::{Invocation, InvocationError, Response};

use super::{Handler, Next};
use crate::service::timeout::TimeoutGuard;

/// Delivers a consumer invocation to its endpoint and waits for the reply.
///
/// Implementations never fail with an error: transport problems are local
/// failure responses.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, invocation: &mut Invocation) -> Response;
}

pub struct TransportHandler {
    transport: Arc<dyn Transport>,
    guard: Arc<TimeoutGuard>,
}

impl TransportHandler {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, guard: Arc<TimeoutGuard>) -> Self {
        Self { transport, guard }
    }
}

#[async_trait]
impl Handler for TransportHandler {
    fn name(&self) -> &'static str {
        "transport"
    }

    async fn handle(&self, invocation: &mut Invocation, _next: Next<'_>) -> Response {
        invocation.trace_mut().start_filters_request();
        if invocation.endpoint().is_none() {
            return Response::failure(InvocationError::consumer_fail(format!(
                "no endpoint for {}",
                invocation.qualified_name()
            )));
        }
        if let Err(err) = self.guard.before_send_request(invocation) {
            return Response::failure(err);
        }
        self.transport.send(invocation).await
    }
}

#[cfg(test)]
mod tests {
    use tramline_core::context::keys;
    use tramline_core::{
        Endpoint, InvocationFactory, ManualClock, OperationMeta, OperationRef, ReferenceConfig,
    };

    use super::*;
    use crate::service::handler::HandlerChain;
    use crate::service::timeout::ProcessingTimeStrategy;

    struct Loopback;

    #[async_trait]
    impl Transport for Loopback {
        fn name(&self) -> &'static str {
            "loopback"
        }

        async fn send(&self, invocation: &mut Invocation) -> Response {
            Response::ok(
                invocation
                    .context_value(keys::ELAPSED_NANOS)
                    .map(rmpv::Value::from),
            )
        }
    }

    #[tokio::test]
    async fn budget_is_serialized_before_send() {
        let guard = Arc::new(TimeoutGuard::new(true, Arc::new(ProcessingTimeStrategy)));
        let chain = HandlerChain::new(
            vec![Arc::new(TransportHandler::new(Arc::new(Loopback), Arc::clone(&guard)))],
            guard,
        );
        let factory = InvocationFactory::new("caller", Arc::new(ManualClock::default()));
        let mut inv = factory.for_consumer(
            ReferenceConfig::new("app", "orders", "0+"),
            Arc::new(OperationMeta::new(OperationRef::new("orders", "S", "op"))),
            Vec::new(),
        );
        inv.set_endpoint(Endpoint::new("127.0.0.1:1", false));
        inv.on_start(inv.trace().now());
        let response = chain.run(&mut inv).await;
        assert_eq!(response.into_result().unwrap(), Some(rmpv::Value::from("0")));
    }

    #[tokio::test]
    async fn missing_endpoint_is_local_failure() {
        let guard = Arc::new(TimeoutGuard::new(true, Arc::new(ProcessingTimeStrategy)));
        let chain = HandlerChain::new(
            vec![Arc::new(TransportHandler::new(Arc::new(Loopback), Arc::clone(&guard)))],
            guard,
        );
        let factory = InvocationFactory::new("caller", Arc::new(ManualClock::default()));
        let mut inv = factory.for_consumer(
            ReferenceConfig::new("app", "orders", "0+"),
            Arc::new(OperationMeta::new(OperationRef::new("orders", "S", "op"))),
            Vec::new(),
        );
        let response = chain.run(&mut inv).await;
        assert_eq!(response.status().as_u16(), 490);
    }
}

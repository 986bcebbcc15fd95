//! Ordered, role-specific middleware chain wrapping the business call.
//!
//! A handler either completes the chain early by returning a [`Response`] or
//! delegates with [`Next::run`]. The last handler of a chain is terminal: the
//! provider chain ends in [`ProducerHandler`], the consumer chain in
//! [`TransportHandler`]. A chain runs exactly once to exactly one response.
//!
//! - [`producer`]: invokes the business method
//! - [`discovery`]: resolves the consumer's target endpoint
//! - [`transport`]: sends the request to the resolved endpoint

pub mod discovery;
pub mod producer;
pub mod transport;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tramline_core::{Invocation, InvocationError, InvocationType, Response};

pub use discovery::{DiscoveryHandler, ServiceDiscovery, StaticDiscovery};
pub use producer::ProducerHandler;
pub use transport::{Transport, TransportHandler};

use super::timeout::TimeoutGuard;

/// One stage of a handler chain.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Handles `invocation`, calling `next.run(invocation)` to continue.
    async fn handle(&self, invocation: &mut Invocation, next: Next<'_>) -> Response;
}

/// The remainder of a chain, handed to each handler.
pub struct Next<'a> {
    handlers: &'a [Arc<dyn Handler>],
}

impl Next<'_> {
    /// Runs the next handler. Running past the end of a chain is a
    /// configuration error and yields a provider failure.
    pub async fn run(self, invocation: &mut Invocation) -> Response {
        match self.handlers.split_first() {
            Some((handler, rest)) => handler.handle(invocation, Next { handlers: rest }).await,
            None => Response::failure(InvocationError::producer_fail(format!(
                "handler chain for {} has no terminal handler",
                invocation.qualified_name()
            ))),
        }
    }
}

/// Which side of the call a chain serves. Edge invocations run the consumer
/// chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainKind {
    Consumer,
    Provider,
}

impl From<InvocationType> for ChainKind {
    fn from(kind: InvocationType) -> Self {
        if kind.is_outbound() {
            Self::Consumer
        } else {
            Self::Provider
        }
    }
}

/// An immutable ordered handler list.
#[derive(Clone)]
pub struct HandlerChain {
    handlers: Arc<[Arc<dyn Handler>]>,
    guard: Arc<TimeoutGuard>,
}

impl fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.handlers.iter().map(|h| h.name()))
            .finish()
    }
}

impl HandlerChain {
    #[must_use]
    pub fn new(handlers: Vec<Arc<dyn Handler>>, guard: Arc<TimeoutGuard>) -> Self {
        Self {
            handlers: handlers.into(),
            guard,
        }
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// Single forward pass over the chain.
    pub async fn run(&self, invocation: &mut Invocation) -> Response {
        invocation.trace_mut().start_handlers_request();
        let response = match self.guard.start_handlers(invocation) {
            Ok(()) => {
                Next {
                    handlers: &self.handlers,
                }
                .run(invocation)
                .await
            }
            Err(err) => Response::failure(err),
        };
        invocation.trace_mut().finish_handlers_response();
        response
    }
}

/// Chains resolved once per (microservice, direction) at startup and reused
/// for every call. A chain registered under `"*"` is the fallback for its
/// direction.
#[derive(Debug, Default)]
pub struct HandlerChainRegistry {
    chains: DashMap<(String, ChainKind), HandlerChain>,
}

/// Microservice key of the per-direction fallback chain.
pub const ANY_MICROSERVICE: &str = "*";

impl HandlerChainRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, microservice: impl Into<String>, kind: ChainKind, chain: HandlerChain) {
        self.chains.insert((microservice.into(), kind), chain);
    }

    /// The chain for `microservice`, else the fallback for `kind`.
    #[must_use]
    pub fn resolve(&self, microservice: &str, kind: ChainKind) -> Option<HandlerChain> {
        self.chains
            .get(&(microservice.to_string(), kind))
            .or_else(|| self.chains.get(&(ANY_MICROSERVICE.to_string(), kind)))
            .map(|chain| chain.value().clone())
    }
}

type SinkFn = Box<dyn FnOnce(Response) + Send>;

/// Completion callback handed in by a front end. Invoked exactly once: if it
/// is dropped without completing, it completes itself with a failure.
pub struct ResponseSink {
    callback: Option<SinkFn>,
}

impl fmt::Debug for ResponseSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseSink")
            .field("completed", &self.callback.is_none())
            .finish()
    }
}

impl ResponseSink {
    pub fn new(callback: impl FnOnce(Response) + Send + 'static) -> Self {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    /// Sink backed by a oneshot channel.
    #[must_use]
    pub fn channel() -> (Self, tokio::sync::oneshot::Receiver<Response>) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let sink = Self::new(move |response| {
            let _ = tx.send(response);
        });
        (sink, rx)
    }

    pub fn complete(mut self, response: Response) {
        if let Some(callback) = self.callback.take() {
            callback(response);
        }
    }
}

impl Drop for ResponseSink {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(Response::failure(InvocationError::producer_fail(
                "invocation abandoned before completion",
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tramline_core::{Endpoint, InvocationFactory, ManualClock, OperationMeta, OperationRef};

    use super::*;
    use crate::service::timeout::ProcessingTimeStrategy;

    struct Recording {
        name: &'static str,
        seen: Arc<parking_lot::Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Handler for Recording {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn handle(&self, invocation: &mut Invocation, next: Next<'_>) -> Response {
            self.seen.lock().push(self.name);
            next.run(invocation).await
        }
    }

    struct Reject;

    #[async_trait]
    impl Handler for Reject {
        fn name(&self) -> &'static str {
            "reject"
        }

        async fn handle(&self, _invocation: &mut Invocation, _next: Next<'_>) -> Response {
            Response::failure(InvocationError::bad_request("rejected"))
        }
    }

    struct Terminal(Arc<AtomicUsize>);

    #[async_trait]
    impl Handler for Terminal {
        fn name(&self) -> &'static str {
            "terminal"
        }

        async fn handle(&self, _invocation: &mut Invocation, _next: Next<'_>) -> Response {
            self.0.fetch_add(1, Ordering::SeqCst);
            // Complete from another task.
            let handle = tokio::spawn(async { Response::success(rmpv::Value::from("done")) });
            handle.await.unwrap_or_else(|_| Response::void())
        }
    }

    fn guard() -> Arc<TimeoutGuard> {
        Arc::new(TimeoutGuard::new(true, Arc::new(ProcessingTimeStrategy)))
    }

    fn invocation() -> Invocation {
        let factory = InvocationFactory::new("svc", Arc::new(ManualClock::default()));
        let mut inv = factory.for_provider(
            Endpoint::new("127.0.0.1:1", false),
            Arc::new(OperationMeta::new(OperationRef::new("svc", "S", "op"))),
            Vec::new(),
        );
        inv.on_start(inv.trace().now());
        inv
    }

    #[tokio::test]
    async fn runs_handlers_in_order() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = HandlerChain::new(
            vec![
                Arc::new(Recording { name: "a", seen: seen.clone() }),
                Arc::new(Recording { name: "b", seen: seen.clone() }),
                Arc::new(Terminal(calls.clone())),
            ],
            guard(),
        );
        let mut inv = invocation();
        let response = chain.run(&mut inv).await;
        assert!(response.is_success());
        assert_eq!(*seen.lock(), vec!["a", "b"]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(inv.trace().calc_total().is_nan());
    }

    #[tokio::test]
    async fn short_circuit_skips_rest() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = HandlerChain::new(
            vec![Arc::new(Reject), Arc::new(Terminal(calls.clone()))],
            guard(),
        );
        let response = chain.run(&mut invocation()).await;
        assert_eq!(response.status(), http::StatusCode::BAD_REQUEST);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn chain_without_terminal_fails() {
        let chain = HandlerChain::new(Vec::new(), guard());
        let response = chain.run(&mut invocation()).await;
        assert_eq!(response.status().as_u16(), 590);
    }

    #[test]
    fn registry_falls_back_to_any() {
        let registry = HandlerChainRegistry::new();
        registry.register(
            ANY_MICROSERVICE,
            ChainKind::Consumer,
            HandlerChain::new(vec![Arc::new(Reject)], guard()),
        );
        assert!(registry.resolve("orders", ChainKind::Consumer).is_some());
        assert!(registry.resolve("orders", ChainKind::Provider).is_none());
        assert_eq!(ChainKind::from(InvocationType::Edge), ChainKind::Consumer);
    }

    #[test]
    fn sink_completes_once_even_when_dropped() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let sink = ResponseSink::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        sink.complete(Response::void());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let c = count.clone();
        let dropped = ResponseSink::new(move |response| {
            assert!(!response.is_success());
            c.fetch_add(1, Ordering::SeqCst);
        });
        drop(dropped);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}

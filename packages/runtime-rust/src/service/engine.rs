//! Process-wide runtime: operation registry, executors, handler chains and the
//! flow orchestrator, assembled once at startup.

use std::sync::Arc;

use tracing::info;
use tramline_core::{
    Invocation, InvocationContext, InvocationFactory, MonotonicClock, NanoClock, OperationMeta,
    ReferenceConfig, Response,
};

use super::executor::ExecutorRegistry;
use super::flow::InvocationFlow;
use super::handler::{
    ChainKind, DiscoveryHandler, Handler, HandlerChain, HandlerChainRegistry, ProducerHandler,
    ResponseSink, ServiceDiscovery, Transport, TransportHandler, ANY_MICROSERVICE,
};
use super::metrics::InvocationMetrics;
use super::operation::{OperationError, OperationRegistry, ProducerMethod};
use super::timeout::TimeoutGuard;
use crate::config::EngineConfig;

// ---------------------------------------------------------------------------
// EngineBuilder
// ---------------------------------------------------------------------------

/// Collects handlers and boundaries, then freezes them into an [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    clock: Arc<dyn NanoClock>,
    provider_handlers: Vec<Arc<dyn Handler>>,
    consumer_handlers: Vec<Arc<dyn Handler>>,
    targeted: Vec<(String, Vec<Arc<dyn Handler>>)>,
    discovery: Option<Arc<dyn ServiceDiscovery>>,
    transport: Option<Arc<dyn Transport>>,
}

impl EngineBuilder {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            clock: Arc::new(MonotonicClock),
            provider_handlers: Vec::new(),
            consumer_handlers: Vec::new(),
            targeted: Vec::new(),
            discovery: None,
            transport: None,
        }
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn NanoClock>) -> Self {
        self.clock = clock;
        self
    }

    /// Adds a handler in front of the producer handler.
    #[must_use]
    pub fn provider_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.provider_handlers.push(handler);
        self
    }

    /// Adds a handler in front of discovery and transport for every target.
    #[must_use]
    pub fn consumer_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.consumer_handlers.push(handler);
        self
    }

    /// Dedicated consumer chain for calls to `microservice`. `handlers` run
    /// after the shared consumer handlers.
    #[must_use]
    pub fn consumer_chain_for(
        mut self,
        microservice: impl Into<String>,
        handlers: Vec<Arc<dyn Handler>>,
    ) -> Self {
        self.targeted.push((microservice.into(), handlers));
        self
    }

    #[must_use]
    pub fn discovery(mut self, discovery: Arc<dyn ServiceDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    fn consumer_chain(
        &self,
        extra: &[Arc<dyn Handler>],
        guard: &Arc<TimeoutGuard>,
    ) -> Option<HandlerChain> {
        let transport = self.transport.as_ref()?;
        let mut handlers = self.consumer_handlers.clone();
        handlers.extend(extra.iter().cloned());
        if let Some(discovery) = &self.discovery {
            handlers.push(Arc::new(DiscoveryHandler::new(Arc::clone(discovery))));
        }
        handlers.push(Arc::new(TransportHandler::new(
            Arc::clone(transport),
            Arc::clone(guard),
        )));
        Some(HandlerChain::new(handlers, Arc::clone(guard)))
    }

    #[must_use]
    pub fn build(self) -> Arc<Engine> {
        let guard = Arc::new(TimeoutGuard::from_config(
            &self.config.timeout,
            Arc::clone(&self.clock),
        ));
        let operations = Arc::new(OperationRegistry::new());
        let chains = Arc::new(HandlerChainRegistry::new());

        let mut provider = self.provider_handlers.clone();
        provider.push(Arc::new(ProducerHandler::new(
            Arc::clone(&operations),
            Arc::clone(&guard),
        )));
        let provider = HandlerChain::new(provider, Arc::clone(&guard));
        info!(
            microservice = %self.config.microservice,
            handlers = ?provider.names(),
            "provider chain ready"
        );
        chains.register(self.config.microservice.clone(), ChainKind::Provider, provider);

        if let Some(chain) = self.consumer_chain(&[], &guard) {
            info!(handlers = ?chain.names(), "consumer chain ready");
            chains.register(ANY_MICROSERVICE, ChainKind::Consumer, chain);
        }
        for (microservice, extra) in &self.targeted {
            if let Some(chain) = self.consumer_chain(extra, &guard) {
                chains.register(microservice.clone(), ChainKind::Consumer, chain);
            }
        }

        let flow = InvocationFlow::new(
            self.config.microservice.clone(),
            Arc::clone(&guard),
            chains,
            InvocationMetrics::new(self.config.slow_invocation_threshold),
        );
        Arc::new(Engine {
            factory: InvocationFactory::new(self.config.microservice.clone(), self.clock),
            executors: ExecutorRegistry::new(&self.config.executors),
            guard,
            operations,
            flow,
            config: self.config,
        })
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Shared by every front end and consumer call of one process.
pub struct Engine {
    config: EngineConfig,
    factory: InvocationFactory,
    guard: Arc<TimeoutGuard>,
    executors: ExecutorRegistry,
    operations: Arc<OperationRegistry>,
    flow: InvocationFlow,
}

impl Engine {
    #[must_use]
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn factory(&self) -> &InvocationFactory {
        &self.factory
    }

    #[must_use]
    pub fn guard(&self) -> &Arc<TimeoutGuard> {
        &self.guard
    }

    #[must_use]
    pub fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    #[must_use]
    pub fn operations(&self) -> &Arc<OperationRegistry> {
        &self.operations
    }

    #[must_use]
    pub fn flow(&self) -> &InvocationFlow {
        &self.flow
    }

    /// Serves `meta` with `method`.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::Duplicate`] if the operation is already served.
    pub fn register(
        &self,
        meta: OperationMeta,
        method: Arc<dyn ProducerMethod>,
    ) -> Result<Arc<OperationMeta>, OperationError> {
        let meta = self.operations.register(meta, method)?;
        info!(operation = %meta.op_ref(), executor = meta.executor(), "operation registered");
        Ok(meta)
    }

    /// Top-level outbound call.
    pub async fn invoke(
        &self,
        reference: ReferenceConfig,
        meta: Arc<OperationMeta>,
        args: Vec<rmpv::Value>,
    ) -> Response {
        let mut invocation = self.factory.for_consumer(reference, meta, args);
        self.flow.run_consumer(&mut invocation).await
    }

    /// Outbound call made while serving `parent`. Continues the parent's
    /// timeout budget and metadata.
    pub async fn invoke_in(
        &self,
        parent: &Invocation,
        reference: ReferenceConfig,
        meta: Arc<OperationMeta>,
        args: Vec<rmpv::Value>,
    ) -> Response {
        let mut invocation = self.factory.for_consumer_in(parent, reference, meta, args);
        self.flow.run_consumer(&mut invocation).await
    }

    /// Relays an inbound gateway call onward, keeping its metadata.
    pub async fn invoke_edge(
        &self,
        reference: ReferenceConfig,
        meta: Arc<OperationMeta>,
        args: Vec<rmpv::Value>,
        inbound: InvocationContext,
    ) -> Response {
        let mut invocation = self.factory.for_edge(reference, meta, args, inbound);
        self.flow.run_consumer(&mut invocation).await
    }

    /// Runs a prepared consumer invocation, returning it with its response.
    pub async fn run(&self, mut invocation: Invocation) -> (Invocation, Response) {
        let response = self.flow.run_consumer(&mut invocation).await;
        (invocation, response)
    }

    /// Runs `invocation` in the background and completes `sink` on the
    /// invocation's response executor, or inline if none is set.
    pub fn invoke_with_sink(self: &Arc<Self>, mut invocation: Invocation, sink: ResponseSink) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let response = engine.flow.run_consumer(&mut invocation).await;
            match invocation.response_executor() {
                Some(name) => engine
                    .executors
                    .get(name)
                    .execute(async move { sink.complete(response) }),
                None => sink.complete(response),
            }
        });
    }
}

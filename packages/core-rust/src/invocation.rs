//! The invocation record and the factory that builds it.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::clock::NanoClock;
use crate::context::{keys, InvocationContext, LocalContext, LocalKey, LocalValue};
use crate::operation::OperationMeta;
use crate::stage_trace::StageTrace;
use crate::types::{Endpoint, InvocationType, OperationRef, ReferenceConfig};

/// One logical call, consumer- or provider-side.
///
/// Owned exclusively by the call that created it. It may hop between
/// executors but is never touched by two tasks at once.
pub struct Invocation {
    id: u64,
    kind: InvocationType,
    meta: Arc<OperationMeta>,
    args: Vec<rmpv::Value>,
    context: InvocationContext,
    local: LocalContext,
    trace: StageTrace,
    endpoint: Option<Endpoint>,
    reference: Option<ReferenceConfig>,
    transport_context: Option<Box<dyn Any + Send + Sync>>,
    response_executor: Option<String>,
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("operation", self.meta.op_ref())
            .field("args", &self.args.len())
            .field("endpoint", &self.endpoint)
            .field("trace", &self.trace)
            .finish_non_exhaustive()
    }
}

impl Invocation {
    /// Process-unique record id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Role of this record.
    #[must_use]
    pub fn invocation_type(&self) -> InvocationType {
        self.kind
    }

    /// True for records that make an outbound call (consumer and edge).
    #[must_use]
    pub fn is_consumer(&self) -> bool {
        self.kind.is_outbound()
    }

    /// Static description of the target operation.
    #[must_use]
    pub fn operation_meta(&self) -> &Arc<OperationMeta> {
        &self.meta
    }

    /// Address of the target operation.
    #[must_use]
    pub fn op_ref(&self) -> &OperationRef {
        self.meta.op_ref()
    }

    /// Microservice that owns the operation.
    #[must_use]
    pub fn microservice_name(&self) -> &str {
        &self.meta.op_ref().microservice
    }

    /// Schema the operation belongs to.
    #[must_use]
    pub fn schema_id(&self) -> &str {
        &self.meta.op_ref().schema_id
    }

    /// Operation name within its schema.
    #[must_use]
    pub fn operation_name(&self) -> &str {
        &self.meta.op_ref().operation
    }

    /// `microservice.schema.operation`.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        self.meta.qualified_name()
    }

    /// Configured budget in nanoseconds; `<= 0` disables the timeout guard.
    #[must_use]
    pub fn timeout_nanos(&self) -> i64 {
        self.meta.timeout_nanos()
    }

    /// Positional arguments in parameter order.
    #[must_use]
    pub fn args(&self) -> &[rmpv::Value] {
        &self.args
    }

    /// Positional arguments, for handlers that rewrite them.
    pub fn args_mut(&mut self) -> &mut Vec<rmpv::Value> {
        &mut self.args
    }

    /// Metadata that travels in frame headers.
    #[must_use]
    pub fn context(&self) -> &InvocationContext {
        &self.context
    }

    /// Mutable view of the travelling metadata.
    pub fn context_mut(&mut self) -> &mut InvocationContext {
        &mut self.context
    }

    /// Looks up one metadata entry.
    #[must_use]
    pub fn context_value(&self, key: &str) -> Option<&str> {
        self.context.get(key).map(String::as_str)
    }

    /// Sets a metadata entry, replacing any previous value.
    pub fn add_context(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.context.insert(key.into(), value.into());
    }

    /// Merges inbound metadata without overwriting keys already set locally.
    pub fn merge_context(&mut self, other: InvocationContext) {
        for (k, v) in other {
            self.context.entry(k).or_insert(v);
        }
    }

    /// Distributed trace id, once the flow has assigned one.
    #[must_use]
    pub fn trace_id(&self) -> Option<&str> {
        self.context_value(keys::TRACE_ID)
    }

    /// In-process side table.
    #[must_use]
    pub fn local(&self) -> &LocalContext {
        &self.local
    }

    /// Mutable view of the in-process side table.
    pub fn local_mut(&mut self) -> &mut LocalContext {
        &mut self.local
    }

    /// Stage instants recorded so far.
    #[must_use]
    pub fn trace(&self) -> &StageTrace {
        &self.trace
    }

    /// Stage trace, for stamping instants.
    pub fn trace_mut(&mut self) -> &mut StageTrace {
        &mut self.trace
    }

    /// Anchors the stage trace at `nanos`.
    pub fn on_start(&mut self, nanos: u64) {
        self.trace.start(nanos);
    }

    /// Stamps the finish instant.
    pub fn on_finish(&mut self) {
        self.trace.finish();
    }

    /// Provider address: the resolved target for consumers, the serving address for providers.
    #[must_use]
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    /// Records the endpoint chosen by discovery.
    pub fn set_endpoint(&mut self, endpoint: Endpoint) {
        self.endpoint = Some(endpoint);
    }

    /// Consumer-side target description. `None` on providers.
    #[must_use]
    pub fn reference(&self) -> Option<&ReferenceConfig> {
        self.reference.as_ref()
    }

    /// Attaches the active transport's per-call state. The engine never
    /// inspects it.
    pub fn set_transport_context<T: Any + Send + Sync>(&mut self, value: T) {
        self.transport_context = Some(Box::new(value));
    }

    /// Transport per-call state, if it was set with type `T`.
    #[must_use]
    pub fn transport_context<T: Any>(&self) -> Option<&T> {
        self.transport_context.as_deref()?.downcast_ref::<T>()
    }

    /// Executor that completion callbacks are handed to, `None` for the
    /// caller's own task.
    #[must_use]
    pub fn response_executor(&self) -> Option<&str> {
        self.response_executor.as_deref()
    }

    /// Routes completion callbacks to the named executor.
    pub fn set_response_executor(&mut self, name: impl Into<String>) {
        self.response_executor = Some(name.into());
    }

    /// Request URI recorded by a front end, for failure logs.
    #[must_use]
    pub fn request_uri(&self) -> Option<&str> {
        self.local.text(LocalKey::RequestUri)
    }
}

/// Builds invocation records. Creation never performs I/O.
pub struct InvocationFactory {
    microservice: String,
    clock: Arc<dyn NanoClock>,
    next_id: AtomicU64,
}

impl fmt::Debug for InvocationFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationFactory")
            .field("microservice", &self.microservice)
            .finish_non_exhaustive()
    }
}

impl InvocationFactory {
    /// `microservice` is this process's own identity, stamped on every
    /// consumer call.
    #[must_use]
    pub fn new(microservice: impl Into<String>, clock: Arc<dyn NanoClock>) -> Self {
        Self {
            microservice: microservice.into(),
            clock,
            next_id: AtomicU64::new(1),
        }
    }

    /// This process's microservice name.
    #[must_use]
    pub fn microservice(&self) -> &str {
        &self.microservice
    }

    /// Clock handed to every record built here.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn NanoClock> {
        &self.clock
    }

    fn build(
        &self,
        kind: InvocationType,
        meta: Arc<OperationMeta>,
        args: Vec<rmpv::Value>,
    ) -> Invocation {
        Invocation {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind,
            meta,
            args,
            context: InvocationContext::new(),
            local: LocalContext::new(),
            trace: StageTrace::new(Arc::clone(&self.clock)),
            endpoint: None,
            reference: None,
            transport_context: None,
            response_executor: None,
        }
    }

    /// Outbound call to `reference`'s microservice.
    #[must_use]
    pub fn for_consumer(
        &self,
        reference: ReferenceConfig,
        meta: Arc<OperationMeta>,
        args: Vec<rmpv::Value>,
    ) -> Invocation {
        let mut inv = self.build(InvocationType::Consumer, meta, args);
        inv.reference = Some(reference);
        inv.add_context(keys::SOURCE_MICROSERVICE, self.microservice.clone());
        inv
    }

    /// Outbound call made while serving `parent`.
    ///
    /// The child inherits the parent's metadata and continues its timeout
    /// budget from the parent's own start anchor.
    #[must_use]
    pub fn for_consumer_in(
        &self,
        parent: &Invocation,
        reference: ReferenceConfig,
        meta: Arc<OperationMeta>,
        args: Vec<rmpv::Value>,
    ) -> Invocation {
        let mut inv = self.build(InvocationType::Consumer, meta, args);
        inv.reference = Some(reference);
        inv.context.clone_from(&parent.context);
        inv.add_context(keys::SOURCE_MICROSERVICE, self.microservice.clone());

        let upstream = parent.local.nanos(LocalKey::UpstreamElapsedNanos).unwrap_or(0);
        let own = match parent.trace.start_nanos() {
            0 => 0,
            start => self.clock.nano_time().saturating_sub(start),
        };
        inv.local.insert(
            LocalKey::InheritedElapsedNanos,
            LocalValue::Nanos(upstream.saturating_add(own)),
        );

        let origin = parent
            .local
            .nanos(LocalKey::InheritedStartMillis)
            .unwrap_or_else(|| parent.trace.start_millis());
        if origin != 0 {
            inv.local
                .insert(LocalKey::InheritedStartMillis, LocalValue::Nanos(origin));
        }
        inv
    }

    /// Inbound call received on `endpoint`.
    #[must_use]
    pub fn for_provider(
        &self,
        endpoint: Endpoint,
        meta: Arc<OperationMeta>,
        args: Vec<rmpv::Value>,
    ) -> Invocation {
        let mut inv = self.build(InvocationType::Provider, meta, args);
        inv.endpoint = Some(endpoint);
        inv
    }

    /// Inbound call relayed onward by a gateway. Keeps the inbound metadata.
    #[must_use]
    pub fn for_edge(
        &self,
        reference: ReferenceConfig,
        meta: Arc<OperationMeta>,
        args: Vec<rmpv::Value>,
        inbound: InvocationContext,
    ) -> Invocation {
        let mut inv = self.build(InvocationType::Edge, meta, args);
        inv.reference = Some(reference);
        inv.context = inbound;
        inv.add_context(keys::SOURCE_MICROSERVICE, self.microservice.clone());
        inv
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;

    fn meta() -> Arc<OperationMeta> {
        Arc::new(OperationMeta::new(OperationRef::new("orders", "OrderSchema", "create")))
    }

    fn reference() -> ReferenceConfig {
        ReferenceConfig::new("app", "orders", "0+")
    }

    #[test]
    fn consumer_stamps_source_identity() {
        let factory = InvocationFactory::new("gateway", Arc::new(ManualClock::default()));
        let inv = factory.for_consumer(reference(), meta(), vec![rmpv::Value::from(1)]);
        assert_eq!(inv.invocation_type(), InvocationType::Consumer);
        assert_eq!(inv.context_value(keys::SOURCE_MICROSERVICE), Some("gateway"));
        assert_eq!(inv.args().len(), 1);
        assert_eq!(inv.trace().start_nanos(), 0);
        assert_eq!(inv.qualified_name(), "orders.OrderSchema.create");
    }

    #[test]
    fn provider_has_empty_context() {
        let factory = InvocationFactory::new("orders", Arc::new(ManualClock::default()));
        let inv = factory.for_provider(Endpoint::new("127.0.0.1:1", false), meta(), Vec::new());
        assert!(inv.context().is_empty());
        assert!(!inv.is_consumer());
        assert!(inv.endpoint().is_some());
    }

    #[test]
    fn ids_are_unique() {
        let factory = InvocationFactory::new("a", Arc::new(ManualClock::default()));
        let a = factory.for_consumer(reference(), meta(), Vec::new());
        let b = factory.for_consumer(reference(), meta(), Vec::new());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn nested_consumer_inherits_elapsed_and_context() {
        let clock = Arc::new(ManualClock::new(1_000, 5_000));
        let factory = InvocationFactory::new("orders", clock.clone());
        let mut parent =
            factory.for_provider(Endpoint::new("127.0.0.1:1", false), meta(), Vec::new());
        parent.add_context(keys::TRACE_ID, "abc");
        parent
            .local_mut()
            .insert(LocalKey::UpstreamElapsedNanos, LocalValue::Nanos(300));
        parent.on_start(clock.nano_time());
        clock.advance(Duration::from_nanos(700));

        let child = factory.for_consumer_in(&parent, reference(), meta(), Vec::new());
        assert_eq!(child.trace_id(), Some("abc"));
        assert_eq!(child.local().nanos(LocalKey::InheritedElapsedNanos), Some(1_000));
        assert_eq!(child.local().nanos(LocalKey::InheritedStartMillis), Some(5_000));
    }

    #[test]
    fn transport_context_downcasts() {
        let factory = InvocationFactory::new("a", Arc::new(ManualClock::default()));
        let mut inv = factory.for_consumer(reference(), meta(), Vec::new());
        inv.set_transport_context(42_u32);
        assert_eq!(inv.transport_context::<u32>(), Some(&42));
        assert!(inv.transport_context::<String>().is_none());
    }
}

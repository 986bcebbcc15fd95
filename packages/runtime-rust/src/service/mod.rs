//! Invocation pipeline: operation contracts, executors, timeout guard,
//! handler chains and the flow orchestrator.
//!
//! 1. **Operations** (`operation`): provider contract resolution
//! 2. **Executors** (`executor`): where queued provider work runs
//! 3. **Timeout guard** (`timeout`): checkpoint-based budget enforcement
//! 4. **Handlers** (`handler`): ordered middleware ending in a terminal handler
//! 5. **Flow** (`flow`): drives one invocation from creation to response
//! 6. **Engine** (`engine`): assembles all of the above at startup

pub mod engine;
pub mod executor;
pub mod flow;
pub mod handler;
pub mod metrics;
pub mod operation;
pub mod timeout;

pub use engine::{Engine, EngineBuilder};
pub use executor::{ExecutorRegistry, OperationExecutor};
pub use flow::{InvocationFlow, ResponseSender, StartTimes};
pub use handler::{
    ChainKind, DiscoveryHandler, Handler, HandlerChain, HandlerChainRegistry, Next,
    ProducerHandler, ResponseSink, ServiceDiscovery, StaticDiscovery, Transport,
    TransportHandler,
};
pub use metrics::InvocationMetrics;
pub use operation::{arg, fn_producer, OperationError, OperationRegistry, ProducerMethod};
pub use timeout::{PassingTimeStrategy, ProcessingTimeStrategy, TimeoutGuard, TimeoutStrategy};

//! Tramline runtime: the invocation pipeline and its binary TCP transport.
//!
//! - [`service`]: operations, executors, timeout guard, handler chains, flow
//! - [`transport`]: framing, connection pools, client and server
//! - [`config`] and [`logging`]: process setup

pub mod config;
pub mod logging;
pub mod service;
pub mod transport;

pub use config::{
    ClientConfig, EngineConfig, ExecutorConfig, ServerConfig, TimeoutConfig, TimeoutStrategyKind,
};
pub use logging::{init_tracing, LogFormat};
pub use service::{Engine, EngineBuilder};
pub use transport::{WireClient, WireServer};

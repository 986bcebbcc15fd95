//! Configuration types for the Tramline runtime.
//!
//! Loading is left to the embedding process; every struct has a usable
//! `Default`.

use std::time::Duration;

use tramline_core::DEFAULT_EXECUTOR;

/// How the timeout guard measures elapsed time across hops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutStrategyKind {
    /// Sum of time spent processing on each hop, carried as elapsed nanos.
    #[default]
    ProcessingTime,
    /// Wall-clock time since the first hop started, carried as start millis.
    PassingTime,
}

/// Timeout guard settings. Per-operation budgets live on the operation.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Master switch for every checkpoint.
    pub enabled: bool,
    pub strategy: TimeoutStrategyKind,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: TimeoutStrategyKind::ProcessingTime,
        }
    }
}

/// A named bounded executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    pub name: String,
    /// Maximum operations running at once; the rest wait in queue.
    pub max_concurrency: usize,
}

/// Engine-level configuration shared by consumers and providers.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// This process's microservice name.
    pub microservice: String,
    pub app_id: String,
    pub timeout: TimeoutConfig,
    /// Invocations slower than this are logged with their stage breakdown.
    pub slow_invocation_threshold: Duration,
    /// Bounded executors in addition to the built-in `reactive` one.
    pub executors: Vec<ExecutorConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            microservice: "tramline".to_string(),
            app_id: "default".to_string(),
            timeout: TimeoutConfig::default(),
            slow_invocation_threshold: Duration::from_secs(1),
            executors: vec![ExecutorConfig {
                name: DEFAULT_EXECUTOR.to_string(),
                max_concurrency: 64,
            }],
        }
    }
}

/// Client transport settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Number of sub-pools; each worker thread binds to one.
    pub pool_count: usize,
    pub connect_timeout: Duration,
    pub login_timeout: Duration,
    /// Read timeout for a single request.
    pub request_timeout: Duration,
    /// How often pending requests are checked against `request_timeout`.
    pub sweep_interval: Duration,
    /// Attempt the login handshake when the endpoint supports it.
    pub login: bool,
    /// Ask the server for the map codec during login.
    pub request_map_codec: bool,
    /// Bounded channel capacity for outbound frames per connection.
    pub outbound_channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pool_count: 4,
            connect_timeout: Duration::from_secs(3),
            login_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_millis(500),
            login: true,
            request_map_codec: false,
            outbound_channel_capacity: 256,
        }
    }
}

/// Server transport settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Advertise login support in the published endpoint.
    pub login: bool,
    /// Grant the map codec when a client asks for it.
    pub allow_map_codec: bool,
    /// Bounded channel capacity for outbound frames per connection.
    pub outbound_channel_capacity: usize,
    /// Maximum time to wait for in-flight requests on shutdown.
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            login: true,
            allow_map_codec: true,
            outbound_channel_capacity: 256,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

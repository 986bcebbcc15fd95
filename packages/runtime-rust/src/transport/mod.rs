//! Binary TCP transport.
//!
//! Client side: pooled [`ClientConnection`]s correlate replies by message id,
//! a [`TimeoutSweeper`] expires requests that never got one, and
//! [`WireClient`] plugs the whole thing into the consumer chain.
//!
//! Server side: [`WireServer`] accepts connections, and its [`Dispatcher`]
//! walks each frame from arrival to the provider flow. [`ServerLifecycle`]
//! tracks admitted requests for graceful drain.

pub mod client;
pub mod codec;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod framing;
pub mod lifecycle;
pub mod pool;
pub mod server;
pub mod sweeper;

pub use client::{WireCallInfo, WireClient};
pub use connection::{ClientConnection, ConnectionStatus, PendingReply, ReceivedFrame};
pub use dispatch::{DispatchState, Dispatcher, ServerConnection};
pub use error::TransportError;
pub use framing::{FrameCodec, FrameCodecError};
pub use lifecycle::{InFlightGuard, LifecycleState, ServerLifecycle};
pub use pool::{ClientPool, ClientPoolManager};
pub use server::WireServer;
pub use sweeper::TimeoutSweeper;

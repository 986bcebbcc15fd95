//! Failure shapes shared by both sides of a call.

use http::StatusCode;

/// Stable error codes carried in failure responses.
pub mod codes {
    pub const GENERIC_CLIENT: &str = "TRL.00000000";
    pub const NOT_FOUND: &str = "TRL.00000002";
    pub const INVOCATION_TIMEOUT: &str = "TRL.00000010";
    pub const TRANSPORT_TIMEOUT: &str = "TRL.00000011";
    pub const SERVICE_UNAVAILABLE: &str = "TRL.00000012";
    pub const GENERIC_SERVER: &str = "TRL.50000000";
}

/// Fixed message of a timeout guard failure.
pub const INVOCATION_TIMEOUT_MESSAGE: &str = "Invocation Timeout";

/// Status for failures that happen locally on the consumer side (490).
#[must_use]
pub fn consumer_fail_status() -> StatusCode {
    StatusCode::from_u16(490).unwrap_or(StatusCode::BAD_REQUEST)
}

/// Status for unclassified provider-side failures (590).
#[must_use]
pub fn producer_fail_status() -> StatusCode {
    StatusCode::from_u16(590).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// A failed invocation outcome.
///
/// `data` is the contract-level error payload. It is only sent to the peer
/// when the operation declares `status` as one of its error statuses.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("[{status}] {code}: {message}")]
pub struct InvocationError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub data: Option<rmpv::Value>,
}

impl InvocationError {
    #[must_use]
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: rmpv::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Raised by the timeout guard, at most once per invocation.
    #[must_use]
    pub fn invocation_timeout() -> Self {
        Self::new(
            StatusCode::REQUEST_TIMEOUT,
            codes::INVOCATION_TIMEOUT,
            INVOCATION_TIMEOUT_MESSAGE,
        )
    }

    /// The peer did not reply within the transport's read timeout.
    #[must_use]
    pub fn transport_timeout(message: impl Into<String>) -> Self {
        Self::new(StatusCode::REQUEST_TIMEOUT, codes::TRANSPORT_TIMEOUT, message)
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, codes::NOT_FOUND, message)
    }

    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::GENERIC_CLIENT, message)
    }

    #[must_use]
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            codes::SERVICE_UNAVAILABLE,
            message,
        )
    }

    /// Local consumer failure (no endpoint, connection lost, encode error).
    #[must_use]
    pub fn consumer_fail(message: impl Into<String>) -> Self {
        Self::new(consumer_fail_status(), codes::GENERIC_CLIENT, message)
    }

    /// Unclassified provider failure.
    #[must_use]
    pub fn producer_fail(message: impl Into<String>) -> Self {
        Self::new(producer_fail_status(), codes::GENERIC_SERVER, message)
    }

    /// Converts a business error to a failure.
    ///
    /// An `InvocationError` anywhere in the causal chain is returned as-is.
    /// Otherwise the root cause message becomes a provider failure.
    #[must_use]
    pub fn from_business(err: &anyhow::Error) -> Self {
        if let Some(found) = err.chain().find_map(|e| e.downcast_ref::<Self>()) {
            return found.clone();
        }
        Self::producer_fail(err.root_cause().to_string())
    }

    /// Drops `data` unless `declared` says the contract defines it.
    #[must_use]
    pub fn scoped_to(mut self, declared: impl FnOnce(StatusCode) -> bool) -> Self {
        if self.data.is_some() && !declared(self.status) {
            self.data = None;
        }
        self
    }

    #[must_use]
    pub fn is_invocation_timeout(&self) -> bool {
        self.code == codes::INVOCATION_TIMEOUT
    }
}

/// Malformed frame or failed handshake. Connection-scoped, never surfaced as a
/// business result.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("bad frame magic")]
    BadMagic,
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("header length {header_len} exceeds total length {total_len}")]
    BadHeaderLength { header_len: u32, total_len: u32 },
    #[error("truncated frame: need {expected} bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("unknown message type {0}")]
    UnknownMsgType(u8),
    #[error("unexpected message type {actual}, expected {expected}")]
    UnexpectedMsgType { expected: &'static str, actual: u8 },
    #[error("header decode failed: {0}")]
    HeaderDecode(#[source] rmp_serde::decode::Error),
    #[error("body decode failed: {0}")]
    BodyDecode(#[source] rmp_serde::decode::Error),
    #[error("encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("login rejected: {0}")]
    LoginRejected(String),
}

use tramline_core::{InvocationError, ProtocolError};

/// Connection-level failure seen by the client side.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("connect to {address} failed: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connect to {address} timed out")]
    ConnectTimeout { address: String },
    #[error("login failed: {0}")]
    Login(String),
    #[error("login timed out")]
    LoginTimeout,
    #[error("connection lost")]
    Disconnected,
    #[error("request {msg_id} timed out waiting for response")]
    RequestTimeout { msg_id: u64 },
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    /// The local failure delivered to the waiting caller.
    #[must_use]
    pub fn to_invocation_error(&self) -> InvocationError {
        match self {
            Self::RequestTimeout { .. } => InvocationError::transport_timeout(self.to_string()),
            _ => InvocationError::consumer_fail(self.to_string()),
        }
    }
}

impl From<TransportError> for InvocationError {
    fn from(err: TransportError) -> Self {
        err.to_invocation_error()
    }
}

#[cfg(test)]
mod tests {
    use http::StatusCode;
    use tramline_core::error::codes;

    use super::*;

    #[test]
    fn read_timeout_maps_to_408() {
        let err = TransportError::RequestTimeout { msg_id: 3 }.to_invocation_error();
        assert_eq!(err.status, StatusCode::REQUEST_TIMEOUT);
        assert_eq!(err.code, codes::TRANSPORT_TIMEOUT);
    }

    #[test]
    fn other_errors_are_consumer_failures() {
        let err = InvocationError::from(TransportError::Disconnected);
        assert_eq!(err.status.as_u16(), 490);
        assert_eq!(err.code, codes::GENERIC_CLIENT);
    }
}

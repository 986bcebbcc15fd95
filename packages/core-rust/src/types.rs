use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Transport scheme accepted by [`Endpoint::from_str`].
pub const WIRE_SCHEME: &str = "tramline";

/// Which side of a call an invocation represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvocationType {
    /// Outbound call made by this process.
    Consumer,
    /// Inbound call served by this process.
    Provider,
    /// Inbound call relayed onward by a gateway. Runs the consumer chain.
    Edge,
}

impl InvocationType {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Consumer => "consumer",
            Self::Provider => "provider",
            Self::Edge => "edge",
        }
    }

    /// Whether the invocation sends a request onward (consumer or edge).
    #[must_use]
    pub const fn is_outbound(self) -> bool {
        matches!(self, Self::Consumer | Self::Edge)
    }
}

/// The (microservice, schema, operation) triple naming one remote operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationRef {
    pub microservice: String,
    pub schema_id: String,
    pub operation: String,
}

impl OperationRef {
    #[must_use]
    pub fn new(
        microservice: impl Into<String>,
        schema_id: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            microservice: microservice.into(),
            schema_id: schema_id.into(),
            operation: operation.into(),
        }
    }
}

impl fmt::Display for OperationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.microservice, self.schema_id, self.operation)
    }
}

/// A resolved network address of a provider instance.
///
/// String form: `tramline://host:port?login=true`. The `login` flag says
/// whether the remote side supports the login handshake.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// `host:port`, used as the connection pool key.
    pub address: String,
    /// Remote side accepts LOGIN frames.
    pub login: bool,
}

impl Endpoint {
    #[must_use]
    pub fn new(address: impl Into<String>, login: bool) -> Self {
        Self {
            address: address.into(),
            login,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{WIRE_SCHEME}://{}", self.address)?;
        if self.login {
            write!(f, "?login=true")?;
        }
        Ok(())
    }
}

/// Error returned when an endpoint string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid endpoint '{input}': {reason}")]
pub struct EndpointParseError {
    pub input: String,
    pub reason: &'static str,
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| EndpointParseError {
            input: s.to_string(),
            reason,
        };

        let rest = s
            .strip_prefix(WIRE_SCHEME)
            .and_then(|r| r.strip_prefix("://"))
            .ok_or_else(|| err("expected tramline:// scheme"))?;

        let (address, query) = match rest.split_once('?') {
            Some((a, q)) => (a, Some(q)),
            None => (rest, None),
        };

        let Some((host, port)) = address.rsplit_once(':') else {
            return Err(err("missing port"));
        };
        if host.is_empty() {
            return Err(err("missing host"));
        }
        port.parse::<u16>().map_err(|_| err("invalid port"))?;

        let login = query
            .into_iter()
            .flat_map(|q| q.split('&'))
            .filter_map(|pair| pair.split_once('='))
            .any(|(k, v)| k == "login" && v.eq_ignore_ascii_case("true"));

        Ok(Self::new(address, login))
    }
}

/// Consumer-side reference to a target microservice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceConfig {
    pub app_id: String,
    pub microservice: String,
    /// Version rule handed to discovery, e.g. `"0+"` or `"1.0.0"`.
    pub version_rule: String,
}

impl ReferenceConfig {
    #[must_use]
    pub fn new(
        app_id: impl Into<String>,
        microservice: impl Into<String>,
        version_rule: impl Into<String>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            microservice: microservice.into(),
            version_rule: version_rule.into(),
        }
    }
}

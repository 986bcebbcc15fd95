//! Frame header and body schemas.
//!
//! Headers are always MsgPack arrays, so either side can read them before any
//! codec feature is negotiated. Bodies follow the connection's [`WireFormat`].

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Protocol name declared in the login handshake.
pub const PROTOCOL_NAME: &str = "tramline.v1";

/// Compression name for uncompressed bodies, the only one granted.
pub const ZIP_NONE: &str = "none";

/// Message-type discriminator, the first field of every header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum MsgType {
    Request = 0,
    Login = 1,
    Response = 2,
    LoginResponse = 3,
}

impl MsgType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "REQUEST",
            Self::Login => "LOGIN",
            Self::Response => "RESPONSE",
            Self::LoginResponse => "LOGIN_RESPONSE",
        }
    }
}

impl From<MsgType> for u8 {
    fn from(t: MsgType) -> Self {
        t as u8
    }
}

impl TryFrom<u8> for MsgType {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Request),
            1 => Ok(Self::Login),
            2 => Ok(Self::Response),
            3 => Ok(Self::LoginResponse),
            other => Err(ProtocolError::UnknownMsgType(other)),
        }
    }
}

/// Body encoding negotiated per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WireFormat {
    /// Arguments as a positional array.
    #[default]
    Compact,
    /// Arguments as a map keyed by declared parameter name.
    Named,
}

impl WireFormat {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Compact => "compact",
            Self::Named => "named",
        }
    }

    /// Encodes positional `args` for an operation declaring `params`.
    ///
    /// No arguments encode to an empty body.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Encode`] if serialization fails.
    pub fn encode_args(
        self,
        params: &[String],
        args: &[rmpv::Value],
    ) -> Result<Bytes, ProtocolError> {
        if args.is_empty() {
            return Ok(Bytes::new());
        }
        let bytes = match self {
            Self::Compact => rmp_serde::to_vec(args)?,
            Self::Named => {
                let map: Vec<(rmpv::Value, rmpv::Value)> = args
                    .iter()
                    .enumerate()
                    .map(|(i, arg)| {
                        let name = params.get(i).cloned().unwrap_or_else(|| format!("arg{i}"));
                        (rmpv::Value::from(name), arg.clone())
                    })
                    .collect();
                rmp_serde::to_vec(&rmpv::Value::Map(map))?
            }
        };
        Ok(Bytes::from(bytes))
    }

    /// Decodes a request body back to positional arguments.
    ///
    /// For [`WireFormat::Named`], parameters missing from the map decode as
    /// `Nil`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::BodyDecode`] if the body is not the expected
    /// shape.
    pub fn decode_args(
        self,
        params: &[String],
        body: &[u8],
    ) -> Result<Vec<rmpv::Value>, ProtocolError> {
        if body.is_empty() {
            return Ok(Vec::new());
        }
        match self {
            Self::Compact => rmp_serde::from_slice(body).map_err(ProtocolError::BodyDecode),
            Self::Named => {
                let value: rmpv::Value =
                    rmp_serde::from_slice(body).map_err(ProtocolError::BodyDecode)?;
                let rmpv::Value::Map(entries) = value else {
                    return Err(ProtocolError::BodyDecode(
                        rmp_serde::decode::Error::Syntax("expected argument map".to_string()),
                    ));
                };
                let mut by_name: HashMap<String, rmpv::Value> = entries
                    .into_iter()
                    .filter_map(|(k, v)| k.as_str().map(|s| (s.to_string(), v)))
                    .collect();
                Ok(params
                    .iter()
                    .map(|p| by_name.remove(p).unwrap_or(rmpv::Value::Nil))
                    .collect())
            }
        }
    }
}

/// Encodes a result or error payload. `None` is an empty body.
///
/// # Errors
///
/// Returns [`ProtocolError::Encode`] if serialization fails.
pub fn encode_value(value: Option<&rmpv::Value>) -> Result<Bytes, ProtocolError> {
    match value {
        None => Ok(Bytes::new()),
        Some(v) => Ok(Bytes::from(rmp_serde::to_vec(v)?)),
    }
}

/// Inverse of [`encode_value`].
///
/// # Errors
///
/// Returns [`ProtocolError::BodyDecode`] on malformed input.
pub fn decode_value(body: &[u8]) -> Result<Option<rmpv::Value>, ProtocolError> {
    if body.is_empty() {
        return Ok(None);
    }
    rmp_serde::from_slice(body)
        .map(Some)
        .map_err(ProtocolError::BodyDecode)
}

/// Header of REQUEST and LOGIN frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub msg_type: MsgType,
    pub flags: u32,
    pub dest_microservice: String,
    pub schema_id: String,
    pub operation_name: String,
    pub context: HashMap<String, String>,
}

impl RequestHeader {
    #[must_use]
    pub fn request(
        dest_microservice: impl Into<String>,
        schema_id: impl Into<String>,
        operation_name: impl Into<String>,
        context: HashMap<String, String>,
    ) -> Self {
        Self {
            msg_type: MsgType::Request,
            flags: 0,
            dest_microservice: dest_microservice.into(),
            schema_id: schema_id.into(),
            operation_name: operation_name.into(),
            context,
        }
    }

    #[must_use]
    pub fn login() -> Self {
        Self {
            msg_type: MsgType::Login,
            flags: 0,
            dest_microservice: String::new(),
            schema_id: String::new(),
            operation_name: String::new(),
            context: HashMap::new(),
        }
    }
}

/// Header of RESPONSE and LOGIN_RESPONSE frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub msg_type: MsgType,
    pub flags: u32,
    pub status_code: u16,
    pub reason: String,
    /// Error code for failures, empty for successes.
    pub error_code: String,
    pub context: HashMap<String, String>,
    pub headers: BTreeMap<String, String>,
}

impl ResponseHeader {
    #[must_use]
    pub fn response(status_code: u16, reason: impl Into<String>) -> Self {
        Self {
            msg_type: MsgType::Response,
            flags: 0,
            status_code,
            reason: reason.into(),
            error_code: String::new(),
            context: HashMap::new(),
            headers: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn login_response() -> Self {
        Self {
            msg_type: MsgType::LoginResponse,
            ..Self::response(200, "OK")
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// LOGIN body: what the client asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub protocol: String,
    pub zip_name: String,
    pub use_map_codec: bool,
}

impl LoginRequest {
    #[must_use]
    pub fn new(use_map_codec: bool) -> Self {
        Self {
            protocol: PROTOCOL_NAME.to_string(),
            zip_name: ZIP_NONE.to_string(),
            use_map_codec,
        }
    }
}

/// LOGIN_RESPONSE body: what the server granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub protocol: String,
    pub zip_name: String,
    pub use_map_codec: bool,
}

impl LoginResponse {
    #[must_use]
    pub fn format(&self) -> WireFormat {
        if self.use_map_codec {
            WireFormat::Named
        } else {
            WireFormat::Compact
        }
    }
}

/// Encodes a header or login body as a MsgPack array.
///
/// # Errors
///
/// Returns [`ProtocolError::Encode`] if serialization fails.
pub fn encode_header<T: Serialize>(header: &T) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(rmp_serde::to_vec(header)?))
}

/// # Errors
///
/// Returns [`ProtocolError::HeaderDecode`] on malformed input, which includes
/// an unknown message type.
pub fn decode_header<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    rmp_serde::from_slice(bytes).map_err(ProtocolError::HeaderDecode)
}

/// Decodes a login body. Login bodies are always compact.
///
/// # Errors
///
/// Returns [`ProtocolError::BodyDecode`] on malformed input.
pub fn decode_login<T: DeserializeOwned>(body: &[u8]) -> Result<T, ProtocolError> {
    rmp_serde::from_slice(body).map_err(ProtocolError::BodyDecode)
}

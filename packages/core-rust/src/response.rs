//! The single result shape every invocation completes with.

use std::collections::BTreeMap;

use http::StatusCode;
use serde::de::DeserializeOwned;

use crate::error::InvocationError;

/// Outcome of one invocation, success or failure.
///
/// Everything that crosses the network boundary becomes a `Response`;
/// failures raised before a call is built use the same shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    status: StatusCode,
    headers: BTreeMap<String, String>,
    result: Result<Option<rmpv::Value>, InvocationError>,
}

impl Response {
    /// `200` carrying `value`.
    #[must_use]
    pub fn success(value: rmpv::Value) -> Self {
        Self::ok(Some(value))
    }

    /// `200` with no body (void operation).
    #[must_use]
    pub fn void() -> Self {
        Self::ok(None)
    }

    #[must_use]
    pub fn ok(value: Option<rmpv::Value>) -> Self {
        Self {
            status: StatusCode::OK,
            headers: BTreeMap::new(),
            result: Ok(value),
        }
    }

    #[must_use]
    pub fn failure(err: InvocationError) -> Self {
        Self {
            status: err.status,
            headers: BTreeMap::new(),
            result: Err(err),
        }
    }

    /// Overrides the status, keeping a failure's own status in sync.
    #[must_use]
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        if let Err(err) = &mut self.result {
            err.status = status;
        }
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Canonical reason for successes, the error message for failures.
    #[must_use]
    pub fn reason(&self) -> &str {
        match &self.result {
            Ok(_) => self.status.canonical_reason().unwrap_or(""),
            Err(err) => &err.message,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    #[must_use]
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.headers
    }

    #[must_use]
    pub fn result(&self) -> Result<Option<&rmpv::Value>, &InvocationError> {
        self.result.as_ref().map(Option::as_ref)
    }

    #[must_use]
    pub fn error(&self) -> Option<&InvocationError> {
        self.result.as_ref().err()
    }

    /// # Errors
    ///
    /// Returns the failure if the invocation did not succeed.
    pub fn into_result(self) -> Result<Option<rmpv::Value>, InvocationError> {
        self.result
    }

    /// Deserializes the success value into `T`. Void results decode `Nil`.
    ///
    /// # Errors
    ///
    /// Returns the failure unchanged, or a consumer failure if the value does
    /// not match `T`.
    pub fn decode<T: DeserializeOwned>(self) -> Result<T, InvocationError> {
        let value = self.result?.unwrap_or(rmpv::Value::Nil);
        rmpv::ext::from_value(value)
            .map_err(|e| InvocationError::consumer_fail(format!("result decode failed: {e}")))
    }
}

impl From<InvocationError> for Response {
    fn from(err: InvocationError) -> Self {
        Self::failure(err)
    }
}

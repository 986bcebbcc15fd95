//! Maps invocations and responses to frame header/body pairs.
//!
//! Headers are always compact arrays; only request arguments follow the
//! connection's negotiated [`WireFormat`].

use bytes::Bytes;
use http::StatusCode;
use tramline_core::error::{codes, producer_fail_status};
use tramline_core::wire::{
    decode_value, encode_header, encode_value, RequestHeader, ResponseHeader, WireFormat,
};
use tramline_core::{Invocation, InvocationContext, InvocationError, ProtocolError, Response};

/// Encodes a consumer invocation as a REQUEST header and argument body.
///
/// # Errors
///
/// Returns [`ProtocolError::Encode`] if an argument cannot be serialized.
pub fn encode_request(
    invocation: &Invocation,
    format: WireFormat,
) -> Result<(Bytes, Bytes), ProtocolError> {
    let header = RequestHeader::request(
        invocation.microservice_name(),
        invocation.schema_id(),
        invocation.operation_name(),
        invocation.context().clone(),
    );
    let body = format.encode_args(invocation.operation_meta().params(), invocation.args())?;
    Ok((encode_header(&header)?, body))
}

/// Encodes a provider response as a RESPONSE header and payload body. A
/// failure's body is its error payload, empty if it has none.
///
/// `context` is the provider invocation's metadata, returned to the caller in
/// the header. `None` when the response was produced before the record
/// existed.
///
/// # Errors
///
/// Returns [`ProtocolError::Encode`] if the payload cannot be serialized.
pub fn encode_response(
    context: Option<&InvocationContext>,
    response: &Response,
) -> Result<(Bytes, Bytes), ProtocolError> {
    let mut header = ResponseHeader::response(response.status().as_u16(), response.reason());
    header.headers.clone_from(response.headers());
    if let Some(context) = context {
        header.context.clone_from(context);
    }
    let body = match response.result() {
        Ok(value) => encode_value(value)?,
        Err(err) => {
            header.error_code.clone_from(&err.code);
            encode_value(err.data.as_ref())?
        }
    };
    Ok((encode_header(&header)?, body))
}

fn default_code(status: StatusCode) -> &'static str {
    if status.is_client_error() {
        codes::GENERIC_CLIENT
    } else {
        codes::GENERIC_SERVER
    }
}

/// Rebuilds a [`Response`] from a decoded RESPONSE header and its body.
///
/// # Errors
///
/// Returns [`ProtocolError::BodyDecode`] if the body is not valid MsgPack.
pub fn decode_response(header: &ResponseHeader, body: &[u8]) -> Result<Response, ProtocolError> {
    let status = StatusCode::from_u16(header.status_code).unwrap_or_else(|_| producer_fail_status());
    let value = decode_value(body)?;
    let mut response = if header.is_success() {
        Response::ok(value).with_status(status)
    } else {
        let code = if header.error_code.is_empty() {
            default_code(status)
        } else {
            header.error_code.as_str()
        };
        let mut err = InvocationError::new(status, code, header.reason.clone());
        if let Some(data) = value {
            err = err.with_data(data);
        }
        Response::failure(err)
    };
    for (name, value) in &header.headers {
        response.headers_mut().insert(name.clone(), value.clone());
    }
    Ok(response)
}

/// Copies the context returned by the provider into the consumer invocation.
/// Returned entries replace local ones with the same key.
pub fn merge_response_context(invocation: &mut Invocation, header: &ResponseHeader) {
    for (key, value) in &header.context {
        invocation.add_context(key.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tramline_core::wire::{decode_header, MsgType};
    use tramline_core::{InvocationFactory, ManualClock, OperationMeta, OperationRef, ReferenceConfig};

    use super::*;

    fn transfer(response: &Response) -> Response {
        let (header, body) = encode_response(None, response).unwrap();
        let header: ResponseHeader = decode_header(&header).unwrap();
        assert_eq!(header.msg_type, MsgType::Response);
        assert!(header.context.is_empty());
        decode_response(&header, &body).unwrap()
    }

    #[test]
    fn void_success_has_empty_body() {
        let (_, body) = encode_response(None, &Response::void()).unwrap();
        assert!(body.is_empty());
        assert!(transfer(&Response::void()).is_success());
    }

    #[test]
    fn failure_keeps_code_message_and_payload() {
        let failure = Response::failure(
            InvocationError::new(StatusCode::CONFLICT, "APP.7", "stale version")
                .with_data(rmpv::Value::from(3)),
        )
        .with_header("x-retry", "no");
        let received = transfer(&failure);
        let err = received.error().unwrap();
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.code, "APP.7");
        assert_eq!(err.message, "stale version");
        assert_eq!(err.data, Some(rmpv::Value::from(3)));
        assert_eq!(received.headers().get("x-retry").map(String::as_str), Some("no"));
    }

    #[test]
    fn timeout_survives_the_wire() {
        let received = transfer(&Response::failure(InvocationError::invocation_timeout()));
        assert!(received.error().unwrap().is_invocation_timeout());
    }

    #[test]
    fn missing_error_code_defaults_by_status_class() {
        let header = ResponseHeader::response(503, "busy");
        let response = decode_response(&header, &[]).unwrap();
        assert_eq!(response.error().unwrap().code, codes::GENERIC_SERVER);
    }

    #[test]
    fn response_context_reaches_consumer_invocation() {
        let mut provided = InvocationContext::new();
        provided.insert("a".to_string(), "10".to_string());
        let (header, body) = encode_response(Some(&provided), &Response::void()).unwrap();
        let header: ResponseHeader = decode_header(&header).unwrap();
        assert_eq!(header.context.get("a").map(String::as_str), Some("10"));

        let factory = InvocationFactory::new("caller", Arc::new(ManualClock::default()));
        let mut inv = factory.for_consumer(
            ReferenceConfig::new("app", "orders", "0+"),
            Arc::new(OperationMeta::new(OperationRef::new("orders", "Orders", "get"))),
            Vec::new(),
        );
        inv.add_context("a", "1");
        inv.add_context("b", "kept");
        let response = decode_response(&header, &body).unwrap();
        merge_response_context(&mut inv, &header);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(inv.context_value("a"), Some("10"));
        assert_eq!(inv.context_value("b"), Some("kept"));
    }

    #[test]
    fn request_carries_context_and_named_args() {
        let factory = InvocationFactory::new("caller", Arc::new(ManualClock::default()));
        let meta = OperationMeta::new(OperationRef::new("orders", "Orders", "create"))
            .with_params(["id", "qty"]);
        let mut inv = factory.for_consumer(
            ReferenceConfig::new("app", "orders", "0+"),
            Arc::new(meta),
            vec![rmpv::Value::from("a1"), rmpv::Value::from(2)],
        );
        inv.add_context("k", "v");
        let (header, body) = encode_request(&inv, WireFormat::Named).unwrap();
        let header: RequestHeader = decode_header(&header).unwrap();
        assert_eq!(header.dest_microservice, "orders");
        assert_eq!(header.operation_name, "create");
        assert_eq!(header.context.get("k").map(String::as_str), Some("v"));
        let params = inv.operation_meta().params().to_vec();
        let args = WireFormat::Named.decode_args(&params, &body).unwrap();
        assert_eq!(args, inv.args());
    }
}

//! Wire-level schemas of the binary transport.
//!
//! - [`frame`]: fixed prefix, message id and length framing
//! - [`message`]: header and body schemas, login handshake, codec features

pub mod frame;
pub mod message;

pub use frame::{decode_frame, decode_frame_exact, encode_frame, RawFrame, MAX_FRAME_LEN};
pub use message::{
    decode_header, decode_login, decode_value, encode_header, encode_value, LoginRequest,
    LoginResponse, MsgType, RequestHeader, ResponseHeader, WireFormat, PROTOCOL_NAME,
};

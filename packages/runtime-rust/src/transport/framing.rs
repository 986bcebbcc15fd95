//! `tokio-util` codec over the frame layout in [`tramline_core::wire::frame`].

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use tramline_core::wire::frame::PREFIX_LEN;
use tramline_core::wire::{decode_frame, encode_frame, RawFrame};
use tramline_core::ProtocolError;

/// Error surfaced by framed streams: a malformed frame or the socket itself.
#[derive(Debug, thiserror::Error)]
pub enum FrameCodecError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Splits a byte stream into [`RawFrame`]s and writes them back out.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = RawFrame;
    type Error = FrameCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawFrame>, FrameCodecError> {
        Ok(decode_frame(src)?)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<RawFrame>, FrameCodecError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(ProtocolError::Truncated {
                expected: PREFIX_LEN.max(src.len() + 1),
                actual: src.len(),
            }
            .into()),
        }
    }
}

impl Encoder<RawFrame> for FrameCodec {
    type Error = FrameCodecError;

    fn encode(&mut self, frame: RawFrame, dst: &mut BytesMut) -> Result<(), FrameCodecError> {
        Ok(encode_frame(&frame, dst)?)
    }
}

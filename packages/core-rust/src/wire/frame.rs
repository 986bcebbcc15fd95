//! Binary frame layout.
//!
//! ```text
//! +---------+----------+-----------+------------+--------+------+
//! | magic 7 | msg id 8 | total 4   | header 4   | header | body |
//! +---------+----------+-----------+------------+--------+------+
//! ```
//!
//! All integers are big-endian. `total = header + body`, written before the
//! encoded bytes so a reader can pre-size its buffer. A zero-length body means
//! void.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

pub const MAGIC: &[u8; 7] = b"TRM.TCP";

/// Fixed prefix: magic, message id, total length, header length.
pub const PREFIX_LEN: usize = MAGIC.len() + 8 + 4 + 4;

/// Largest accepted `header + body` length.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// One undecoded frame: the id plus independently encoded header and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub msg_id: u64,
    pub header: Bytes,
    pub body: Bytes,
}

impl RawFrame {
    #[must_use]
    pub fn new(msg_id: u64, header: impl Into<Bytes>, body: impl Into<Bytes>) -> Self {
        Self {
            msg_id,
            header: header.into(),
            body: body.into(),
        }
    }

    /// Encoded size including the prefix.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        PREFIX_LEN + self.header.len() + self.body.len()
    }
}

/// Appends `frame` to `dst` as one contiguous buffer.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] if `header + body` exceeds
/// [`MAX_FRAME_LEN`].
pub fn encode_frame(frame: &RawFrame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    let total = frame.header.len() + frame.body.len();
    if total > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len: total,
            max: MAX_FRAME_LEN,
        });
    }
    dst.reserve(PREFIX_LEN + total);
    dst.put_slice(MAGIC);
    dst.put_u64(frame.msg_id);
    #[allow(clippy::cast_possible_truncation)]
    {
        dst.put_u32(total as u32);
        dst.put_u32(frame.header.len() as u32);
    }
    dst.put_slice(&frame.header);
    dst.put_slice(&frame.body);
    Ok(())
}

/// Fixed prefix fields, validated.
struct Prefix {
    msg_id: u64,
    total: usize,
    header: usize,
}

fn read_prefix(mut src: &[u8]) -> Result<Prefix, ProtocolError> {
    if &src[..MAGIC.len()] != MAGIC {
        return Err(ProtocolError::BadMagic);
    }
    src.advance(MAGIC.len());
    let msg_id = src.get_u64();
    let total_len = src.get_u32();
    let header_len = src.get_u32();
    if header_len > total_len {
        return Err(ProtocolError::BadHeaderLength {
            header_len,
            total_len,
        });
    }
    let total = total_len as usize;
    if total > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len: total,
            max: MAX_FRAME_LEN,
        });
    }
    Ok(Prefix {
        msg_id,
        total,
        header: header_len as usize,
    })
}

/// Streaming decode: takes one complete frame off the front of `src`.
///
/// Returns `Ok(None)` while more bytes are needed. The prefix is validated as
/// soon as it is available so a bad peer is rejected before its body arrives.
///
/// # Errors
///
/// Returns a [`ProtocolError`] for bad magic or inconsistent lengths.
pub fn decode_frame(src: &mut BytesMut) -> Result<Option<RawFrame>, ProtocolError> {
    if src.len() < PREFIX_LEN {
        return Ok(None);
    }
    let prefix = read_prefix(&src[..PREFIX_LEN])?;
    let needed = PREFIX_LEN + prefix.total;
    if src.len() < needed {
        src.reserve(needed - src.len());
        return Ok(None);
    }
    src.advance(PREFIX_LEN);
    let mut payload = src.split_to(prefix.total).freeze();
    let header = payload.split_to(prefix.header);
    Ok(Some(RawFrame {
        msg_id: prefix.msg_id,
        header,
        body: payload,
    }))
}

/// Decodes exactly one frame from `bytes`.
///
/// # Errors
///
/// A short or truncated input is [`ProtocolError::Truncated`], never a
/// partial result. Trailing bytes are also rejected as a length mismatch.
pub fn decode_frame_exact(bytes: &[u8]) -> Result<RawFrame, ProtocolError> {
    if bytes.len() < PREFIX_LEN {
        return Err(ProtocolError::Truncated {
            expected: PREFIX_LEN,
            actual: bytes.len(),
        });
    }
    let prefix = read_prefix(&bytes[..PREFIX_LEN])?;
    let expected = PREFIX_LEN + prefix.total;
    if bytes.len() != expected {
        return Err(ProtocolError::Truncated {
            expected,
            actual: bytes.len(),
        });
    }
    let payload = Bytes::copy_from_slice(&bytes[PREFIX_LEN..]);
    Ok(RawFrame {
        msg_id: prefix.msg_id,
        header: payload.slice(..prefix.header),
        body: payload.slice(prefix.header..),
    })
}

//! Length-delimited frame codec.
//!
//! ```text
//! +--------+-------------------+----------------------+
//! | type:1 | body_length:4 (BE)| body: body_length    |
//! +--------+-------------------+----------------------+
//! ```
//!
//! `decode` is a pure function over the accumulated bytes. `FrameDecoder`
//! wraps it with the per-session buffer that survives across read events.

use crate::error::FramingError;
use crate::protocol::message::{Message, MessageType};
use bytes::{Buf, BufMut, BytesMut};

/// Type byte plus a 4-byte length.
pub const HEADER_LEN: usize = 5;

/// Largest body the length field can carry without reading as negative.
pub const MAX_BODY_LEN: usize = i32::MAX as usize;

/// Result of decoding the front of a buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeResult {
    /// A full frame, with the number of bytes it occupied.
    Complete(Message, usize),
    /// Not enough bytes yet. Nothing was consumed.
    Incomplete,
    Error(FramingError),
}

/// Decode one frame from the front of `input`.
pub fn decode(input: &[u8], max_body: usize) -> DecodeResult {
    let body_len = match check_header(input, max_body) {
        Ok(Some((_, len))) => len,
        Ok(None) => return DecodeResult::Incomplete,
        Err(e) => return DecodeResult::Error(e),
    };

    let total = HEADER_LEN + body_len;
    if input.len() < total {
        return DecodeResult::Incomplete;
    }

    match build(input[0], &input[HEADER_LEN..total]) {
        Ok(msg) => DecodeResult::Complete(msg, total),
        Err(e) => DecodeResult::Error(e),
    }
}

/// Append the wire form of `msg` to `dst`.
pub fn encode(msg: &Message, dst: &mut BytesMut) {
    dst.reserve(HEADER_LEN + msg.body().len());
    dst.put_u8(msg.msg_type().code());
    dst.put_u32(msg.header().body_length());
    dst.extend_from_slice(msg.body());
}

/// Encode into a fresh buffer.
pub fn encode_to_vec(msg: &Message) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + msg.body().len());
    encode(msg, &mut buf);
    buf.to_vec()
}

/// Validate the header at the front of `input`.
///
/// Rejects bad lengths as soon as the header is present so a hostile length
/// field never makes us wait for (or buffer) the body.
fn check_header(input: &[u8], max_body: usize) -> Result<Option<(MessageType, usize)>, FramingError> {
    if input.len() < HEADER_LEN {
        return Ok(None);
    }

    let msg_type = MessageType::try_from(input[0])?;
    let raw = i32::from_be_bytes([input[1], input[2], input[3], input[4]]);
    if raw < 0 {
        return Err(FramingError::NegativeLength(raw));
    }

    let len = raw as usize;
    if len > max_body {
        return Err(FramingError::BodyTooLarge { len, max: max_body });
    }
    if msg_type == MessageType::LoginResp && len != 1 {
        return Err(FramingError::BadLoginResponse(len));
    }

    Ok(Some((msg_type, len)))
}

fn build(code: u8, body: &[u8]) -> Result<Message, FramingError> {
    let msg_type = MessageType::try_from(code)?;
    Ok(Message::new(msg_type, body.to_vec()))
}

/// Streaming decoder holding a session's partial input.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_body: usize,
}

impl FrameDecoder {
    pub fn new(max_body: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_body,
        }
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete message, if any.
    ///
    /// The body is split off the buffer without copying.
    pub fn next_message(&mut self) -> Result<Option<Message>, FramingError> {
        let Some((msg_type, body_len)) = check_header(&self.buf, self.max_body)? else {
            return Ok(None);
        };

        if self.buf.len() < HEADER_LEN + body_len {
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);
        let body = self.buf.split_to(body_len).freeze();
        Ok(Some(Message::new(msg_type, body)))
    }

    /// Called on EOF, after every complete frame has been taken.
    pub fn finish(&self) -> Result<(), FramingError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(FramingError::TruncatedFrame(self.buf.len()))
        }
    }

    /// Bytes held that do not yet form a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

//! Wire protocol: message model and frame codec.
//!
//! ## Frame Format
//!
//! ```text
//! LOGIN_REQ       1  [credentials]
//! LOGIN_RESP      2  [status:1]     0 = accepted
//! HEARTBEAT_REQ   3  []
//! HEARTBEAT_RESP  4  []
//! DATA            5  [payload]
//! ```

pub mod codec;
pub mod message;

pub use codec::{
    decode, encode, encode_to_vec, DecodeResult, FrameDecoder, HEADER_LEN,
    MAX_BODY_LEN,
};
pub use message::{Header, Message, MessageType, LOGIN_ACCEPTED, LOGIN_REJECTED};

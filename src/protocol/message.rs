//! Message model shared by the codec and every stage.

use crate::error::FramingError;
use bytes::Bytes;

/// Login status byte meaning "accepted".
pub const LOGIN_ACCEPTED: u8 = 0;
/// Status byte the server sends for a rejected login.
pub const LOGIN_REJECTED: u8 = 1;

/// Message type codes as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    LoginReq = 1,
    LoginResp = 2,
    HeartbeatReq = 3,
    HeartbeatResp = 4,
    Data = 5,
}

impl MessageType {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = FramingError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(MessageType::LoginReq),
            2 => Ok(MessageType::LoginResp),
            3 => Ok(MessageType::HeartbeatReq),
            4 => Ok(MessageType::HeartbeatResp),
            5 => Ok(MessageType::Data),
            other => Err(FramingError::UnknownType(other)),
        }
    }
}

/// Fixed-size frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    msg_type: MessageType,
    body_length: u32,
}

impl Header {
    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    pub fn body_length(&self) -> u32 {
        self.body_length
    }
}

/// One protocol message.
///
/// The only way to build a `Message` is through [`Message::new`] (or the
/// typed helpers), which derives `body_length` from the body, so the two can
/// never disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    header: Header,
    body: Bytes,
}

impl Message {
    /// Bodies longer than [`MAX_BODY_LEN`](crate::protocol::MAX_BODY_LEN) do
    /// not fit the length field; `Session::send` refuses to queue them.
    pub fn new(msg_type: MessageType, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self {
            header: Header {
                msg_type,
                body_length: u32::try_from(body.len()).unwrap_or(u32::MAX),
            },
            body,
        }
    }

    pub fn login_req(credentials: impl Into<Bytes>) -> Self {
        Self::new(MessageType::LoginReq, credentials)
    }

    pub fn login_resp(status: u8) -> Self {
        Self::new(MessageType::LoginResp, vec![status])
    }

    pub fn heartbeat_req() -> Self {
        Self::new(MessageType::HeartbeatReq, Bytes::new())
    }

    pub fn heartbeat_resp() -> Self {
        Self::new(MessageType::HeartbeatResp, Bytes::new())
    }

    pub fn data(payload: impl Into<Bytes>) -> Self {
        Self::new(MessageType::Data, payload)
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn msg_type(&self) -> MessageType {
        self.header.msg_type
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Status byte of a `LOGIN_RESP`, `None` for any other type.
    pub fn login_status(&self) -> Option<u8> {
        match self.header.msg_type {
            MessageType::LoginResp => self.body.first().copied(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_codes() {
        assert_eq!(MessageType::LoginReq.code(), 1);
        assert_eq!(MessageType::Data.code(), 5);
        assert_eq!(MessageType::try_from(4), Ok(MessageType::HeartbeatResp));
        assert_eq!(
            MessageType::try_from(9),
            Err(FramingError::UnknownType(9))
        );
    }

    #[test]
    fn test_body_length_follows_body() {
        let msg = Message::data(&b"hello"[..]);
        assert_eq!(msg.header().body_length(), 5);
        assert_eq!(Message::heartbeat_req().header().body_length(), 0);
    }

    #[test]
    fn test_login_status() {
        assert_eq!(Message::login_resp(0).login_status(), Some(0));
        assert_eq!(Message::login_resp(7).login_status(), Some(7));
        assert_eq!(Message::heartbeat_resp().login_status(), None);
    }
}

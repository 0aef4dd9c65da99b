//! Upper-layer hook.
//!
//! Login and heartbeat frames never reach the application; everything else
//! arrives here in wire order. Replies are queued on the session with
//! [`Session::send`] or [`Session::enqueue_write`].

use crate::error::{CloseReason, SessionError};
use crate::protocol::{Message, MessageType};
use crate::runtime::session::{Session, SessionId};
use tracing::{debug, trace};

pub trait Application: Send {
    /// The socket is usable: accepted (server) or connected (client).
    fn on_accept(&mut self, _session: &mut Session) {}

    /// A message no stage consumed. An error closes this session only.
    fn on_message(&mut self, _session: &mut Session, _msg: Message) -> Result<(), SessionError> {
        Ok(())
    }

    /// The session is gone. Called exactly once per session.
    fn on_close(&mut self, _id: SessionId, _reason: &CloseReason) {}
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct Noop;

impl Application for Noop {}

/// Sends every DATA payload back to its sender.
#[derive(Debug, Default)]
pub struct Echo;

impl Application for Echo {
    fn on_message(&mut self, session: &mut Session, msg: Message) -> Result<(), SessionError> {
        if msg.msg_type() != MessageType::Data {
            return Ok(());
        }
        trace!(conn_id = session.id(), len = msg.body().len(), "Echo");
        session.send(&Message::data(msg.into_body()))
    }
}

/// The only order [`TimeQuery`] answers.
pub const TIME_ORDER: &str = "QUERY TIME ORDER";

/// Reply to an unknown order.
pub const BAD_ORDER: &str = "BAD ORDER";

/// Answers a DATA `QUERY TIME ORDER` with the server's local time.
///
/// The order is matched case-insensitively; a trailing line ending is
/// ignored. Anything else gets `BAD ORDER`.
#[derive(Debug, Default)]
pub struct TimeQuery;

impl TimeQuery {
    fn reply(order: &[u8]) -> String {
        let order = String::from_utf8_lossy(order);
        if order.trim_end_matches(['\r', '\n']).eq_ignore_ascii_case(TIME_ORDER) {
            chrono::Local::now().to_rfc2822()
        } else {
            BAD_ORDER.to_string()
        }
    }
}

impl Application for TimeQuery {
    fn on_message(&mut self, session: &mut Session, msg: Message) -> Result<(), SessionError> {
        if msg.msg_type() != MessageType::Data {
            return Ok(());
        }
        let reply = Self::reply(msg.body());
        debug!(conn_id = session.id(), order = %String::from_utf8_lossy(msg.body()), "Time order");
        session.send(&Message::data(reply.into_bytes()))
    }
}

//! Inbound processing stages.
//!
//! Every decoded message walks [`PIPELINE`] in order. A stage either consumes
//! the message or hands it, unchanged, to the next one. Whatever survives the
//! last stage goes to the application.
//!
//! Stages hold no state; everything they mutate belongs to the session or
//! the reactor's timer queue and is lent for the duration of one message.

pub mod heartbeat;
pub mod login;

pub use login::{AcceptAll, AllowList, LoginPolicy};

use crate::error::SessionError;
use crate::protocol::Message;
use crate::runtime::session::Session;
use crate::runtime::timer::TimerQueue;
use std::time::{Duration, Instant};

/// Borrowed state a stage may act on.
pub struct StageContext<'a> {
    pub session: &'a mut Session,
    pub timers: &'a mut TimerQueue,
    pub policy: &'a dyn LoginPolicy,
    pub heartbeat_interval: Duration,
    pub now: Instant,
}

/// Outcome of one stage.
#[derive(Debug)]
pub enum Flow {
    Consumed,
    Forward(Message),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Login,
    Heartbeat,
}

/// Stage order for every session, client or server.
pub const PIPELINE: [Stage; 2] = [Stage::Login, Stage::Heartbeat];

impl Stage {
    fn handle(self, ctx: &mut StageContext<'_>, msg: Message) -> Result<Flow, SessionError> {
        match self {
            Stage::Login => login::handle(ctx, msg),
            Stage::Heartbeat => heartbeat::handle(ctx, msg),
        }
    }
}

/// Run `msg` through the pipeline. Returns the message if no stage took it.
pub fn dispatch(ctx: &mut StageContext<'_>, msg: Message) -> Result<Option<Message>, SessionError> {
    let mut msg = msg;
    for stage in PIPELINE {
        match stage.handle(ctx, msg)? {
            Flow::Consumed => return Ok(None),
            Flow::Forward(next) => msg = next,
        }
        // A stage may have started closing the session.
        if !ctx.session.accepts_input() {
            return Ok(None);
        }
    }
    Ok(Some(msg))
}

//! Heartbeat stage.
//!
//! Client: once login succeeds, a recurring timer sends `HEARTBEAT_REQ`
//! every period. Responses are only logged; a heartbeat is not a lease.
//! Server: answers each `HEARTBEAT_REQ` with `HEARTBEAT_RESP`.

use super::{Flow, StageContext};
use crate::error::SessionError;
use crate::protocol::{Message, MessageType};
use crate::runtime::session::{Role, Session};
use tracing::trace;

pub(super) fn handle(ctx: &mut StageContext<'_>, msg: Message) -> Result<Flow, SessionError> {
    match (ctx.session.role(), msg.msg_type()) {
        (Role::Client, MessageType::LoginResp) if ctx.session.is_authenticated() => {
            ctx.session
                .start_heartbeat(ctx.timers, ctx.heartbeat_interval, ctx.now);
            trace!(
                conn_id = ctx.session.id(),
                interval_ms = ctx.heartbeat_interval.as_millis() as u64,
                "Heartbeat scheduled"
            );
            Ok(Flow::Consumed)
        }
        (Role::Client, MessageType::HeartbeatResp) => {
            trace!(conn_id = ctx.session.id(), "Heartbeat response received");
            Ok(Flow::Consumed)
        }
        (Role::Server, MessageType::HeartbeatReq) => {
            trace!(conn_id = ctx.session.id(), "Heartbeat request received");
            ctx.session.send(&Message::heartbeat_resp())?;
            Ok(Flow::Consumed)
        }
        _ => Ok(Flow::Forward(msg)),
    }
}

/// Timer callback: queue one heartbeat request.
pub fn on_tick(session: &mut Session) -> Result<(), SessionError> {
    if !session.is_authenticated() {
        return Err(SessionError::Timer(format!(
            "tick on {:?} session",
            session.state()
        )));
    }
    session
        .send(&Message::heartbeat_req())
        .map_err(|e| SessionError::Timer(e.to_string()))?;
    trace!(conn_id = session.id(), "Heartbeat request queued");
    Ok(())
}

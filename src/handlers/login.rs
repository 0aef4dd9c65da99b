//! Login handshake stage.
//!
//! The client sends `LOGIN_REQ` as soon as its socket is connected and
//! closes on any nonzero `LOGIN_RESP` status. The server evaluates a
//! [`LoginPolicy`] and answers with the resulting status byte.

use super::{Flow, StageContext};
use crate::error::SessionError;
use crate::protocol::{Message, MessageType, LOGIN_ACCEPTED, LOGIN_REJECTED};
use crate::runtime::session::{Role, Session, SessionState};
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, info, warn};

/// Server-side acceptance rule for login requests.
pub trait LoginPolicy: Send {
    fn accept(&self, peer: SocketAddr, credentials: &[u8]) -> bool;
}

/// Accepts every login.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl LoginPolicy for AcceptAll {
    fn accept(&self, _peer: SocketAddr, _credentials: &[u8]) -> bool {
        true
    }
}

/// Accepts logins only from the listed peer addresses.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    peers: Vec<IpAddr>,
}

impl AllowList {
    pub fn new(peers: Vec<IpAddr>) -> Self {
        Self { peers }
    }
}

impl LoginPolicy for AllowList {
    fn accept(&self, peer: SocketAddr, _credentials: &[u8]) -> bool {
        self.peers.contains(&peer.ip())
    }
}

impl<F> LoginPolicy for F
where
    F: Fn(SocketAddr, &[u8]) -> bool + Send,
{
    fn accept(&self, peer: SocketAddr, credentials: &[u8]) -> bool {
        self(peer, credentials)
    }
}

/// Client side: the socket just connected, start the handshake.
pub fn on_connected(session: &mut Session, credentials: &[u8]) -> Result<(), SessionError> {
    session.transition(SessionState::AwaitingLogin)?;
    session.send(&Message::login_req(credentials.to_vec()))?;
    debug!(conn_id = session.id(), peer = %session.peer(), "Sent login request");
    Ok(())
}

pub(super) fn handle(ctx: &mut StageContext<'_>, msg: Message) -> Result<Flow, SessionError> {
    match ctx.session.role() {
        Role::Client => handle_client(ctx, msg),
        Role::Server => handle_server(ctx, msg),
    }
}

fn handle_client(ctx: &mut StageContext<'_>, msg: Message) -> Result<Flow, SessionError> {
    if msg.msg_type() != MessageType::LoginResp {
        return Ok(Flow::Forward(msg));
    }

    if ctx.session.state() != SessionState::AwaitingLogin {
        return Err(SessionError::Protocol(format!(
            "unexpected login response in {:?}",
            ctx.session.state()
        )));
    }

    // The codec guarantees a one-byte body.
    let status = msg.login_status().unwrap_or(LOGIN_REJECTED);
    if status != LOGIN_ACCEPTED {
        return Err(SessionError::AuthRejected { status });
    }

    ctx.session.transition(SessionState::Authenticated)?;
    info!(conn_id = ctx.session.id(), peer = %ctx.session.peer(), "Login accepted");

    // The heartbeat stage starts its timer off this same message.
    Ok(Flow::Forward(msg))
}

fn handle_server(ctx: &mut StageContext<'_>, msg: Message) -> Result<Flow, SessionError> {
    let state = ctx.session.state();

    match (msg.msg_type(), state) {
        (MessageType::LoginReq, SessionState::AwaitingLogin) => {}
        (MessageType::LoginReq, _) => {
            return Err(SessionError::Protocol("duplicate login request".into()));
        }
        (_, SessionState::Authenticated) => return Ok(Flow::Forward(msg)),
        (other, _) => {
            return Err(SessionError::Protocol(format!(
                "{other:?} received before login"
            )));
        }
    }

    let peer = ctx.session.peer();
    if ctx.policy.accept(peer, msg.body()) {
        ctx.session.send(&Message::login_resp(LOGIN_ACCEPTED))?;
        ctx.session.transition(SessionState::Authenticated)?;
        info!(conn_id = ctx.session.id(), peer = %peer, "Login accepted");
    } else {
        ctx.session.send(&Message::login_resp(LOGIN_REJECTED))?;
        ctx.session.begin_close(ctx.timers);
        warn!(conn_id = ctx.session.id(), peer = %peer, "Login rejected");
    }

    Ok(Flow::Consumed)
}

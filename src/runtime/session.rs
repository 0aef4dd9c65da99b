//! Per-connection session state machine.
//!
//! A `Session` owns everything mutable about one connection except the
//! socket, which sits next to it in the reactor's registration entry.
//!
//! ```text
//! Connecting -> AwaitingLogin -> Authenticated
//!      |              |               |
//!      +--------------+---------------+--> Closing -> Closed
//! ```

use crate::error::{FramingError, SessionError};
use crate::protocol::{encode, FrameDecoder, Message, MAX_BODY_LEN};
use crate::runtime::timer::{TimerHandle, TimerQueue};
use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Slab key of a session in the reactor, also its mio token.
pub type SessionId = usize;

/// Which end of the handshake this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates login and sends heartbeats.
    Client,
    /// Answers login and heartbeats.
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    AwaitingLogin,
    Authenticated,
    Closing,
    Closed,
}

impl SessionState {
    fn can_become(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, AwaitingLogin)
                | (AwaitingLogin, Authenticated)
                | (Connecting | AwaitingLogin | Authenticated, Closing)
                | (Closing, Closed)
        )
    }
}

/// One connection's protocol state.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    role: Role,
    peer: SocketAddr,
    state: SessionState,
    decoder: FrameDecoder,
    max_body: usize,
    outbound: BytesMut,
    heartbeat: Option<TimerHandle>,
    frames_in: u64,
    frames_out: u64,
    bytes_out: u64,
}

impl Session {
    pub fn new(id: SessionId, role: Role, peer: SocketAddr, max_frame_body: usize) -> Self {
        Self {
            id,
            role,
            peer,
            state: SessionState::Connecting,
            decoder: FrameDecoder::new(max_frame_body),
            max_body: max_frame_body.min(MAX_BODY_LEN),
            outbound: BytesMut::new(),
            heartbeat: None,
            frames_in: 0,
            frames_out: 0,
            bytes_out: 0,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == SessionState::Authenticated
    }

    /// Whether inbound frames should still be processed.
    pub fn accepts_input(&self) -> bool {
        matches!(
            self.state,
            SessionState::AwaitingLogin | SessionState::Authenticated
        )
    }

    /// Move along the state machine, rejecting edges it does not have.
    pub fn transition(&mut self, next: SessionState) -> Result<(), SessionError> {
        if !self.state.can_become(next) {
            return Err(SessionError::Protocol(format!(
                "invalid transition {:?} -> {:?}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Queue a message for sending.
    ///
    /// Bodies over the session's frame limit are refused, the same limit the
    /// peer applies when decoding.
    pub fn send(&mut self, msg: &Message) -> Result<(), SessionError> {
        self.check_writable()?;
        let len = msg.body().len();
        if len > self.max_body {
            return Err(FramingError::BodyTooLarge {
                len,
                max: self.max_body,
            }
            .into());
        }
        let before = self.outbound.len();
        encode(msg, &mut self.outbound);
        self.frames_out += 1;
        self.bytes_out += (self.outbound.len() - before) as u64;
        Ok(())
    }

    /// Queue already-encoded bytes, for upper layers that frame themselves.
    /// Counted in `bytes_out` only, since the frame count is unknown.
    pub fn enqueue_write(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        self.check_writable()?;
        self.outbound.extend_from_slice(bytes);
        self.bytes_out += bytes.len() as u64;
        Ok(())
    }

    fn check_writable(&self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Closing | SessionState::Closed => Err(SessionError::Protocol(format!(
                "write on {:?} session",
                self.state
            ))),
            _ => Ok(()),
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.outbound.is_empty()
    }

    pub fn pending_bytes(&self) -> &[u8] {
        &self.outbound
    }

    /// Drop `n` bytes the socket accepted.
    pub fn consume_written(&mut self, n: usize) {
        self.outbound.advance(n);
    }

    pub fn decoder_mut(&mut self) -> &mut FrameDecoder {
        &mut self.decoder
    }

    pub(crate) fn record_inbound(&mut self) {
        self.frames_in += 1;
    }

    pub fn frames_in(&self) -> u64 {
        self.frames_in
    }

    /// Messages queued through [`Session::send`].
    pub fn frames_out(&self) -> u64 {
        self.frames_out
    }

    /// Every byte queued for the peer, framed or raw.
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    pub fn heartbeat(&self) -> Option<TimerHandle> {
        self.heartbeat
    }

    /// Start the recurring heartbeat. Any previous timer is cancelled first,
    /// so a session never owns two.
    pub fn start_heartbeat(&mut self, timers: &mut TimerQueue, period: Duration, now: Instant) {
        self.cancel_heartbeat(timers);
        self.heartbeat = Some(timers.schedule_recurring(self.id, period, now));
    }

    /// Cancel the heartbeat if one is running. Safe to call repeatedly.
    pub fn cancel_heartbeat(&mut self, timers: &mut TimerQueue) {
        if let Some(handle) = self.heartbeat.take() {
            timers.cancel(handle);
        }
    }

    /// Stop reading and release the timer; queued bytes may still flush.
    pub fn begin_close(&mut self, timers: &mut TimerQueue) {
        self.cancel_heartbeat(timers);
        if self.state != SessionState::Closing && self.state != SessionState::Closed {
            self.state = SessionState::Closing;
        }
    }

    /// Terminal step. Idempotent.
    pub fn mark_closed(&mut self, timers: &mut TimerQueue) {
        self.begin_close(timers);
        self.state = SessionState::Closed;
        self.outbound.clear();
    }
}

//! mio reactor.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls. Uses epoll on Linux, kqueue on
//! macOS.
//!
//! One thread drives one `Reactor`. All sessions, timers and the registry are
//! touched only from that thread; the only cross-thread entry point is
//! [`StopHandle::stop`].
//!
//! Failures are confined to the session that raised them: the session is
//! torn down (timer cancelled, socket deregistered and closed) and the loop
//! carries on with the rest.

use crate::config::Config;
use crate::error::{CloseReason, SessionError};
use crate::handlers::{self, heartbeat, login, AcceptAll, LoginPolicy, StageContext};
use crate::runtime::application::{Application, Noop};
use crate::runtime::session::{Role, Session, SessionId, SessionState};
use crate::runtime::timer::TimerQueue;
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Registry entry: the socket, the interest it is registered with, and its
/// session.
struct Registration {
    stream: TcpStream,
    interest: Interest,
    session: Session,
}

#[derive(Debug, Clone, Copy)]
struct Readiness {
    readable: bool,
    error: bool,
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            readable: event.is_readable() || event.is_read_closed(),
            error: event.is_error(),
        }
    }
}

/// Requests a running reactor to stop. Cheap to clone, safe from any thread.
#[derive(Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake reactor");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Single-threaded event loop serving client and/or server sessions.
pub struct Reactor {
    poll: Poll,
    events: Events,
    listener: Option<TcpListener>,
    sessions: Slab<Registration>,
    timers: TimerQueue,
    policy: Box<dyn LoginPolicy>,
    app: Box<dyn Application>,
    scratch: Vec<u8>,
    heartbeat_interval: Duration,
    poll_timeout: Duration,
    max_frame_body: usize,
    max_connections: usize,
    credentials: Vec<u8>,
    stop: StopHandle,
}

impl Reactor {
    pub fn new(config: &Config) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(config.events_capacity.max(1)),
            listener: None,
            sessions: Slab::with_capacity(config.max_connections.min(1024)),
            timers: TimerQueue::new(),
            policy: Box::new(AcceptAll),
            app: Box::new(Noop),
            scratch: vec![0u8; config.read_buffer_size.max(1)],
            heartbeat_interval: config.heartbeat_interval(),
            poll_timeout: config.poll_timeout(),
            max_frame_body: config.max_frame_body,
            max_connections: config.max_connections,
            credentials: config.credentials.as_bytes().to_vec(),
            stop: StopHandle {
                flag: Arc::new(AtomicBool::new(false)),
                waker: Arc::new(waker),
            },
        })
    }

    pub fn with_application(mut self, app: impl Application + 'static) -> Self {
        self.app = Box::new(app);
        self
    }

    pub fn with_login_policy(mut self, policy: impl LoginPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Bind the listening socket. Returns the bound address.
    pub fn listen(&mut self, addr: SocketAddr) -> io::Result<SocketAddr> {
        let listener = create_listener(addr)?;
        let mut listener = TcpListener::from_std(listener);
        self.poll
            .registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let local = listener.local_addr()?;
        info!(addr = %local, "Listening");
        self.listener = Some(listener);
        Ok(local)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Start a non-blocking connect. The session logs in once the socket
    /// reports connected.
    pub fn connect(&mut self, addr: SocketAddr) -> io::Result<SessionId> {
        if self.sessions.len() >= self.max_connections {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "connection limit reached",
            ));
        }

        let mut stream = TcpStream::connect(addr)?;
        let entry = self.sessions.vacant_entry();
        let id = entry.key();

        // Writable signals connect completion.
        let interest = Interest::READABLE | Interest::WRITABLE;
        self.poll.registry().register(&mut stream, Token(id), interest)?;

        entry.insert(Registration {
            stream,
            interest,
            session: Session::new(id, Role::Client, addr, self.max_frame_body),
        });

        debug!(conn_id = id, peer = %addr, "Connecting");
        Ok(id)
    }

    /// Loop until [`StopHandle::stop`] is called, then close every session.
    pub fn run(&mut self) -> io::Result<()> {
        info!(
            heartbeat_ms = self.heartbeat_interval.as_millis() as u64,
            max_frame_body = self.max_frame_body,
            max_connections = self.max_connections,
            "Reactor running"
        );

        while !self.stop.is_stopped() {
            self.turn(None)?;
        }

        self.shutdown();
        info!("Reactor stopped");
        Ok(())
    }

    /// One poll-and-dispatch iteration.
    ///
    /// Waits at most `timeout` (capped by the configured poll timeout and the
    /// next timer deadline).
    pub fn turn(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let now = Instant::now();
        let mut wait = timeout.map_or(self.poll_timeout, |t| t.min(self.poll_timeout));
        if let Some(deadline) = self.timers.next_deadline() {
            wait = wait.min(deadline.saturating_duration_since(now));
        }

        match self.poll.poll(&mut self.events, Some(wait)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        let ready: Vec<(Token, Readiness)> = self
            .events
            .iter()
            .map(|event| (event.token(), Readiness::from(event)))
            .collect();

        // Accepts run after session events so a slot freed in this batch is
        // never handed to a new session while stale events for it remain.
        let mut accept_ready = false;
        for (token, readiness) in ready {
            match token {
                LISTENER_TOKEN => accept_ready = true,
                WAKER_TOKEN => trace!("Reactor woken"),
                Token(conn_id) => self.handle_event(conn_id, readiness),
            }
        }

        if accept_ready {
            self.accept_connections();
        }

        self.fire_timers(Instant::now());
        Ok(())
    }

    /// Close every session and release the listener.
    pub fn shutdown(&mut self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|(id, _)| id).collect();
        for id in ids {
            self.close_session(id, CloseReason::Shutdown);
        }
        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
        }
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(id).map(|reg| &reg.session)
    }

    pub fn session_state(&self, id: SessionId) -> Option<SessionState> {
        self.session(id).map(Session::state)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Live heartbeat timers across all sessions.
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    pub fn timers_for(&self, id: SessionId) -> usize {
        self.timers.active_for(id)
    }

    fn handle_event(&mut self, conn_id: SessionId, readiness: Readiness) {
        match self.drive_session(conn_id, readiness) {
            Ok(None) => {}
            Ok(Some(reason)) => self.close_session(conn_id, reason),
            Err(e) => self.close_session(conn_id, CloseReason::Failed(e)),
        }
    }

    fn drive_session(
        &mut self,
        conn_id: SessionId,
        readiness: Readiness,
    ) -> Result<Option<CloseReason>, SessionError> {
        let Some(reg) = self.sessions.get_mut(conn_id) else {
            return Ok(None);
        };

        if reg.session.state() == SessionState::Connecting {
            if !finish_connect(&mut reg.stream)? {
                return Ok(None);
            }
            if let Err(e) = reg.stream.set_nodelay(true) {
                debug!(conn_id, error = %e, "Failed to set TCP_NODELAY");
            }
            login::on_connected(&mut reg.session, &self.credentials)?;
            debug!(conn_id, peer = %reg.session.peer(), "Connected");
            self.app.on_accept(&mut reg.session);
        } else if readiness.error {
            if let Some(e) = reg.stream.take_error()? {
                return Err(e.into());
            }
        }

        if readiness.readable {
            if let Some(reason) = self.read_session(conn_id)? {
                return Ok(Some(reason));
            }
        }

        self.flush_session(conn_id)
    }

    /// Read until the socket would block, dispatching every complete frame.
    fn read_session(&mut self, conn_id: SessionId) -> Result<Option<CloseReason>, SessionError> {
        loop {
            let Some(reg) = self.sessions.get_mut(conn_id) else {
                return Ok(None);
            };
            if !reg.session.accepts_input() {
                return Ok(None);
            }

            match reg.stream.read(&mut self.scratch) {
                Ok(0) => {
                    // Complete frames were delivered as they arrived; only a
                    // partial one can be left.
                    reg.session.decoder_mut().finish()?;
                    return Ok(Some(CloseReason::PeerClosed));
                }
                Ok(n) => {
                    reg.session.decoder_mut().extend(&self.scratch[..n]);
                    deliver(
                        &mut reg.session,
                        &mut self.timers,
                        &*self.policy,
                        &mut *self.app,
                        self.heartbeat_interval,
                    )?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Write what the socket takes, then sync the registered interest.
    fn flush_session(&mut self, conn_id: SessionId) -> Result<Option<CloseReason>, SessionError> {
        let Some(reg) = self.sessions.get_mut(conn_id) else {
            return Ok(None);
        };

        if reg.session.state() != SessionState::Connecting {
            flush(reg)?;
        }

        if reg.session.state() == SessionState::Closing && !reg.session.has_pending_writes() {
            // Only a rejecting server lingers in Closing to flush its reply.
            return Ok(Some(CloseReason::LoginRejected));
        }

        update_interest(self.poll.registry(), conn_id, reg)?;
        Ok(None)
    }

    fn accept_connections(&mut self) {
        let mut accepted = Vec::new();

        if let Some(listener) = &self.listener {
            loop {
                match listener.accept() {
                    Ok(pair) => accepted.push(pair),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        error!("Accept error: {}", e);
                        break;
                    }
                }
            }
        }

        for (stream, peer) in accepted {
            if self.sessions.len() >= self.max_connections {
                warn!(peer = %peer, "Connection limit reached");
                continue;
            }
            if let Err(e) = self.open_server_session(stream, peer) {
                warn!(peer = %peer, error = %e, "Failed to open session");
            }
        }
    }

    fn open_server_session(
        &mut self,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), SessionError> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let entry = self.sessions.vacant_entry();
        let conn_id = entry.key();

        let mut session = Session::new(conn_id, Role::Server, peer, self.max_frame_body);
        // Accepted sockets are usable at once; wait for the client's login.
        session.transition(SessionState::AwaitingLogin)?;

        self.poll
            .registry()
            .register(&mut stream, Token(conn_id), Interest::READABLE)?;

        let reg = entry.insert(Registration {
            stream,
            interest: Interest::READABLE,
            session,
        });
        debug!(conn_id, peer = %peer, "Accepted connection");
        self.app.on_accept(&mut reg.session);

        match self.flush_session(conn_id) {
            Ok(None) => {}
            Ok(Some(reason)) => self.close_session(conn_id, reason),
            Err(e) => self.close_session(conn_id, CloseReason::Failed(e)),
        }
        Ok(())
    }

    fn fire_timers(&mut self, now: Instant) {
        for (handle, conn_id) in self.timers.expired(now) {
            let tick = match self.sessions.get_mut(conn_id) {
                Some(reg) if reg.session.heartbeat() == Some(handle) => {
                    heartbeat::on_tick(&mut reg.session)
                }
                _ => {
                    debug!(conn_id, "Dropping stale heartbeat timer");
                    self.timers.cancel(handle);
                    continue;
                }
            };

            if let Err(e) = tick {
                self.close_session(conn_id, CloseReason::Failed(e));
                continue;
            }

            match self.flush_session(conn_id) {
                Ok(None) => {}
                Ok(Some(reason)) => self.close_session(conn_id, reason),
                Err(e) => self.close_session(conn_id, CloseReason::Failed(e)),
            }
        }
    }

    /// Tear a session down: cancel its timer, deregister and close the
    /// socket, tell the application. A no-op for unknown ids.
    fn close_session(&mut self, conn_id: SessionId, reason: CloseReason) {
        let Some(mut reg) = self.sessions.try_remove(conn_id) else {
            return;
        };

        reg.session.mark_closed(&mut self.timers);
        if let Err(e) = self.poll.registry().deregister(&mut reg.stream) {
            debug!(conn_id, error = %e, "Deregister failed");
        }

        let peer = reg.session.peer();
        let frames_in = reg.session.frames_in();
        let frames_out = reg.session.frames_out();
        let bytes_out = reg.session.bytes_out();
        match &reason {
            CloseReason::PeerClosed | CloseReason::Shutdown => {
                debug!(
                    conn_id,
                    peer = %peer,
                    reason = %reason,
                    frames_in,
                    frames_out,
                    bytes_out,
                    "Session closed"
                );
            }
            CloseReason::LoginRejected => {
                info!(conn_id, peer = %peer, "Session closed after rejected login");
            }
            CloseReason::Failed(SessionError::Io(e)) => {
                debug!(conn_id, peer = %peer, error = %e, "Session closed on I/O error");
            }
            CloseReason::Failed(e @ SessionError::Timer(_)) => {
                error!(conn_id, peer = %peer, error = %e, "Session closed on timer failure");
            }
            CloseReason::Failed(e) => {
                warn!(conn_id, peer = %peer, error = %e, "Session closed");
            }
        }

        self.app.on_close(conn_id, &reason);
        // Dropping the stream closes the socket.
        drop(reg);
    }
}

/// Drain complete frames through the stage pipeline and on to the app.
fn deliver(
    session: &mut Session,
    timers: &mut TimerQueue,
    policy: &dyn LoginPolicy,
    app: &mut dyn Application,
    heartbeat_interval: Duration,
) -> Result<(), SessionError> {
    while session.accepts_input() {
        let Some(msg) = session.decoder_mut().next_message()? else {
            break;
        };
        session.record_inbound();
        trace!(
            conn_id = session.id(),
            msg_type = ?msg.msg_type(),
            len = msg.body().len(),
            "Frame received"
        );

        let mut ctx = StageContext {
            session: &mut *session,
            timers: &mut *timers,
            policy,
            heartbeat_interval,
            now: Instant::now(),
        };
        if let Some(msg) = handlers::dispatch(&mut ctx, msg)? {
            app.on_message(session, msg)?;
        }
    }
    Ok(())
}

fn flush(reg: &mut Registration) -> io::Result<()> {
    while reg.session.has_pending_writes() {
        match reg.stream.write(reg.session.pending_bytes()) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => reg.session.consume_written(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// WRITE interest is held only while connecting or while bytes are queued.
fn update_interest(registry: &Registry, conn_id: SessionId, reg: &mut Registration) -> io::Result<()> {
    let wanted = if reg.session.state() == SessionState::Connecting || reg.session.has_pending_writes()
    {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    };

    if wanted != reg.interest {
        registry.reregister(&mut reg.stream, Token(conn_id), wanted)?;
        reg.interest = wanted;
    }
    Ok(())
}

/// Returns `Ok(false)` while the connect is still in progress.
fn finish_connect(stream: &mut TcpStream) -> Result<bool, SessionError> {
    if let Some(e) = stream.take_error()? {
        return Err(e.into());
    }
    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests;

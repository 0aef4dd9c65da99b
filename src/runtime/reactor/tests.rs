use super::*;
use crate::protocol::{encode_to_vec, FrameDecoder, Message, MessageType};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpListener as StdListener, TcpStream as StdStream};
use std::sync::Mutex;
use std::thread;

const STEP: Duration = Duration::from_millis(5);
const PATIENCE: Duration = Duration::from_secs(3);

fn test_config(heartbeat_ms: u64) -> Config {
    Config {
        heartbeat_interval_ms: heartbeat_ms,
        poll_timeout_ms: 20,
        max_frame_body: 64,
        ..Config::default()
    }
}

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[derive(Default)]
struct Log {
    accepted: Vec<SessionId>,
    messages: Vec<Message>,
    closed: Vec<(SessionId, &'static str)>,
}

/// Application that records every callback.
#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Log>>);

impl Recorder {
    fn log(&self) -> std::sync::MutexGuard<'_, Log> {
        self.0.lock().unwrap()
    }
}

fn kind(reason: &CloseReason) -> &'static str {
    match reason {
        CloseReason::PeerClosed => "peer_closed",
        CloseReason::Shutdown => "shutdown",
        CloseReason::LoginRejected => "login_rejected",
        CloseReason::Failed(SessionError::Framing(_)) => "framing",
        CloseReason::Failed(SessionError::AuthRejected { .. }) => "auth_rejected",
        CloseReason::Failed(SessionError::Io(_)) => "io",
        CloseReason::Failed(SessionError::Timer(_)) => "timer",
        CloseReason::Failed(SessionError::Protocol(_)) => "protocol",
    }
}

impl Application for Recorder {
    fn on_accept(&mut self, session: &mut Session) {
        self.log().accepted.push(session.id());
    }

    fn on_message(&mut self, _session: &mut Session, msg: Message) -> Result<(), SessionError> {
        self.log().messages.push(msg);
        Ok(())
    }

    fn on_close(&mut self, id: SessionId, reason: &CloseReason) {
        self.log().closed.push((id, kind(reason)));
    }
}

/// The remote end of a connection, driven from the test thread.
struct Peer {
    stream: StdStream,
    decoder: FrameDecoder,
    eof: bool,
}

impl Peer {
    fn new(stream: StdStream) -> Self {
        stream.set_nonblocking(true).unwrap();
        Self {
            stream,
            decoder: FrameDecoder::new(1024),
            eof: false,
        }
    }

    fn connect(addr: SocketAddr) -> Self {
        Self::new(StdStream::connect(addr).unwrap())
    }

    fn send(&mut self, msg: &Message) {
        self.send_raw(&encode_to_vec(msg));
    }

    fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    fn fill(&mut self) {
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    self.eof = true;
                    return;
                }
                Ok(n) => self.decoder.extend(&buf[..n]),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(ref e)
                    if matches!(
                        e.kind(),
                        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
                    ) =>
                {
                    self.eof = true;
                    return;
                }
                Err(e) => panic!("peer read failed: {e}"),
            }
        }
    }

    /// Turn the reactor until this peer has a frame, or it sees EOF.
    fn recv(&mut self, reactor: &mut Reactor) -> Option<Message> {
        let deadline = Instant::now() + PATIENCE;
        while Instant::now() < deadline {
            if let Some(msg) = self.decoder.next_message().unwrap() {
                return Some(msg);
            }
            if self.eof {
                return None;
            }
            reactor.turn(Some(STEP)).unwrap();
            self.fill();
        }
        panic!("timed out waiting for a frame");
    }
}

fn pump_until(reactor: &mut Reactor, mut done: impl FnMut(&Reactor) -> bool) {
    let deadline = Instant::now() + PATIENCE;
    while !done(reactor) {
        assert!(Instant::now() < deadline, "timed out pumping reactor");
        reactor.turn(Some(STEP)).unwrap();
    }
}

fn pump_for(reactor: &mut Reactor, duration: Duration) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        reactor.turn(Some(STEP)).unwrap();
    }
}

fn server(recorder: &Recorder) -> (Reactor, SocketAddr) {
    let mut reactor = Reactor::new(&test_config(5000))
        .unwrap()
        .with_application(recorder.clone());
    let addr = reactor.listen(loopback()).unwrap();
    (reactor, addr)
}

#[test]
fn test_server_login_then_heartbeat() {
    let recorder = Recorder::default();
    let (mut reactor, addr) = server(&recorder);
    let mut peer = Peer::connect(addr);

    peer.send(&Message::login_req(&b""[..]));
    assert_eq!(peer.recv(&mut reactor), Some(Message::login_resp(0)));

    let id = recorder.log().accepted[0];
    assert_eq!(reactor.session_state(id), Some(SessionState::Authenticated));

    peer.send(&Message::heartbeat_req());
    assert_eq!(peer.recv(&mut reactor), Some(Message::heartbeat_resp()));

    // The server never schedules heartbeats of its own.
    assert_eq!(reactor.timer_count(), 0);
    assert!(recorder.log().messages.is_empty());
}

#[test]
fn test_server_pipelined_frames_in_order() {
    let recorder = Recorder::default();
    let (mut reactor, addr) = server(&recorder);
    let mut peer = Peer::connect(addr);

    let mut burst = Vec::new();
    burst.extend(encode_to_vec(&Message::login_req(&b""[..])));
    burst.extend(encode_to_vec(&Message::data(&b"first"[..])));
    burst.extend(encode_to_vec(&Message::heartbeat_req()));
    burst.extend(encode_to_vec(&Message::data(&b"second"[..])));
    peer.send_raw(&burst);

    assert_eq!(peer.recv(&mut reactor), Some(Message::login_resp(0)));
    assert_eq!(peer.recv(&mut reactor), Some(Message::heartbeat_resp()));

    let log = recorder.log();
    assert_eq!(
        log.messages,
        vec![Message::data(&b"first"[..]), Message::data(&b"second"[..])]
    );
}

#[test]
fn test_server_rejects_login_and_closes() {
    let recorder = Recorder::default();
    let mut reactor = Reactor::new(&test_config(5000))
        .unwrap()
        .with_application(recorder.clone())
        .with_login_policy(|_peer: SocketAddr, _creds: &[u8]| false);
    let addr = reactor.listen(loopback()).unwrap();
    let mut peer = Peer::connect(addr);

    peer.send(&Message::login_req(&b""[..]));
    assert_eq!(peer.recv(&mut reactor), Some(Message::login_resp(1)));
    assert_eq!(peer.recv(&mut reactor), None);

    assert_eq!(reactor.session_count(), 0);
    let log = recorder.log();
    assert_eq!(log.closed.len(), 1);
    assert_eq!(log.closed[0].1, "login_rejected");
}

#[test]
fn test_oversized_frame_closes_session() {
    let recorder = Recorder::default();
    let (mut reactor, addr) = server(&recorder);
    let mut peer = Peer::connect(addr);

    peer.send(&Message::login_req(&b""[..]));
    assert_eq!(peer.recv(&mut reactor), Some(Message::login_resp(0)));

    // Declares 256 bytes against a 64 byte limit.
    peer.send_raw(&[MessageType::Data.code(), 0, 0, 1, 0, 1, 2, 3]);
    pump_until(&mut reactor, |r| r.session_count() == 0);

    let log = recorder.log();
    assert!(log.messages.is_empty());
    assert_eq!(log.closed[0].1, "framing");
}

#[test]
fn test_partial_frame_at_eof_is_framing_error() {
    let recorder = Recorder::default();
    let (mut reactor, addr) = server(&recorder);
    let mut peer = Peer::connect(addr);

    peer.send(&Message::login_req(&b""[..]));
    assert_eq!(peer.recv(&mut reactor), Some(Message::login_resp(0)));

    peer.send(&Message::data(&b"whole"[..]));
    peer.send_raw(&[MessageType::Data.code(), 0, 0, 0, 10, 1, 2, 3, 4]);
    peer.stream.shutdown(Shutdown::Write).unwrap();
    pump_until(&mut reactor, |r| r.session_count() == 0);

    let log = recorder.log();
    assert_eq!(log.messages, vec![Message::data(&b"whole"[..])]);
    assert_eq!(log.closed[0].1, "framing");
}

#[test]
fn test_orderly_eof_closes_session() {
    let recorder = Recorder::default();
    let (mut reactor, addr) = server(&recorder);
    let peer = Peer::connect(addr);

    pump_until(&mut reactor, |r| r.session_count() == 1);
    drop(peer);
    pump_until(&mut reactor, |r| r.session_count() == 0);
    assert_eq!(recorder.log().closed[0].1, "peer_closed");
}

#[test]
fn test_traffic_before_login_is_rejected() {
    let recorder = Recorder::default();
    let (mut reactor, addr) = server(&recorder);
    let mut peer = Peer::connect(addr);

    peer.send(&Message::data(&b"too early"[..]));
    pump_until(&mut reactor, |r| {
        r.session_count() == 0 && !recorder.log().closed.is_empty()
    });

    let log = recorder.log();
    assert!(log.messages.is_empty());
    assert_eq!(log.closed[0].1, "protocol");
}

#[test]
fn test_client_heartbeats_after_login() {
    let period = Duration::from_millis(100);
    let recorder = Recorder::default();
    let mut reactor = Reactor::new(&test_config(period.as_millis() as u64))
        .unwrap()
        .with_application(recorder.clone());

    let listener = StdListener::bind(loopback()).unwrap();
    let id = reactor.connect(listener.local_addr().unwrap()).unwrap();
    assert_eq!(reactor.session_state(id), Some(SessionState::Connecting));

    let (stream, _) = listener.accept().unwrap();
    let mut server_side = Peer::new(stream);

    assert_eq!(
        server_side.recv(&mut reactor),
        Some(Message::login_req(&b""[..]))
    );
    assert_eq!(reactor.session_state(id), Some(SessionState::AwaitingLogin));
    assert_eq!(reactor.timers_for(id), 0);

    let login_sent = Instant::now();
    server_side.send(&Message::login_resp(0));

    assert_eq!(server_side.recv(&mut reactor), Some(Message::heartbeat_req()));
    assert!(login_sent.elapsed() >= period);
    assert_eq!(reactor.session_state(id), Some(SessionState::Authenticated));
    assert_eq!(reactor.timers_for(id), 1);

    server_side.send(&Message::heartbeat_resp());
    assert_eq!(server_side.recv(&mut reactor), Some(Message::heartbeat_req()));
    assert_eq!(reactor.timers_for(id), 1);

    drop(server_side);
    pump_until(&mut reactor, |r| r.session_count() == 0);
    assert_eq!(reactor.timer_count(), 0);
    assert_eq!(recorder.log().accepted, vec![id]);
}

#[test]
fn test_zero_heartbeat_period_keeps_loop_turning() {
    let recorder = Recorder::default();
    let mut reactor = Reactor::new(&test_config(0))
        .unwrap()
        .with_application(recorder.clone());
    let stop = reactor.stop_handle();

    let listener = StdListener::bind(loopback()).unwrap();
    let id = reactor.connect(listener.local_addr().unwrap()).unwrap();
    let (stream, _) = listener.accept().unwrap();
    let mut server_side = Peer::new(stream);

    assert_eq!(
        server_side.recv(&mut reactor),
        Some(Message::login_req(&b""[..]))
    );
    server_side.send(&Message::login_resp(0));
    assert_eq!(server_side.recv(&mut reactor), Some(Message::heartbeat_req()));
    assert_eq!(server_side.recv(&mut reactor), Some(Message::heartbeat_req()));
    assert_eq!(reactor.timers_for(id), 1);

    stop.stop();
    reactor.run().unwrap();
    assert_eq!(reactor.session_count(), 0);
    assert_eq!(reactor.timer_count(), 0);
}

#[test]
fn test_client_closes_on_rejected_login() {
    let recorder = Recorder::default();
    let mut reactor = Reactor::new(&test_config(30))
        .unwrap()
        .with_application(recorder.clone());

    let listener = StdListener::bind(loopback()).unwrap();
    let id = reactor.connect(listener.local_addr().unwrap()).unwrap();
    let (stream, _) = listener.accept().unwrap();
    let mut server_side = Peer::new(stream);

    assert_eq!(
        server_side.recv(&mut reactor),
        Some(Message::login_req(&b""[..]))
    );
    server_side.send(&Message::login_resp(1));

    pump_until(&mut reactor, |r| r.session_count() == 0);
    assert_eq!(reactor.session_state(id), None);
    assert_eq!(reactor.timer_count(), 0);

    // Several heartbeat periods later, nothing but EOF arrived.
    pump_for(&mut reactor, Duration::from_millis(120));
    assert_eq!(server_side.recv(&mut reactor), None);
    assert_eq!(server_side.decoder.buffered(), 0);

    let log = recorder.log();
    assert_eq!(log.closed, vec![(id, "auth_rejected")]);
}

#[test]
fn test_client_connect_failure_is_confined() {
    let recorder = Recorder::default();
    let (mut reactor, addr) = server(&recorder);

    // Grab a port with nothing listening on it.
    let dead = {
        let l = StdListener::bind(loopback()).unwrap();
        l.local_addr().unwrap()
    };

    let mut peer = Peer::connect(addr);
    if let Ok(id) = reactor.connect(dead) {
        // The slot may be reused by the accepted peer, so watch the close log.
        pump_until(&mut reactor, |_| {
            recorder.log().closed.iter().any(|(closed, _)| *closed == id)
        });
        assert!(recorder.log().closed.contains(&(id, "io")));
    }

    // The server side keeps working.
    peer.send(&Message::login_req(&b""[..]));
    assert_eq!(peer.recv(&mut reactor), Some(Message::login_resp(0)));
}

#[test]
fn test_stop_from_another_thread() {
    let recorder = Recorder::default();
    let (mut reactor, addr) = server(&recorder);
    let stop = reactor.stop_handle();

    let mut peer = StdStream::connect(addr).unwrap();
    peer.set_read_timeout(Some(PATIENCE)).unwrap();

    let runner = thread::spawn(move || reactor.run());

    peer.write_all(&encode_to_vec(&Message::login_req(&b""[..])))
        .unwrap();
    let mut resp = [0u8; 6];
    peer.read_exact(&mut resp).unwrap();
    assert_eq!(resp, [2, 0, 0, 0, 1, 0]);

    stop.stop();
    assert!(stop.is_stopped());
    runner.join().unwrap().unwrap();

    let mut rest = Vec::new();
    assert_eq!(peer.read_to_end(&mut rest).unwrap(), 0);
    assert_eq!(recorder.log().closed.len(), 1);
    assert_eq!(recorder.log().closed[0].1, "shutdown");
}

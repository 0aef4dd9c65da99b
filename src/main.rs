//! linkbeat: login and heartbeat over a mio reactor
//!
//! Two modes:
//! - `server`: listens, answers logins and heartbeats, echoes DATA frames
//!   (or answers time queries with `--application time`)
//! - `client`: connects, logs in, sends heartbeats until the link drops
//!
//! Configuration via CLI arguments or TOML file.

use linkbeat::config::{AppKind, Config, Mode};
use linkbeat::error::CloseReason;
use linkbeat::handlers::AllowList;
use linkbeat::runtime::{Application, Echo, Reactor, SessionId, StopHandle, TimeQuery};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        mode = ?config.mode,
        listen = %config.listen,
        application = ?config.application,
        connect = %config.connect,
        heartbeat_ms = config.heartbeat_interval_ms,
        max_frame_body = config.max_frame_body,
        "Starting linkbeat"
    );

    match config.mode {
        Mode::Server => run_server(config),
        Mode::Client => run_client(config),
    }
}

fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let addr = config.listen_addr()?;
    let reactor = Reactor::new(&config)?;
    let reactor = match config.application {
        AppKind::Echo => reactor.with_application(Echo),
        AppKind::Time => reactor.with_application(TimeQuery),
    };

    let mut reactor = if config.allowed_peers.is_empty() {
        reactor
    } else {
        info!(peers = ?config.allowed_peers, "Login restricted to allow list");
        reactor.with_login_policy(AllowList::new(config.allowed_peers.clone()))
    };

    reactor.listen(addr)?;
    reactor.run()?;
    Ok(())
}

/// Stops the reactor once the client's only session ends.
struct ClientWatch {
    stop: StopHandle,
    failure: Arc<Mutex<Option<String>>>,
}

impl Application for ClientWatch {
    fn on_close(&mut self, id: SessionId, reason: &CloseReason) {
        if reason.is_failure() {
            if let Ok(mut slot) = self.failure.lock() {
                *slot = Some(reason.to_string());
            }
        }
        info!(conn_id = id, reason = %reason, "Connection ended");
        self.stop.stop();
    }
}

fn run_client(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let addr = config.connect_addr()?;
    let reactor = Reactor::new(&config)?;
    let failure = Arc::new(Mutex::new(None));

    let watch = ClientWatch {
        stop: reactor.stop_handle(),
        failure: Arc::clone(&failure),
    };
    let mut reactor = reactor.with_application(watch);

    reactor.connect(addr)?;
    reactor.run()?;

    let failure = failure.lock().ok().and_then(|mut slot| slot.take());
    match failure {
        Some(reason) => {
            warn!(peer = %addr, reason = %reason, "Client session failed");
            Err(reason.into())
        }
        None => Ok(()),
    }
}

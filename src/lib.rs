//! linkbeat: a non-blocking TCP runtime with a login and heartbeat protocol
//!
//! Every connection runs a mandatory login handshake and, on the client
//! side, a periodic heartbeat:
//! - Length-delimited binary frames (`[type:1][len:4][body]`)
//! - Single-threaded mio reactor driving many sessions
//! - Pluggable login policy on the server
//! - Per-session fault isolation: one bad peer never stops the loop
//!
//! Anything that is not login or heartbeat traffic is handed to an
//! [`runtime::Application`].

pub mod config;
pub mod error;
pub mod handlers;
pub mod protocol;
pub mod runtime;

//! Custom runtime for the session protocol.
//!
//! Readiness-based I/O through mio (epoll on Linux, kqueue on macOS):
//! - `Reactor`: the poll-and-dispatch loop and its session registry
//! - `Session`: per-connection state machine and buffers
//! - `TimerQueue`: recurring heartbeat timers
//! - `Application`: hook for upper-layer protocols

pub mod application;
pub mod reactor;
pub mod session;
pub mod timer;

pub use application::{Application, Echo, Noop, TimeQuery};
pub use reactor::{Reactor, StopHandle};
pub use session::{Role, Session, SessionId, SessionState};
pub use timer::{TimerHandle, TimerQueue};

//! A userspace TCP-masquerading tunnel. A client and a proxy server exchange
//! per-session frames over a single raw 4-tuple whose traffic stays shaped like
//! an ordinary TCP connection: a real userspace TCP handshake opens the flow,
//! a key is agreed on the resulting byte stream, and every frame thereafter is
//! an authenticated-encrypted payload stamped with continuing TCP headers.

pub mod capture;
pub mod client;
pub mod control;
pub mod crypt;
pub mod error;
pub mod fake;
pub mod handshake;
pub mod raw;
pub mod sconn;
pub mod server;
pub mod session;
pub mod tcpip;
pub mod ustack;

pub use crate::error::{Error, Result};
pub use crate::sconn::{Config, Conn};
pub use crate::session::{Proto, Session, SessionId, CONTROL_SESSION};

/// Default proxy server port.
pub const DEFAULT_PORT: u16 = 19986;

//! Chrome DevTools Protocol layer: transport, sessions, typed commands

pub mod connection;
pub mod transport;
pub mod types;

pub use connection::{Connection, Session, SessionKind, SessionPool};
pub use transport::{CdpEvent, Transport, DEFAULT_COMMAND_DEADLINE};
pub use types::*;

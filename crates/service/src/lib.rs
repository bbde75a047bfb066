//! Reflection-side protocol state.
//!
//! The server's data loop is plain I/O; everything it decides (sequence
//! tracking, gap accounting, whether a request earns a reply) lives here
//! so it can be exercised without sockets.

pub mod session;

pub use session::{Session, Sessions};

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    /// the protocol supports exactly one concurrent client
    TooManyClients,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

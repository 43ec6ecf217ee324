//! Seam to the TLS library. The core never performs a handshake itself; it hands
//! stream sockets on TLS-enabled vhosts to an acceptor and lets readiness drive it.

use thiserror::Error;

use crate::connection::Connection;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TlsError(pub String);

/// Progress of a handshake after the acceptor has been given a readiness event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    InProgress,
    Complete,
}

pub trait TlsAcceptor: Send + Sync {
    /// Begin server-side negotiation on an adopted socket. Must not block. Once the
    /// handshake is under way the acceptor registers the connection with
    /// [`Connection::register`]; failing to do so makes adoption fail.
    fn accept(&self, conn: &mut Connection) -> Result<(), TlsError>;

    /// Advance the handshake when the descriptor becomes readable.
    fn resume(&self, conn: &mut Connection) -> Result<Handshake, TlsError>;
}

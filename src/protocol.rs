//! Protocol bindings: the callbacks the core fires into the protocol layer.

use std::collections::TryReserveError;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::connection::Connection;

/// Why a protocol callback is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    /// A connection object was allocated. Fired on the default protocol, no session data.
    ConnectionCreated,
    /// An adopted HTTP socket is registered and ready.
    NewClientInstantiated,
    /// An adopted raw or datagram socket is registered and ready.
    RawAdopt,
    /// An adopted file descriptor is registered and ready.
    RawAdoptFile,
    /// Bytes arrived on an HTTP connection.
    Receive,
    /// Bytes arrived on a raw or datagram socket.
    RawRx,
    /// Bytes arrived on a file descriptor.
    RawRxFile,
    /// The connection asked for writability and the descriptor can take more bytes.
    Writeable,
    /// The connection object is being torn down. Fired on the default protocol.
    ConnectionDestroyed,
}

/// A protocol's verdict after a callback. `Close` asks the core to tear the connection down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    Close,
}

pub trait ProtocolHandler: Send + Sync {
    fn callback(&self, conn: &mut Connection, reason: Reason, payload: &[u8]) -> Disposition;
}

impl<F> ProtocolHandler for F
where
    F: Fn(&mut Connection, Reason, &[u8]) -> Disposition + Send + Sync,
{
    fn callback(&self, conn: &mut Connection, reason: Reason, payload: &[u8]) -> Disposition {
        self(conn, reason, payload)
    }
}

/// A named protocol as listed on a virtual host.
#[derive(Clone)]
pub struct Protocol {
    pub name: String,
    /// Bytes of zeroed per-connection session data allocated when a connection binds this protocol.
    pub session_data_size: usize,
    pub handler: Arc<dyn ProtocolHandler>,
}

impl Protocol {
    pub fn new(name: impl Into<String>, handler: impl ProtocolHandler + 'static) -> Self {
        Self {
            name: name.into(),
            session_data_size: 0,
            handler: Arc::new(handler),
        }
    }

    pub fn with_session_data(mut self, size: usize) -> Self {
        self.session_data_size = size;
        self
    }
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("name", &self.name)
            .field("session_data_size", &self.session_data_size)
            .finish_non_exhaustive()
    }
}

/// A protocol's per-connection private data. Counted against the context so tests
/// can check every block is released exactly once.
pub struct SessionData {
    bytes: Vec<u8>,
    live: Arc<AtomicUsize>,
}

impl SessionData {
    pub(crate) fn try_new(size: usize, live: &Arc<AtomicUsize>) -> Result<Self, TryReserveError> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(size)?;
        bytes.resize(size, 0);
        live.fetch_add(1, Ordering::Relaxed);
        Ok(Self {
            bytes,
            live: Arc::clone(live),
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl Drop for SessionData {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for SessionData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionData")
            .field("len", &self.bytes.len())
            .finish()
    }
}

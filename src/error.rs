use std::io;

use thiserror::Error;

/// Placement failure from `Context::create_connection`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("no service thread has free capacity")]
    NoCapacity,
}

/// Insertion failure from a per-thread poll table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TableError {
    #[error("poll table full ({capacity} slots)")]
    TableFull { capacity: usize },
    #[error("descriptor {fd} already in poll table")]
    DuplicateEntry { fd: i32 },
    #[error("connection has no open descriptor")]
    NoDescriptor,
}

/// Adoption failure. By the time one of these is returned the core has already
/// released everything it built and closed the descriptor.
#[derive(Debug, Error)]
pub enum AdoptionError {
    #[error("peer {addr} reached its connection limit of {limit}")]
    PeerLimitExceeded { addr: std::net::IpAddr, limit: u32 },
    #[error("no service thread has free capacity")]
    NoCapacity,
    #[error("platform error: {0}")]
    Platform(#[from] io::Error),
    #[error("protocol {name:?} not enabled on vhost {vhost:?}")]
    UnknownProtocol { name: String, vhost: String },
    #[error("out of memory allocating {size} bytes of session data")]
    OutOfMemory { size: usize },
    #[error("no role can adopt descriptor kind {0:?}")]
    UnsupportedDescriptorKind(crate::descriptor::DescriptorKind),
    #[error("poll table full ({capacity} slots)")]
    TableFull { capacity: usize },
    #[error("descriptor {fd} already in poll table")]
    DuplicateEntry { fd: i32 },
    #[error("tls negotiation failed: {0}")]
    TlsNegotiationFailed(#[from] crate::tls::TlsError),
    #[error("unable to resolve udp address {host}:{port}")]
    AddressResolution { host: String, port: u16 },
}

impl From<AdmissionError> for AdoptionError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::NoCapacity => AdoptionError::NoCapacity,
        }
    }
}

impl From<TableError> for AdoptionError {
    fn from(err: TableError) -> Self {
        match err {
            TableError::TableFull { capacity } => AdoptionError::TableFull { capacity },
            TableError::DuplicateEntry { fd } => AdoptionError::DuplicateEntry { fd },
            TableError::NoDescriptor => {
                AdoptionError::Platform(io::Error::from(io::ErrorKind::NotConnected))
            }
        }
    }
}

/// Rejected `ServiceConfig`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("thread count {threads} outside 1..={max}")]
    Threads { threads: usize, max: usize },
    #[error("fd limit {limit} outside 1..={max}")]
    FdLimit { limit: usize, max: usize },
    #[error("handoff queue size {size} must be a power of two, at least {min} and >= fd limit {fd_limit}")]
    HandoffQueue {
        size: usize,
        min: usize,
        fd_limit: usize,
    },
    #[error("rx buffer size must be non-zero")]
    RxBuffer,
    #[error("virtual host {0:?} has no protocols")]
    NoProtocols(String),
    #[error("no virtual hosts configured")]
    NoVhosts,
}

/// Failure building a `Context`.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("creating service thread {index}: {source}")]
    Thread { index: usize, source: io::Error },
}

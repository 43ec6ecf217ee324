//! Library crate for adoptd: turns raw descriptors into managed connections.
//!
//! A `Context` owns the service threads and virtual hosts. `Context::adopt` takes an
//! accepted socket, UDP socket or open file, places it on the least-loaded service
//! thread, binds it to a protocol and role, registers it for polling, announces it
//! and hands it to that thread's `ServiceWorker`. Failures before registration roll
//! back silently; later failures tear the connection down through the close path.

pub mod adopt;
pub mod config;
pub mod connection;
pub mod constants;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod handoff;
pub mod metrics;
pub mod parse;
pub mod peer;
pub mod poll_table;
pub mod protocol;
pub mod role;
pub mod service;
pub mod thread;
pub mod tls;
pub mod udp;
pub mod vhost;
pub mod waker;
pub mod worker;

pub use config::ServiceConfig;
pub use connection::{Connection, ConnectionHandle, ConnectionId, LifecycleState, TlsState};
pub use context::{Context, ContextBuilder};
pub use descriptor::{Descriptor, DescriptorKind};
pub use error::{AdmissionError, AdoptionError, BuildError, ConfigError, TableError};
pub use protocol::{Disposition, Protocol, ProtocolHandler, Reason};
pub use role::{Role, RoleRegistry};
pub use tls::{Handshake, TlsAcceptor, TlsError};
pub use vhost::{VirtualHost, VirtualHostBuilder};
pub use worker::ServiceWorker;

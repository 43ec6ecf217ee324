//! Roles: per-descriptor-kind adoption behaviour.
//!
//! Adoption asks the registry for the first role that claims the descriptor kind. The
//! role specialises the connection before registration (`adoption_bind`), may
//! substitute the birth notification, and gets a last look once adoption is complete
//! (`adoption_finish`).

use std::fmt;
use std::sync::Arc;

use crate::connection::{Connection, TlsState};
use crate::descriptor::DescriptorKind;
use crate::protocol::Reason;

pub trait Role: Send + Sync {
    fn name(&self) -> &'static str;

    fn claims(&self, kind: DescriptorKind) -> bool;

    /// Specialise a connection that has its descriptor and protocol. `tls` is set
    /// when the descriptor must be negotiated before it is serviced.
    fn adoption_bind(&self, conn: &mut Connection, tls: bool) {
        if tls {
            conn.set_tls_state(TlsState::Handshaking);
        }
    }

    /// Runs after registration and the birth notification.
    fn adoption_finish(&self, _conn: &mut Connection) {}

    /// Birth notification to fire instead of `Reason::NewClientInstantiated`.
    fn adoption_reason(&self) -> Option<Reason> {
        None
    }

    /// Reason used when delivering received bytes.
    fn rx_reason(&self) -> Reason;
}

/// Plain HTTP on an accepted stream socket.
pub struct HttpRole;

impl Role for HttpRole {
    fn name(&self) -> &'static str {
        "h1"
    }

    fn claims(&self, kind: DescriptorKind) -> bool {
        kind == DescriptorKind::Http
    }

    fn rx_reason(&self) -> Reason {
        Reason::Receive
    }
}

/// Opaque byte stream on an accepted socket.
pub struct RawSocketRole;

impl Role for RawSocketRole {
    fn name(&self) -> &'static str {
        "raw-skt"
    }

    fn claims(&self, kind: DescriptorKind) -> bool {
        kind == DescriptorKind::RawSocket
    }

    fn adoption_reason(&self) -> Option<Reason> {
        Some(Reason::RawAdopt)
    }

    fn rx_reason(&self) -> Reason {
        Reason::RawRx
    }
}

pub struct UdpRole;

impl Role for UdpRole {
    fn name(&self) -> &'static str {
        "raw-udp"
    }

    fn claims(&self, kind: DescriptorKind) -> bool {
        kind == DescriptorKind::Udp
    }

    fn adoption_bind(&self, _conn: &mut Connection, _tls: bool) {}

    fn adoption_reason(&self) -> Option<Reason> {
        Some(Reason::RawAdopt)
    }

    fn rx_reason(&self) -> Reason {
        Reason::RawRx
    }
}

pub struct RawFileRole;

impl Role for RawFileRole {
    fn name(&self) -> &'static str {
        "raw-file"
    }

    fn claims(&self, kind: DescriptorKind) -> bool {
        kind == DescriptorKind::File
    }

    fn adoption_bind(&self, _conn: &mut Connection, _tls: bool) {}

    fn adoption_reason(&self) -> Option<Reason> {
        Some(Reason::RawAdoptFile)
    }

    fn rx_reason(&self) -> Reason {
        Reason::RawRxFile
    }
}

/// Ordered list of roles; earlier registrations win.
#[derive(Clone)]
pub struct RoleRegistry {
    roles: Vec<Arc<dyn Role>>,
}

impl RoleRegistry {
    pub fn empty() -> Self {
        Self { roles: Vec::new() }
    }

    pub fn register(&mut self, role: Arc<dyn Role>) {
        self.roles.push(role);
    }

    pub fn resolve(&self, kind: DescriptorKind) -> Option<Arc<dyn Role>> {
        self.roles.iter().find(|r| r.claims(kind)).cloned()
    }
}

impl Default for RoleRegistry {
    fn default() -> Self {
        Self {
            roles: vec![
                Arc::new(HttpRole),
                Arc::new(RawSocketRole),
                Arc::new(UdpRole),
                Arc::new(RawFileRole),
            ],
        }
    }
}

impl fmt::Debug for RoleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.roles.iter().map(|r| r.name()))
            .finish()
    }
}

//! Virtual hosts: a name, an ordered protocol list and the admission policy for
//! connections bound to it.

use std::fmt;
use std::sync::Arc;

use crate::constants::DEFAULT_PROTOCOL;
use crate::error::ConfigError;
use crate::peer::PeerTable;
use crate::protocol::Protocol;
use crate::tls::TlsAcceptor;

pub struct VirtualHost {
    name: String,
    protocols: Vec<Protocol>,
    tls: Option<Arc<dyn TlsAcceptor>>,
    peers: Arc<PeerTable>,
}

impl VirtualHost {
    pub fn builder(name: impl Into<String>) -> VirtualHostBuilder {
        VirtualHostBuilder {
            name: name.into(),
            protocols: Vec::new(),
            tls: None,
            peer_limit: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocols(&self) -> &[Protocol] {
        &self.protocols
    }

    pub fn protocol(&self, index: usize) -> Option<&Protocol> {
        self.protocols.get(index)
    }

    pub fn default_protocol(&self) -> &Protocol {
        &self.protocols[DEFAULT_PROTOCOL]
    }

    pub fn protocol_index(&self, name: &str) -> Option<usize> {
        self.protocols.iter().position(|p| p.name == name)
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    pub fn tls(&self) -> Option<&Arc<dyn TlsAcceptor>> {
        self.tls.as_ref()
    }

    pub fn peers(&self) -> &Arc<PeerTable> {
        &self.peers
    }
}

impl fmt::Debug for VirtualHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualHost")
            .field("name", &self.name)
            .field("protocols", &self.protocols)
            .field("tls", &self.tls.is_some())
            .field("peers", &self.peers)
            .finish()
    }
}

pub struct VirtualHostBuilder {
    name: String,
    protocols: Vec<Protocol>,
    tls: Option<Arc<dyn TlsAcceptor>>,
    peer_limit: Option<u32>,
}

impl VirtualHostBuilder {
    /// Append a protocol. The first one added is the default protocol.
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocols.push(protocol);
        self
    }

    pub fn tls(mut self, acceptor: Arc<dyn TlsAcceptor>) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Maximum simultaneous connections from one remote address.
    pub fn peer_limit(mut self, limit: u32) -> Self {
        self.peer_limit = Some(limit);
        self
    }

    pub fn build(self) -> Result<Arc<VirtualHost>, ConfigError> {
        if self.protocols.is_empty() {
            return Err(ConfigError::NoProtocols(self.name));
        }
        Ok(Arc::new(VirtualHost {
            name: self.name,
            protocols: self.protocols,
            tls: self.tls,
            peers: PeerTable::new(self.peer_limit),
        }))
    }
}

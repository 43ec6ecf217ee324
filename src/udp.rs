//! UDP endpoint bootstrap: create (and optionally bind) a datagram socket and adopt it.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, error, warn};

use crate::connection::{Connection, ConnectionHandle};
use crate::context::Context;
use crate::descriptor::{Descriptor, DescriptorKind};
use crate::error::AdoptionError;
use crate::vhost::VirtualHost;

/// Wildcard addresses tried in order; the first family we can open a socket in wins.
fn bind_candidates(port: u16) -> [SocketAddr; 2] {
    [
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
    ]
}

/// Addresses for `host:port`, or the wildcard candidates when no host is given.
fn resolve_candidates(host: Option<&str>, port: u16) -> Result<Vec<SocketAddr>, AdoptionError> {
    let Some(host) = host else {
        return Ok(bind_candidates(port).to_vec());
    };
    let unresolved = || AdoptionError::AddressResolution {
        host: host.to_owned(),
        port,
    };
    match (host, port).to_socket_addrs() {
        Ok(addrs) => {
            let addrs: Vec<SocketAddr> = addrs.collect();
            if addrs.is_empty() {
                warn!(host, port, "udp address resolved to nothing");
                return Err(unresolved());
            }
            Ok(addrs)
        }
        Err(e) => {
            warn!(host, port, error = %e, "unable to resolve udp address");
            Err(unresolved())
        }
    }
}

/// Open a UDP socket for the first candidate address whose family is available.
fn open_udp_socket(host: Option<&str>, port: u16) -> Result<(Socket, SocketAddr), AdoptionError> {
    let mut last_err = None;
    for addr in resolve_candidates(host, port)? {
        match Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP)) {
            Ok(socket) => return Ok((socket, addr)),
            Err(e) => {
                debug!(%addr, error = %e, "udp socket family unavailable");
                last_err = Some(e);
            }
        }
    }
    Err(match last_err {
        Some(e) => AdoptionError::Platform(e),
        None => AdoptionError::AddressResolution {
            host: host.unwrap_or_default().to_owned(),
            port,
        },
    })
}

impl Context {
    /// Create a UDP socket on `port`, bind it if asked, and adopt it as a UDP
    /// connection on `vhost`. The socket is closed on every failure.
    pub fn bootstrap_udp(
        &self,
        vhost: &Arc<VirtualHost>,
        port: u16,
        bind: bool,
        protocol: Option<&str>,
        parent: Option<&mut Connection>,
    ) -> Result<Option<ConnectionHandle>, AdoptionError> {
        self.bootstrap_udp_on(vhost, None, port, bind, protocol, parent)
    }

    /// `bootstrap_udp` on the addresses `host` resolves to instead of the wildcards.
    pub fn bootstrap_udp_on(
        &self,
        vhost: &Arc<VirtualHost>,
        host: Option<&str>,
        port: u16,
        bind: bool,
        protocol: Option<&str>,
        parent: Option<&mut Connection>,
    ) -> Result<Option<ConnectionHandle>, AdoptionError> {
        let (socket, addr) = open_udp_socket(host, port)?;

        if bind
            && let Err(e) = socket.bind(&SockAddr::from(addr))
        {
            warn!(%addr, error = %e, "udp bind failed");
            return Err(AdoptionError::Platform(e));
        }

        self.adopt(
            vhost,
            Descriptor::Socket(socket),
            DescriptorKind::Udp,
            protocol,
            parent,
        )
        .inspect_err(|e| error!(port, error = %e, "udp adoption failed"))
    }
}

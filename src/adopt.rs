//! Descriptor adoption: raw descriptor in, live connection on its service thread out.
//!
//! Everything happens on the calling thread. The connection is registered in the
//! owning thread's poll table before the birth notification (so the protocol can ask
//! for writability from it), but the owning thread only gets the object itself once
//! it is complete, through its handoff queue. Until then its worker skips the entry.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::connection::{Connection, ConnectionHandle, LifecycleState, TlsState};
use crate::context::Context;
use crate::descriptor::{Descriptor, DescriptorKind};
use crate::error::AdoptionError;
use crate::metrics;
use crate::protocol::{Disposition, Reason};
use crate::service;
use crate::tls::TlsError;
use crate::vhost::VirtualHost;

impl Context {
    /// Adopt `desc` onto `vhost`.
    ///
    /// The descriptor is consumed: on any error it has already been closed.
    /// `Ok(None)` means the protocol asked to close the connection while it was
    /// being announced; it has been torn down.
    pub fn adopt(
        &self,
        vhost: &Arc<VirtualHost>,
        desc: Descriptor,
        kind: DescriptorKind,
        protocol: Option<&str>,
        parent: Option<&mut Connection>,
    ) -> Result<Option<ConnectionHandle>, AdoptionError> {
        self.adopt_inner(vhost, desc, kind, protocol, parent, None)
    }

    /// Adopt an accepted socket as HTTP (negotiating TLS if the vhost has it).
    pub fn adopt_socket(
        &self,
        vhost: &Arc<VirtualHost>,
        socket: impl Into<Descriptor>,
    ) -> Result<Option<ConnectionHandle>, AdoptionError> {
        self.adopt(vhost, socket.into(), DescriptorKind::Http, None, None)
    }

    /// Adopt an accepted socket together with bytes already read from it. The
    /// protocol sees `readahead` before anything read from the socket afterwards.
    pub fn adopt_with_prebuffered(
        &self,
        vhost: &Arc<VirtualHost>,
        socket: impl Into<Descriptor>,
        readahead: Vec<u8>,
    ) -> Result<Option<ConnectionHandle>, AdoptionError> {
        self.adopt_inner(
            vhost,
            socket.into(),
            DescriptorKind::Http,
            None,
            None,
            Some(readahead),
        )
    }

    pub(crate) fn adopt_inner(
        &self,
        vhost: &Arc<VirtualHost>,
        desc: Descriptor,
        kind: DescriptorKind,
        protocol: Option<&str>,
        mut parent: Option<&mut Connection>,
        readahead: Option<Vec<u8>>,
    ) -> Result<Option<ConnectionHandle>, AdoptionError> {
        let ticket = match desc.peer_ip() {
            Some(ip) if kind.is_socket() => match vhost.peers().admit(ip) {
                Ok(ticket) => Some(ticket),
                Err(denied) => {
                    info!(peer = %denied.addr, limit = denied.limit, "peer reached connection limit");
                    metrics::inc_peer_limit_denied();
                    return Err(AdoptionError::PeerLimitExceeded {
                        addr: denied.addr,
                        limit: denied.limit,
                    });
                }
            },
            _ => None,
        };

        // Children live on their parent's thread.
        let preferred = parent.as_deref().map(Connection::thread_index);
        let mut conn = self.create_connection(vhost, preferred)?;
        conn.set_peer(ticket);

        if let Some(parent) = parent.as_deref_mut() {
            parent.add_child(conn.id());
            conn.set_parent(parent.id());
        }

        if let Err(err) = self.bind(&mut conn, desc, kind, protocol) {
            warn!(conn = %conn.id(), error = %err, "adoption bailed");
            unlink(&mut conn, parent.as_deref_mut());
            return Err(err);
        }

        if let Err(err) = register(vhost, &mut conn) {
            error!(conn = %conn.id(), error = %err, "registration failed");
            unlink(&mut conn, parent.as_deref_mut());
            return Err(err);
        }

        // Announce after insertion so request_writable works from the callback.
        let reason = conn
            .role()
            .and_then(|r| r.adoption_reason())
            .unwrap_or(Reason::NewClientInstantiated);
        if conn.notify_bound(reason, &[]) == Disposition::Close {
            info!(conn = %conn.id(), "closed by protocol during adoption");
            unlink(&mut conn, parent.as_deref_mut());
            return Ok(None);
        }

        if let Some(role) = conn.role().cloned() {
            role.adoption_finish(&mut conn);
        }
        conn.set_state(LifecycleState::Live);

        if let Some(bytes) = readahead.filter(|b| !b.is_empty())
            && replay_readahead(&mut conn, bytes) == Disposition::Close
        {
            info!(conn = %conn.id(), "closed while servicing readahead");
            unlink(&mut conn, parent.as_deref_mut());
            return Ok(None);
        }

        let handle = conn.handle();
        let thread = &self.threads()[handle.thread];
        if let Err(mut conn) = thread.hand_off(conn) {
            error!(conn = %handle.id, tsi = handle.thread, "handoff queue full");
            let capacity = thread.capacity();
            unlink(&mut conn, parent.as_deref_mut());
            return Err(AdoptionError::TableFull { capacity });
        }
        thread.wake();
        metrics::inc_adoptions();
        Ok(Some(handle))
    }

    /// Steps that may fail before the connection is visible to anyone: descriptor,
    /// non-blocking mode, protocol, role.
    fn bind(
        &self,
        conn: &mut Connection,
        desc: Descriptor,
        kind: DescriptorKind,
        protocol: Option<&str>,
    ) -> Result<(), AdoptionError> {
        conn.attach_descriptor(desc, kind);
        if let Some(desc) = conn.descriptor() {
            desc.set_nonblocking().map_err(|e| {
                error!(conn = %conn.id(), error = %e, "unable to set descriptor nonblocking");
                AdoptionError::Platform(e)
            })?;
        }

        if let Some(name) = protocol {
            let vhost = conn.vhost();
            let Some(index) = vhost.protocol_index(name) else {
                error!(protocol = name, vhost = vhost.name(), "protocol not enabled on vhost");
                return Err(AdoptionError::UnknownProtocol {
                    name: name.to_owned(),
                    vhost: vhost.name().to_owned(),
                });
            };
            conn.bind_protocol(index)?;
        }

        let tls = kind.is_stream() && conn.vhost().tls_enabled();
        let Some(role) = self.roles.resolve(kind) else {
            error!(?kind, "no role can adopt descriptor");
            return Err(AdoptionError::UnsupportedDescriptorKind(kind));
        };
        role.adoption_bind(conn, tls);
        conn.set_role(role);
        conn.set_state(LifecycleState::Bound);
        Ok(())
    }
}

/// Insert into the owning thread's poll table, directly or by starting TLS.
fn register(vhost: &Arc<VirtualHost>, conn: &mut Connection) -> Result<(), AdoptionError> {
    if conn.tls_state() != TlsState::Handshaking {
        return conn.register().map_err(AdoptionError::from);
    }
    let Some(acceptor) = vhost.tls().cloned() else {
        return Err(TlsError("vhost has no tls acceptor".into()).into());
    };
    acceptor.accept(conn)?;
    if !conn.is_registered() {
        return Err(TlsError("acceptor did not register the connection".into()).into());
    }
    debug!(conn = %conn.id(), "tls negotiation started");
    Ok(())
}

/// Readahead goes through the normal readable path right away if a parse context
/// can be had; otherwise it waits in the pending list for the owning thread.
fn replay_readahead(conn: &mut Connection, bytes: Vec<u8>) -> Disposition {
    if conn.tls_state() != TlsState::Handshaking && conn.try_attach_parse_context() {
        if let Some(parse) = conn.parse_context_mut() {
            parse.stash(&bytes);
        }
        debug!(conn = %conn.id(), len = bytes.len(), "servicing readahead");
        return service::service_readable(conn);
    }
    debug!(conn = %conn.id(), len = bytes.len(), "deferring readahead");
    metrics::inc_deferred_replays();
    conn.push_pending(bytes);
    Disposition::Continue
}

/// Detach a failed connection from its parent and release it.
fn unlink(conn: &mut Connection, parent: Option<&mut Connection>) {
    if let Some(parent) = parent {
        parent.remove_child(conn.id());
    }
    conn.release();
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::config::ServiceConfig;
    use crate::protocol::Protocol;

    #[test]
    fn full_handoff_queue_tears_down_the_connection() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&destroyed);
        let vhost = VirtualHost::builder("default")
            .protocol(Protocol::new(
                "http",
                move |_: &mut Connection, reason: Reason, _: &[u8]| {
                    if reason == Reason::ConnectionDestroyed {
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                    Disposition::Continue
                },
            ))
            .build()
            .unwrap();
        let (ctx, _workers) = Context::builder(ServiceConfig::with_threads(1, 64))
            .vhost(Arc::clone(&vhost))
            .build()
            .unwrap();
        let thread = Arc::clone(ctx.thread(0).unwrap());

        // Nobody drains this thread, so its queue fills with placeholders.
        for _ in 0..ctx.config().handoff_queue_size {
            let conn = ctx.create_connection(&vhost, Some(0)).unwrap();
            assert!(thread.hand_off(conn).is_ok());
        }
        let in_flight = ctx.live_connections();

        let (a, mut b) = UnixStream::pair().unwrap();
        let err = ctx.adopt_socket(&vhost, a).unwrap_err();
        assert!(matches!(err, AdoptionError::TableFull { capacity: 64 }));
        assert_eq!(destroyed.load(Ordering::Relaxed), 1);
        assert_eq!(thread.occupancy(), 0);
        assert_eq!(ctx.live_connections(), in_flight);

        let mut buf = [0u8; 1];
        assert_eq!(b.read(&mut buf).unwrap(), 0);
    }
}

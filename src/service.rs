//! Service path: readiness on a connection → protocol callbacks.
//!
//! Shared by the worker loop and by synchronous readahead replay during adoption, so
//! replayed bytes take exactly the route bytes read from the descriptor take.

use std::io;

use tracing::{debug, warn};

use crate::connection::{Connection, TlsState};
use crate::descriptor::DescriptorKind;
use crate::metrics;
use crate::protocol::{Disposition, Reason};
use crate::tls::Handshake;

/// Handle a readable event. Stashed bytes are delivered before anything read from
/// the descriptor. Without a parse context nothing is read: the connection keeps
/// its pending bytes and stops polling for input until its worker retries it.
pub fn service_readable(conn: &mut Connection) -> Disposition {
    if conn.tls_state() == TlsState::Handshaking {
        return advance_handshake(conn);
    }
    if !conn.try_attach_parse_context() {
        conn.park_input();
        return Disposition::Continue;
    }
    conn.resume_input();
    let Some(mut parse) = conn.take_parse_context() else {
        return Disposition::Continue;
    };
    let rx = conn
        .role()
        .map(|r| r.rx_reason())
        .unwrap_or(Reason::Receive);

    let stash = parse.take_stash();
    if !stash.is_empty() {
        metrics::add_replayed_bytes(stash.len());
        if conn.notify_bound(rx, &stash) == Disposition::Close {
            return Disposition::Close;
        }
    }

    let result = match conn.descriptor() {
        Some(desc) => desc.read(parse.buf_mut()),
        None => return Disposition::Close,
    };
    match result {
        Ok(0) if conn.kind() == Some(DescriptorKind::Udp) => Disposition::Continue,
        Ok(0) => {
            debug!(conn = %conn.id(), "eof");
            Disposition::Close
        }
        Ok(n) => conn.notify_bound(rx, &parse.buf_mut()[..n]),
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
            Disposition::Continue
        }
        Err(e) => {
            debug!(conn = %conn.id(), error = %e, "read failed");
            Disposition::Close
        }
    }
}

/// Handle a writable event: interest is one-shot, the protocol re-requests it.
pub fn service_writable(conn: &mut Connection) -> Disposition {
    if conn.tls_state() == TlsState::Handshaking {
        return advance_handshake(conn);
    }
    conn.clear_writable();
    conn.notify_bound(Reason::Writeable, &[])
}

fn advance_handshake(conn: &mut Connection) -> Disposition {
    let Some(acceptor) = conn.vhost().tls().cloned() else {
        warn!(conn = %conn.id(), "handshaking without a tls acceptor");
        return Disposition::Close;
    };
    match acceptor.resume(conn) {
        Ok(Handshake::InProgress) => Disposition::Continue,
        Ok(Handshake::Complete) => {
            debug!(conn = %conn.id(), "tls established");
            conn.set_tls_state(TlsState::Established);
            if conn.pending_len() > 0 {
                return service_readable(conn);
            }
            Disposition::Continue
        }
        Err(e) => {
            warn!(conn = %conn.id(), error = %e, "tls handshake failed");
            Disposition::Close
        }
    }
}

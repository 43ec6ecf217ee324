//! The connection object and its lifecycle.
//!
//! A connection moves through `LifecycleState` in order. Releasing it is a single
//! routine keyed on the state it reached: before registration nothing outside the
//! initiating thread has seen it, so it is rolled back silently; from registration
//! on it is torn down through the full close path. Either way it happens once.

use std::collections::VecDeque;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tracing::{debug, trace};

use crate::constants::DEFAULT_PROTOCOL;
use crate::descriptor::{Descriptor, DescriptorKind};
use crate::error::{AdoptionError, TableError};
use crate::metrics;
use crate::parse::ParseContext;
use crate::peer::PeerTicket;
use crate::poll_table::{POLLIN, POLLOUT, PollEntry};
use crate::protocol::{Disposition, Protocol, Reason, SessionData};
use crate::role::Role;
use crate::thread::ServiceThread;
use crate::vhost::VirtualHost;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// What a successful adoption hands back: the connection itself now lives on its
/// service thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub thread: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    /// Allocated on its service thread and bound to a vhost; no descriptor yet.
    Unconnected,
    /// Descriptor placed into the connection.
    Placed,
    /// Protocol and role resolved.
    Bound,
    /// Holds a poll-table slot.
    Registered,
    /// Birth notification accepted.
    Live,
    Closing,
    Freed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
    Plain,
    Handshaking,
    Established,
}

/// Context-wide counters shared by every connection.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    next_id: AtomicU64,
    live: AtomicUsize,
    pub(crate) sessions: Arc<AtomicUsize>,
}

impl Counters {
    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub(crate) fn sessions(&self) -> usize {
        self.sessions.load(Ordering::Relaxed)
    }
}

/// One live connection object counted against the context.
#[derive(Debug)]
struct LiveToken(Arc<Counters>);

impl LiveToken {
    fn new(counters: &Arc<Counters>) -> Self {
        counters.live.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(counters))
    }
}

impl Drop for LiveToken {
    fn drop(&mut self) {
        self.0.live.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct Connection {
    id: ConnectionId,
    vhost: Arc<VirtualHost>,
    thread: Arc<ServiceThread>,
    tsi: u8,
    state: LifecycleState,
    desc: Option<Descriptor>,
    kind: Option<DescriptorKind>,
    protocol: usize,
    session: Option<SessionData>,
    parent: Option<ConnectionId>,
    children: Vec<ConnectionId>,
    pending: VecDeque<Vec<u8>>,
    parse: Option<ParseContext>,
    /// POLLIN withdrawn until a parse context frees up.
    input_parked: bool,
    slot: Option<usize>,
    peer: Option<PeerTicket>,
    role: Option<Arc<dyn Role>>,
    tls: TlsState,
    counters: Arc<Counters>,
    live: Option<LiveToken>,
}

impl Connection {
    pub(crate) fn new(
        vhost: &Arc<VirtualHost>,
        thread: &Arc<ServiceThread>,
        counters: &Arc<Counters>,
    ) -> Self {
        let id = ConnectionId(counters.next_id.fetch_add(1, Ordering::Relaxed));
        Self {
            id,
            vhost: Arc::clone(vhost),
            thread: Arc::clone(thread),
            tsi: thread.index() as u8,
            state: LifecycleState::Unconnected,
            desc: None,
            kind: None,
            protocol: DEFAULT_PROTOCOL,
            session: None,
            parent: None,
            children: Vec::new(),
            pending: VecDeque::new(),
            parse: None,
            input_parked: false,
            slot: None,
            peer: None,
            role: None,
            tls: TlsState::Plain,
            counters: Arc::clone(counters),
            live: Some(LiveToken::new(counters)),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            id: self.id,
            thread: self.thread_index(),
        }
    }

    pub fn thread_index(&self) -> usize {
        self.tsi as usize
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn vhost(&self) -> &Arc<VirtualHost> {
        &self.vhost
    }

    pub fn protocol_index(&self) -> usize {
        self.protocol
    }

    pub fn protocol(&self) -> &Protocol {
        self.vhost
            .protocol(self.protocol)
            .unwrap_or_else(|| self.vhost.default_protocol())
    }

    pub fn protocol_name(&self) -> &str {
        &self.protocol().name
    }

    pub fn kind(&self) -> Option<DescriptorKind> {
        self.kind
    }

    pub fn descriptor(&self) -> Option<&Descriptor> {
        self.desc.as_ref()
    }

    pub fn session(&self) -> Option<&[u8]> {
        self.session.as_ref().map(SessionData::as_slice)
    }

    pub fn session_mut(&mut self) -> Option<&mut [u8]> {
        self.session.as_mut().map(SessionData::as_mut_slice)
    }

    pub fn parent(&self) -> Option<ConnectionId> {
        self.parent
    }

    pub fn children(&self) -> &[ConnectionId] {
        &self.children
    }

    pub fn peer_addr(&self) -> Option<IpAddr> {
        self.peer.as_ref().map(PeerTicket::addr)
    }

    pub fn role_name(&self) -> Option<&'static str> {
        self.role.as_ref().map(|r| r.name())
    }

    pub fn tls_state(&self) -> TlsState {
        self.tls
    }

    pub fn set_tls_state(&mut self, tls: TlsState) {
        self.tls = tls;
    }

    pub fn is_registered(&self) -> bool {
        self.slot.is_some()
    }

    /// Position in the owning thread's poll table.
    pub fn poll_slot(&self) -> Option<usize> {
        self.slot
    }

    pub fn has_parse_context(&self) -> bool {
        self.parse.is_some()
    }

    /// Bytes waiting in the pending list for a parse context.
    pub fn pending_len(&self) -> usize {
        self.pending.iter().map(Vec::len).sum()
    }

    /// Hand the pending segments to someone else (e.g. a TLS acceptor that needs the
    /// ClientHello it was read ahead of).
    pub fn take_pending(&mut self) -> Vec<Vec<u8>> {
        self.pending.drain(..).collect()
    }

    /// Insert the descriptor into the owning thread's poll table. Idempotent.
    pub fn register(&mut self) -> Result<(), TableError> {
        if self.slot.is_some() {
            return Ok(());
        }
        if self.state >= LifecycleState::Closing {
            return Err(TableError::NoDescriptor);
        }
        let fd = match &self.desc {
            Some(desc) => desc.raw_fd(),
            None => return Err(TableError::NoDescriptor),
        };
        let pos = self.thread.insert(PollEntry {
            fd,
            events: POLLIN,
            conn: self.id,
        })?;
        self.slot = Some(pos);
        if self.state < LifecycleState::Registered {
            self.state = LifecycleState::Registered;
        }
        trace!(conn = %self.id, tsi = self.tsi, pos, "registered");
        Ok(())
    }

    /// Ask for one `Reason::Writeable` callback when the descriptor can take more bytes.
    pub fn request_writable(&self) -> bool {
        let Some(pos) = self.slot else {
            return false;
        };
        let ok = self.thread.add_events(pos, POLLOUT);
        if ok {
            self.thread.wake();
        }
        ok
    }

    /// Write straight to the descriptor. Returns how many bytes the kernel took.
    pub fn write(&self, bytes: &[u8]) -> std::io::Result<usize> {
        match &self.desc {
            Some(desc) => desc.write(bytes),
            None => Err(std::io::ErrorKind::NotConnected.into()),
        }
    }

    pub(crate) fn clear_writable(&self) {
        if let Some(pos) = self.slot {
            self.thread.clear_events(pos, POLLOUT);
        }
    }

    /// Stop polling for input while no parse context is available.
    pub(crate) fn park_input(&mut self) {
        if self.input_parked {
            return;
        }
        if let Some(pos) = self.slot {
            self.thread.clear_events(pos, POLLIN);
            self.input_parked = true;
            trace!(conn = %self.id, "input parked");
        }
    }

    pub(crate) fn resume_input(&mut self) {
        if !self.input_parked {
            return;
        }
        self.input_parked = false;
        if let Some(pos) = self.slot {
            self.thread.add_events(pos, POLLIN);
        }
    }

    pub(crate) fn input_parked(&self) -> bool {
        self.input_parked
    }

    pub(crate) fn set_state(&mut self, state: LifecycleState) {
        self.state = state;
    }

    pub(crate) fn attach_descriptor(&mut self, desc: Descriptor, kind: DescriptorKind) {
        self.desc = Some(desc);
        self.kind = Some(kind);
        self.state = LifecycleState::Placed;
    }

    pub(crate) fn set_peer(&mut self, ticket: Option<PeerTicket>) {
        self.peer = ticket;
    }

    /// Switch to protocol `index` and give it zeroed session data.
    pub(crate) fn bind_protocol(&mut self, index: usize) -> Result<(), AdoptionError> {
        self.protocol = index;
        let size = self.protocol().session_data_size;
        if self.session.is_none() && size > 0 {
            let data = SessionData::try_new(size, &self.counters.sessions)
                .map_err(|_| AdoptionError::OutOfMemory { size })?;
            self.session = Some(data);
        }
        Ok(())
    }

    pub(crate) fn role(&self) -> Option<&Arc<dyn Role>> {
        self.role.as_ref()
    }

    pub(crate) fn set_role(&mut self, role: Arc<dyn Role>) {
        self.role = Some(role);
    }

    pub(crate) fn set_parent(&mut self, parent: ConnectionId) {
        self.parent = Some(parent);
    }

    pub(crate) fn add_child(&mut self, child: ConnectionId) {
        self.children.push(child);
    }

    pub(crate) fn remove_child(&mut self, child: ConnectionId) {
        self.children.retain(|&c| c != child);
    }

    pub(crate) fn take_children(&mut self) -> Vec<ConnectionId> {
        std::mem::take(&mut self.children)
    }

    pub(crate) fn push_pending(&mut self, bytes: Vec<u8>) {
        self.pending.push_back(bytes);
    }

    /// Make sure a parse context is attached. A newly attached context takes over
    /// the pending segments, oldest first. False if the pool is exhausted.
    pub(crate) fn try_attach_parse_context(&mut self) -> bool {
        if self.parse.is_some() {
            return true;
        }
        let Some(mut parse) = self.thread.parse_pool().try_attach() else {
            return false;
        };
        for segment in self.pending.drain(..) {
            parse.stash(&segment);
        }
        self.parse = Some(parse);
        true
    }

    pub(crate) fn parse_context_mut(&mut self) -> Option<&mut ParseContext> {
        self.parse.as_mut()
    }

    pub(crate) fn take_parse_context(&mut self) -> Option<ParseContext> {
        self.parse.take()
    }

    /// Fire `reason` at protocol `index`. No lock is held here.
    pub(crate) fn notify(&mut self, index: usize, reason: Reason, payload: &[u8]) -> Disposition {
        let handler = match self.vhost.protocol(index) {
            Some(p) => Arc::clone(&p.handler),
            None => return Disposition::Close,
        };
        handler.callback(self, reason, payload)
    }

    pub(crate) fn notify_bound(&mut self, reason: Reason, payload: &[u8]) -> Disposition {
        self.notify(self.protocol, reason, payload)
    }

    /// Release everything the connection holds, by how far it got. Safe to call again.
    pub(crate) fn release(&mut self) {
        match self.state {
            LifecycleState::Freed => {}
            state if state < LifecycleState::Registered => self.rollback(),
            _ => self.teardown(),
        }
    }

    fn rollback(&mut self) {
        debug!(conn = %self.id, state = ?self.state, "rolling back adoption");
        metrics::inc_rollbacks();
        self.state = LifecycleState::Freed;
        self.parent = None;
        self.children.clear();
        self.pending.clear();
        self.parse = None;
        self.session = None;
        self.peer = None;
        self.role = None;
        self.desc = None;
        self.live = None;
    }

    fn teardown(&mut self) {
        debug!(conn = %self.id, state = ?self.state, "tearing down");
        metrics::inc_teardowns();
        self.state = LifecycleState::Closing;
        if let Some(pos) = self.slot.take() {
            self.thread.remove(pos);
        }
        self.pending.clear();
        self.parse = None;
        let _ = self.notify(DEFAULT_PROTOCOL, Reason::ConnectionDestroyed, &[]);
        self.session = None;
        self.peer = None;
        self.parent = None;
        self.children.clear();
        self.role = None;
        self.desc = None;
        self.live = None;
        self.state = LifecycleState::Freed;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("vhost", &self.vhost.name())
            .field("tsi", &self.tsi)
            .field("state", &self.state)
            .field("kind", &self.kind)
            .field("protocol", &self.protocol_name())
            .field("slot", &self.slot)
            .field("input_parked", &self.input_parked)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

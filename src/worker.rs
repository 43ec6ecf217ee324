//! The owning half of a service thread: receives adopted connections from the
//! handoff queue, polls their descriptors and drives the service path.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use disruptor::Polling;
use slab::Slab;
use tracing::{debug, error, info, trace};

use crate::connection::{Connection, ConnectionId, TlsState};
use crate::handoff::HandoffPoller;
use crate::poll_table::{POLLIN, POLLOUT};
use crate::protocol::Disposition;
use crate::service;
use crate::thread::ServiceThread;

/// Poll timeout used by `run` between shutdown checks.
const RUN_POLL_TIMEOUT_MS: i32 = 100;

const POLL_CLOSE_MASK: i16 = libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;

pub struct ServiceWorker {
    thread: Arc<ServiceThread>,
    handoff: HandoffPoller,
    conns: Slab<Connection>,
    by_id: HashMap<ConnectionId, usize>,
    /// Connections waiting for a parse context: pending readahead, or input parked.
    buffered: Vec<ConnectionId>,
    /// Children whose parent closed while they were still in the handoff queue.
    orphaned: HashSet<ConnectionId>,
    pollfds: Vec<libc::pollfd>,
    polled: Vec<Option<ConnectionId>>,
}

impl ServiceWorker {
    pub(crate) fn new(thread: Arc<ServiceThread>, handoff: HandoffPoller) -> Self {
        let capacity = thread.capacity().min(4096);
        Self {
            thread,
            handoff,
            conns: Slab::with_capacity(capacity),
            by_id: HashMap::with_capacity(capacity),
            buffered: Vec::new(),
            orphaned: HashSet::new(),
            pollfds: Vec::with_capacity(capacity + 1),
            polled: Vec::with_capacity(capacity + 1),
        }
    }

    pub fn index(&self) -> usize {
        self.thread.index()
    }

    pub fn thread(&self) -> &Arc<ServiceThread> {
        &self.thread
    }

    /// Connections this worker owns.
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.by_id.get(&id).map(|&key| &self.conns[key])
    }

    pub fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.by_id.get(&id).map(|&key| &mut self.conns[key])
    }

    /// Connections on the buffered-input list.
    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// Take every connection waiting in the handoff queue.
    pub fn drain_handoff(&mut self) -> usize {
        let mut received = Vec::new();
        match self.handoff.poll() {
            Ok(mut guard) => {
                for slot in &mut guard {
                    if let Some(conn) = slot.take() {
                        received.push(conn);
                    }
                }
            }
            Err(Polling::NoEvents) => {}
            Err(Polling::Shutdown) => return 0,
        }

        let count = received.len();
        for mut conn in received {
            let id = conn.id();
            if self.orphaned.remove(&id) {
                debug!(conn = %id, parent = ?conn.parent(), "parent already closed");
                conn.release();
                continue;
            }
            // A handshaking connection replays its pending bytes once established.
            let buffered = conn.pending_len() > 0 && conn.tls_state() != TlsState::Handshaking;
            let key = self.conns.insert(conn);
            self.by_id.insert(id, key);
            if buffered {
                self.buffered.push(id);
            }
            trace!(conn = %id, tsi = self.index(), "received");
        }
        count
    }

    /// Retry connections waiting for a parse context. Nothing is attempted while
    /// the pool is exhausted.
    pub fn service_buffered(&mut self) -> usize {
        let mut served = 0;
        for id in std::mem::take(&mut self.buffered) {
            let exhausted = self.thread.parse_pool().available() == 0;
            let Some(conn) = self.connection_mut(id) else {
                continue;
            };
            if conn.tls_state() == TlsState::Handshaking {
                continue;
            }
            if exhausted && !conn.has_parse_context() {
                self.buffered.push(id);
                continue;
            }
            let disposition = service::service_readable(conn);
            let waiting = conn.pending_len() > 0 || conn.input_parked();
            if disposition == Disposition::Close {
                self.close(id);
            } else if waiting {
                self.buffered.push(id);
            } else {
                served += 1;
            }
        }
        served
    }

    /// One service pass: take handoffs, retry buffered input, poll and dispatch.
    /// Returns the number of connection events handled.
    pub fn run_once(&mut self, timeout_ms: i32) -> io::Result<usize> {
        self.drain_handoff();
        self.service_buffered();
        self.collect_pollfds();

        // A parse context released since the retry pass is worth another pass now.
        let retry_now =
            !self.buffered.is_empty() && self.thread.parse_pool().available() > 0;
        let timeout = if retry_now { 0 } else { timeout_ms };
        let ready = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout,
            )
        };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        if ready == 0 {
            return Ok(0);
        }

        let events: Vec<(Option<ConnectionId>, i16)> = self
            .pollfds
            .iter()
            .zip(&self.polled)
            .filter(|(pfd, _)| pfd.revents != 0)
            .map(|(pfd, id)| (*id, pfd.revents))
            .collect();

        let mut handled = 0;
        for (id, revents) in events {
            match id {
                None => {
                    self.thread.waker().drain();
                    self.drain_handoff();
                }
                Some(id) => {
                    self.dispatch(id, revents);
                    handled += 1;
                }
            }
        }
        Ok(handled)
    }

    /// Snapshot of the poll table restricted to connections this worker already
    /// owns, plus the waker.
    fn collect_pollfds(&mut self) {
        let Self {
            thread,
            by_id,
            pollfds,
            polled,
            ..
        } = self;
        pollfds.clear();
        polled.clear();
        pollfds.push(libc::pollfd {
            fd: thread.waker().raw_fd(),
            events: POLLIN,
            revents: 0,
        });
        polled.push(None);
        thread.with_table(|table| {
            for (_, entry) in table.iter() {
                if !by_id.contains_key(&entry.conn) {
                    continue;
                }
                pollfds.push(libc::pollfd {
                    fd: entry.fd,
                    events: entry.events,
                    revents: 0,
                });
                polled.push(Some(entry.conn));
            }
        });
    }

    fn dispatch(&mut self, id: ConnectionId, revents: i16) {
        let Some(conn) = self.connection_mut(id) else {
            return;
        };
        let mut disposition = Disposition::Continue;
        if revents & POLLIN != 0 {
            disposition = service::service_readable(conn);
        } else if revents & POLL_CLOSE_MASK != 0 {
            debug!(conn = %id, revents, "descriptor error or hangup");
            disposition = Disposition::Close;
        }
        if disposition == Disposition::Continue && revents & POLLOUT != 0 {
            disposition = service::service_writable(conn);
        }
        if disposition == Disposition::Close {
            self.close(id);
            return;
        }
        let parked = conn.input_parked();
        if parked && !self.buffered.contains(&id) {
            self.buffered.push(id);
        }
    }

    /// Close `id`, its children first. Children still in flight to this thread
    /// are torn down as soon as they come out of the handoff queue.
    pub fn close(&mut self, id: ConnectionId) -> bool {
        let Some(key) = self.by_id.remove(&id) else {
            return false;
        };
        let mut conn = self.conns.remove(key);
        self.buffered.retain(|&b| b != id);

        for child in conn.take_children() {
            if !self.close(child) {
                self.orphaned.insert(child);
            }
        }
        if let Some(parent) = conn.parent()
            && let Some(parent) = self.connection_mut(parent)
        {
            parent.remove_child(id);
        }
        conn.release();
        true
    }

    pub fn close_all(&mut self) {
        let ids: Vec<ConnectionId> = self.by_id.keys().copied().collect();
        for id in ids {
            self.close(id);
        }
    }

    /// Serve until `shutdown` is set, then close everything owned.
    pub fn run(mut self, shutdown: Arc<AtomicBool>) {
        info!(tsi = self.index(), "service thread started");
        while !shutdown.load(Ordering::Relaxed) {
            if let Err(e) = self.run_once(RUN_POLL_TIMEOUT_MS) {
                error!(tsi = self.index(), error = %e, "poll failed");
                break;
            }
        }
        self.drain_handoff();
        self.close_all();
        info!(tsi = self.index(), "service thread stopped");
    }

    pub fn spawn(self, shutdown: Arc<AtomicBool>) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("svc-{}", self.index()))
            .spawn(move || self.run(shutdown))
    }
}

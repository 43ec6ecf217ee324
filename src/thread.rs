//! Per-thread service context: the shared half of one service thread.
//!
//! Adopting threads reach it to place connections, insert into its poll table and
//! hand finished connections over; its `ServiceWorker` owns the other half.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::config::ServiceConfig;
use crate::connection::Connection;
use crate::error::TableError;
use crate::handoff::{HandoffPoller, HandoffProducer, build_handoff_channel};
use crate::metrics;
use crate::parse::ParsePool;
use crate::poll_table::{PollEntry, PollTable};
use crate::waker::Waker;

pub struct ServiceThread {
    index: usize,
    capacity: usize,
    /// Structural lock: every insertion or removal holds it.
    table: Mutex<PollTable>,
    /// Mirror of `table.len()` so placement can compare threads without locking each.
    occupancy: AtomicUsize,
    parse_pool: Arc<ParsePool>,
    handoff: Mutex<HandoffProducer>,
    waker: Arc<Waker>,
}

impl ServiceThread {
    pub(crate) fn new(index: usize, config: &ServiceConfig) -> io::Result<(Arc<Self>, HandoffPoller)> {
        let waker = Arc::new(Waker::new()?);
        let (producer, poller) = build_handoff_channel(config.handoff_queue_size);
        let thread = Arc::new(Self {
            index,
            capacity: config.fd_limit_per_thread,
            table: Mutex::new(PollTable::new(config.fd_limit_per_thread)),
            occupancy: AtomicUsize::new(0),
            parse_pool: ParsePool::with_waker(
                config.parse_contexts_per_thread,
                config.rx_buffer_size,
                Arc::clone(&waker),
            ),
            handoff: Mutex::new(producer),
            waker,
        });
        Ok((thread, poller))
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn occupancy(&self) -> usize {
        self.occupancy.load(Ordering::Acquire)
    }

    pub fn has_capacity(&self) -> bool {
        self.occupancy() < self.capacity
    }

    pub fn parse_pool(&self) -> &Arc<ParsePool> {
        &self.parse_pool
    }

    pub fn insert(&self, entry: PollEntry) -> Result<usize, TableError> {
        let mut table = self.table.lock();
        let pos = table.insert(entry)?;
        self.occupancy.store(table.len(), Ordering::Release);
        Ok(pos)
    }

    pub fn remove(&self, pos: usize) -> Option<PollEntry> {
        let mut table = self.table.lock();
        let entry = table.remove(pos);
        self.occupancy.store(table.len(), Ordering::Release);
        entry
    }

    pub fn add_events(&self, pos: usize, events: i16) -> bool {
        self.table.lock().add_events(pos, events)
    }

    pub fn clear_events(&self, pos: usize, events: i16) -> bool {
        self.table.lock().clear_events(pos, events)
    }

    /// Run `f` against the table under the structural lock. `f` must not call back
    /// into protocol code.
    pub fn with_table<R>(&self, f: impl FnOnce(&PollTable) -> R) -> R {
        f(&*self.table.lock())
    }

    /// Kick the service loop so it re-reads its poll set.
    pub fn wake(&self) {
        self.waker.wake();
    }

    pub(crate) fn waker(&self) -> &Waker {
        &self.waker
    }

    pub(crate) fn hand_off(&self, conn: Connection) -> Result<(), Connection> {
        self.handoff.lock().send(conn)?;
        metrics::inc_handoffs();
        Ok(())
    }
}

/// Index of the least-occupied thread that still has room, lowest index on ties.
pub(crate) fn pick_idlest(loads: impl IntoIterator<Item = (usize, usize)>) -> Option<usize> {
    let mut best: Option<(usize, usize)> = None;
    for (index, (occupancy, capacity)) in loads.into_iter().enumerate() {
        if occupancy >= capacity {
            continue;
        }
        if best.is_none_or(|(_, lowest)| occupancy < lowest) {
            best = Some((index, occupancy));
        }
    }
    best.map(|(index, _)| index)
}

//! Per-thread table of descriptors under active poll.
//!
//! Positions are slab keys, stable for the lifetime of an entry, so a connection can
//! hold its position without it being relocated under it.

use std::collections::HashMap;
use std::os::fd::RawFd;

use slab::Slab;

use crate::connection::ConnectionId;
use crate::error::TableError;

pub const POLLIN: i16 = libc::POLLIN;
pub const POLLOUT: i16 = libc::POLLOUT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEntry {
    pub fd: RawFd,
    pub events: i16,
    pub conn: ConnectionId,
}

pub struct PollTable {
    entries: Slab<PollEntry>,
    by_fd: HashMap<RawFd, usize>,
    capacity: usize,
}

impl PollTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Slab::with_capacity(capacity),
            by_fd: HashMap::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn insert(&mut self, entry: PollEntry) -> Result<usize, TableError> {
        if self.by_fd.contains_key(&entry.fd) {
            return Err(TableError::DuplicateEntry { fd: entry.fd });
        }
        if self.entries.len() >= self.capacity {
            return Err(TableError::TableFull {
                capacity: self.capacity,
            });
        }
        let pos = self.entries.insert(entry);
        self.by_fd.insert(entry.fd, pos);
        Ok(pos)
    }

    pub fn remove(&mut self, pos: usize) -> Option<PollEntry> {
        let entry = self.entries.try_remove(pos)?;
        self.by_fd.remove(&entry.fd);
        Some(entry)
    }

    pub fn get(&self, pos: usize) -> Option<&PollEntry> {
        self.entries.get(pos)
    }

    pub fn position_of(&self, fd: RawFd) -> Option<usize> {
        self.by_fd.get(&fd).copied()
    }

    /// OR `events` into the entry's interest set. Returns false if `pos` is vacant.
    pub fn add_events(&mut self, pos: usize, events: i16) -> bool {
        match self.entries.get_mut(pos) {
            Some(entry) => {
                entry.events |= events;
                true
            }
            None => false,
        }
    }

    pub fn clear_events(&mut self, pos: usize, events: i16) -> bool {
        match self.entries.get_mut(pos) {
            Some(entry) => {
                entry.events &= !events;
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &PollEntry)> {
        self.entries.iter()
    }
}

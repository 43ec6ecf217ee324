//! Per-thread pool of parse contexts.
//!
//! A parse context is the read staging area a connection needs before its protocol can
//! consume input. The pool is bounded; a connection that cannot get one keeps any
//! read-ahead bytes in its pending list and stops polling for input until one is
//! released. Releasing into an empty pool wakes the owning thread.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::waker::Waker;

pub struct ParsePool {
    free: Mutex<Vec<Box<[u8]>>>,
    capacity: usize,
    waker: Option<Arc<Waker>>,
}

impl ParsePool {
    pub fn new(count: usize, buf_size: usize) -> Arc<Self> {
        Self::build(count, buf_size, None)
    }

    /// Pool that kicks `waker` whenever a buffer comes back to an exhausted pool.
    pub fn with_waker(count: usize, buf_size: usize, waker: Arc<Waker>) -> Arc<Self> {
        Self::build(count, buf_size, Some(waker))
    }

    fn build(count: usize, buf_size: usize, waker: Option<Arc<Waker>>) -> Arc<Self> {
        let free = (0..count)
            .map(|_| vec![0u8; buf_size].into_boxed_slice())
            .collect();
        Arc::new(Self {
            free: Mutex::new(free),
            capacity: count,
            waker,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    pub fn try_attach(self: &Arc<Self>) -> Option<ParseContext> {
        let buf = self.free.lock().pop()?;
        Some(ParseContext {
            pool: Arc::clone(self),
            buf: Some(buf),
            stash: Vec::new(),
        })
    }
}

/// Attached parse context. Returns its buffer to the pool on drop.
pub struct ParseContext {
    pool: Arc<ParsePool>,
    buf: Option<Box<[u8]>>,
    stash: Vec<u8>,
}

impl ParseContext {
    /// Queue bytes that must be delivered before anything read from the descriptor.
    pub fn stash(&mut self, bytes: &[u8]) {
        self.stash.extend_from_slice(bytes);
    }

    pub fn has_stash(&self) -> bool {
        !self.stash.is_empty()
    }

    pub fn take_stash(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.stash)
    }

    pub fn buf_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for ParseContext {
    fn drop(&mut self) {
        let Some(buf) = self.buf.take() else {
            return;
        };
        let was_empty = {
            let mut free = self.pool.free.lock();
            free.push(buf);
            free.len() == 1
        };
        if was_empty && let Some(waker) = &self.pool.waker {
            waker.wake();
        }
    }
}

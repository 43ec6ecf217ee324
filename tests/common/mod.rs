#![allow(dead_code)]

use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::Arc;

use parking_lot::Mutex;

use adoptd::{
    Connection, ConnectionId, Context, Disposition, Protocol, ProtocolHandler, Reason,
    ServiceConfig, ServiceWorker, VirtualHost,
};

/// One callback as seen by a `Recorder`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub conn: ConnectionId,
    pub reason: Reason,
    pub payload: Vec<u8>,
}

/// Protocol handler that records every callback and optionally asks to close on one reason.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
    close_on: Option<Reason>,
    request_writable: bool,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn closing_on(reason: Reason) -> Self {
        Self {
            close_on: Some(reason),
            ..Self::default()
        }
    }

    /// Ask for writability from the birth notification.
    pub fn requesting_writable() -> Self {
        Self {
            request_writable: true,
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn reasons(&self) -> Vec<Reason> {
        self.events.lock().iter().map(|e| e.reason).collect()
    }

    pub fn count(&self, reason: Reason) -> usize {
        self.events.lock().iter().filter(|e| e.reason == reason).count()
    }

    /// Concatenated payloads of every receive-type callback, in order.
    pub fn received(&self) -> Vec<u8> {
        self.events
            .lock()
            .iter()
            .filter(|e| {
                matches!(
                    e.reason,
                    Reason::Receive | Reason::RawRx | Reason::RawRxFile
                )
            })
            .flat_map(|e| e.payload.iter().copied())
            .collect()
    }

    pub fn protocol(&self, name: &str) -> Protocol {
        Protocol::new(name, self.clone())
    }
}

impl ProtocolHandler for Recorder {
    fn callback(&self, conn: &mut Connection, reason: Reason, payload: &[u8]) -> Disposition {
        self.events.lock().push(Event {
            conn: conn.id(),
            reason,
            payload: payload.to_vec(),
        });
        if self.request_writable
            && matches!(reason, Reason::NewClientInstantiated | Reason::RawAdopt)
        {
            assert!(conn.request_writable());
        }
        if self.close_on == Some(reason) {
            Disposition::Close
        } else {
            Disposition::Continue
        }
    }
}

pub fn vhost_with(recorder: &Recorder) -> Arc<VirtualHost> {
    VirtualHost::builder("default")
        .protocol(recorder.protocol("http"))
        .build()
        .unwrap()
}

pub fn context(
    threads: usize,
    fd_limit: usize,
    vhost: &Arc<VirtualHost>,
) -> (Arc<Context>, Vec<ServiceWorker>) {
    Context::builder(ServiceConfig::with_threads(threads, fd_limit))
        .vhost(Arc::clone(vhost))
        .build()
        .unwrap()
}

pub fn context_with(
    config: ServiceConfig,
    vhost: &Arc<VirtualHost>,
) -> (Arc<Context>, Vec<ServiceWorker>) {
    Context::builder(config)
        .vhost(Arc::clone(vhost))
        .build()
        .unwrap()
}

/// Anonymous pipe as (read end, write end).
pub fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0 as libc::c_int; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

/// Run the worker until `done` holds or the attempts run out.
pub fn pump(worker: &mut ServiceWorker, mut done: impl FnMut(&ServiceWorker) -> bool) -> bool {
    for _ in 0..50 {
        if done(worker) {
            return true;
        }
        worker.run_once(20).unwrap();
    }
    done(worker)
}

/// True once the other end of `stream` has been closed. Never blocks.
pub fn peer_closed(stream: &std::os::unix::net::UnixStream) -> bool {
    use std::io::Read;
    stream.set_nonblocking(true).unwrap();
    let mut buf = [0u8; 64];
    matches!((&*stream).read(&mut buf), Ok(0))
}

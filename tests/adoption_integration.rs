//! Integration tests: adoption end to end with real descriptors, driven through
//! the service workers with `run_once`.

mod common;

use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, TcpListener, TcpStream, UdpSocket};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use adoptd::poll_table::{POLLIN, PollEntry};
use adoptd::{
    AdoptionError, Connection, ConnectionId, Context, Descriptor, DescriptorKind, Handshake,
    LifecycleState, Protocol, Reason, RoleRegistry, ServiceConfig, TlsAcceptor, TlsError,
    TlsState, VirtualHost,
};

use common::{Recorder, context, context_with, peer_closed, pipe, pump, vhost_with};

/// Occupy `n` slots of thread `tsi` with entries no worker owns.
fn fill(ctx: &Context, tsi: usize, n: usize) {
    let thread = ctx.thread(tsi).unwrap();
    for i in 0..n {
        thread
            .insert(PollEntry {
                fd: 10_000 + (tsi * 1000 + i) as i32,
                events: POLLIN,
                conn: ConnectionId(u64::MAX - (tsi * 1000 + i) as u64),
            })
            .unwrap();
    }
}

#[test]
fn placement_picks_least_loaded_thread() {
    let rec = Recorder::new();
    let vhost = vhost_with(&rec);
    let (ctx, _workers) = context(2, 8, &vhost);
    fill(&ctx, 0, 3);
    fill(&ctx, 1, 1);

    let conn = ctx.create_connection(&vhost, None).unwrap();
    assert_eq!(conn.thread_index(), 1);
    assert_eq!(conn.state(), LifecycleState::Unconnected);
    assert_eq!(conn.protocol_index(), 0);
    assert!(!conn.is_registered());
    assert!(conn.descriptor().is_none());
    // Creation never touches a poll table.
    assert_eq!(ctx.thread(1).unwrap().occupancy(), 1);
    assert_eq!(rec.reasons(), vec![Reason::ConnectionCreated]);
    assert_eq!(ctx.live_connections(), 1);

    drop(conn);
    assert_eq!(ctx.live_connections(), 0);
    assert_eq!(rec.count(Reason::ConnectionDestroyed), 0);
}

#[test]
fn full_context_rejects_and_closes_descriptor() {
    let rec = Recorder::new();
    let vhost = vhost_with(&rec);
    let (ctx, _workers) = context(2, 4, &vhost);
    fill(&ctx, 0, 4);
    fill(&ctx, 1, 4);

    assert!(matches!(
        ctx.create_connection(&vhost, None),
        Err(adoptd::AdmissionError::NoCapacity)
    ));

    let (a, b) = UnixStream::pair().unwrap();
    let err = ctx.adopt_socket(&vhost, a).unwrap_err();
    assert!(matches!(err, AdoptionError::NoCapacity));
    assert!(peer_closed(&b));
    assert!(rec.events().is_empty());
    assert_eq!(ctx.live_connections(), 0);
}

#[test]
fn unknown_protocol_rolls_back_silently() {
    let rec = Recorder::new();
    let vhost = vhost_with(&rec);
    let (ctx, _workers) = context(1, 8, &vhost);

    let (a, b) = UnixStream::pair().unwrap();
    let err = ctx
        .adopt(
            &vhost,
            a.into(),
            DescriptorKind::RawSocket,
            Some("chat"),
            None,
        )
        .unwrap_err();
    match err {
        AdoptionError::UnknownProtocol { name, vhost } => {
            assert_eq!(name, "chat");
            assert_eq!(vhost, "default");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(peer_closed(&b));
    assert_eq!(rec.reasons(), vec![Reason::ConnectionCreated]);
    assert_eq!(ctx.thread(0).unwrap().occupancy(), 0);
    assert_eq!(ctx.live_connections(), 0);
}

#[test]
fn unsupported_kind_rolls_back() {
    let rec = Recorder::new();
    let vhost = vhost_with(&rec);
    let (ctx, _workers) = Context::builder(ServiceConfig::with_threads(1, 8))
        .vhost(Arc::clone(&vhost))
        .roles(RoleRegistry::empty())
        .build()
        .unwrap();

    let (a, b) = UnixStream::pair().unwrap();
    let err = ctx.adopt_socket(&vhost, a).unwrap_err();
    assert!(matches!(
        err,
        AdoptionError::UnsupportedDescriptorKind(DescriptorKind::Http)
    ));
    assert!(peer_closed(&b));
    assert_eq!(rec.count(Reason::ConnectionDestroyed), 0);
    assert_eq!(ctx.live_connections(), 0);
}

#[test]
fn session_data_is_allocated_on_bind_and_released_on_close() {
    let rec = Recorder::new();
    let chat = Recorder::new();
    let vhost = VirtualHost::builder("default")
        .protocol(rec.protocol("http"))
        .protocol(chat.protocol("chat").with_session_data(64))
        .build()
        .unwrap();
    let (ctx, mut workers) = context(1, 8, &vhost);

    let (a, _b) = UnixStream::pair().unwrap();
    let handle = ctx
        .adopt(&vhost, a.into(), DescriptorKind::RawSocket, Some("chat"), None)
        .unwrap()
        .unwrap();
    assert_eq!(ctx.live_session_blocks(), 1);
    assert_eq!(chat.reasons(), vec![Reason::RawAdopt]);

    let worker = &mut workers[0];
    assert_eq!(worker.drain_handoff(), 1);
    let conn = worker.connection(handle.id).unwrap();
    assert_eq!(conn.protocol_name(), "chat");
    assert_eq!(conn.role_name(), Some("raw-skt"));
    assert_eq!(conn.state(), LifecycleState::Live);
    assert!(conn.session().unwrap().iter().all(|&b| b == 0));
    assert_eq!(conn.session().unwrap().len(), 64);

    assert!(worker.close(handle.id));
    assert_eq!(ctx.live_session_blocks(), 0);
    assert_eq!(ctx.live_connections(), 0);
    // Destruction goes to the default protocol.
    assert_eq!(rec.count(Reason::ConnectionDestroyed), 1);
    assert_eq!(chat.count(Reason::ConnectionDestroyed), 0);
}

#[test]
fn session_allocation_failure_is_out_of_memory() {
    let rec = Recorder::new();
    let vhost = VirtualHost::builder("default")
        .protocol(rec.protocol("http"))
        .protocol(Protocol::new("huge", rec.clone()).with_session_data(usize::MAX))
        .build()
        .unwrap();
    let (ctx, _workers) = context(1, 8, &vhost);

    let (a, b) = UnixStream::pair().unwrap();
    let err = ctx
        .adopt(&vhost, a.into(), DescriptorKind::RawSocket, Some("huge"), None)
        .unwrap_err();
    assert!(matches!(err, AdoptionError::OutOfMemory { size: usize::MAX }));
    assert!(peer_closed(&b));
    assert_eq!(ctx.live_session_blocks(), 0);
    assert_eq!(ctx.live_connections(), 0);
    assert_eq!(rec.count(Reason::ConnectionDestroyed), 0);
}

#[test]
fn close_from_birth_notification_tears_down() {
    let rec = Recorder::closing_on(Reason::NewClientInstantiated);
    let vhost = vhost_with(&rec);
    let (ctx, mut workers) = context(1, 8, &vhost);

    let (a, b) = UnixStream::pair().unwrap();
    assert!(ctx.adopt_socket(&vhost, a).unwrap().is_none());
    assert_eq!(
        rec.reasons(),
        vec![
            Reason::ConnectionCreated,
            Reason::NewClientInstantiated,
            Reason::ConnectionDestroyed,
        ]
    );
    assert_eq!(ctx.thread(0).unwrap().occupancy(), 0);
    assert_eq!(ctx.live_connections(), 0);
    assert!(peer_closed(&b));
    assert_eq!(workers[0].drain_handoff(), 0);
}

#[test]
fn readahead_is_replayed_before_socket_bytes() {
    let rec = Recorder::new();
    let vhost = vhost_with(&rec);
    let (ctx, mut workers) = context(1, 8, &vhost);

    let (a, mut b) = UnixStream::pair().unwrap();
    b.write_all(b"Host: x\r\n\r\n").unwrap();
    let handle = ctx
        .adopt_with_prebuffered(&vhost, a, b"GET / HTTP/1.1\r\n".to_vec())
        .unwrap()
        .unwrap();

    // A parse context was free, so both were serviced before adopt returned.
    assert_eq!(rec.received(), b"GET / HTTP/1.1\r\nHost: x\r\n\r\n".to_vec());
    let receives: Vec<_> = rec
        .events()
        .into_iter()
        .filter(|e| e.reason == Reason::Receive)
        .map(|e| e.payload)
        .collect();
    assert_eq!(receives[0], b"GET / HTTP/1.1\r\n".to_vec());

    let worker = &mut workers[0];
    worker.drain_handoff();
    assert_eq!(worker.buffered_len(), 0);
    assert_eq!(worker.connection(handle.id).unwrap().pending_len(), 0);
}

#[test]
fn readahead_waits_for_a_parse_context() {
    let rec = Recorder::new();
    let vhost = vhost_with(&rec);
    let config = ServiceConfig {
        parse_contexts_per_thread: 1,
        ..ServiceConfig::with_threads(1, 8)
    };
    let (ctx, mut workers) = context_with(config, &vhost);
    let held = ctx.thread(0).unwrap().parse_pool().try_attach().unwrap();

    let (a, mut b) = UnixStream::pair().unwrap();
    let handle = ctx
        .adopt_with_prebuffered(&vhost, a, b"early".to_vec())
        .unwrap()
        .unwrap();
    assert!(rec.received().is_empty());

    let worker = &mut workers[0];
    worker.drain_handoff();
    assert_eq!(worker.buffered_len(), 1);
    assert_eq!(worker.connection(handle.id).unwrap().pending_len(), 5);

    b.write_all(b"-late").unwrap();
    worker.run_once(0).unwrap();
    assert!(rec.received().is_empty());
    assert_eq!(worker.buffered_len(), 1);

    drop(held);
    assert!(pump(worker, |_| rec.received() == b"early-late".to_vec()));
    assert_eq!(worker.buffered_len(), 0);
    assert_eq!(worker.connection(handle.id).unwrap().pending_len(), 0);
}

#[test]
fn peer_limit_admits_exactly_k_concurrent_connections() {
    const LIMIT: u32 = 4;
    const CLIENTS: usize = 7;

    let rec = Recorder::new();
    let vhost = VirtualHost::builder("default")
        .protocol(rec.protocol("http"))
        .peer_limit(LIMIT)
        .build()
        .unwrap();
    let (ctx, mut workers) = context(2, 64, &vhost);

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let clients: Vec<TcpStream> = (0..CLIENTS)
        .map(|_| TcpStream::connect(addr).unwrap())
        .collect();
    let accepted: Vec<TcpStream> = (0..CLIENTS)
        .map(|_| listener.accept().unwrap().0)
        .collect();

    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = accepted
            .into_iter()
            .map(|stream| {
                let ctx = &ctx;
                let vhost = &vhost;
                s.spawn(move || ctx.adopt_socket(vhost, stream))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let admitted = results.iter().filter(|r| matches!(r, Ok(Some(_)))).count();
    let denied = results
        .iter()
        .filter(|r| matches!(r, Err(AdoptionError::PeerLimitExceeded { limit: LIMIT, .. })))
        .count();
    assert_eq!(admitted, LIMIT as usize);
    assert_eq!(denied, CLIENTS - LIMIT as usize);

    let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
    assert_eq!(vhost.peers().count(localhost), LIMIT);

    for worker in &mut workers {
        worker.drain_handoff();
        worker.close_all();
    }
    assert_eq!(vhost.peers().count(localhost), 0);
    assert_eq!(vhost.peers().peers(), 0);
    assert_eq!(ctx.live_connections(), 0);
    drop(clients);
}

#[test]
fn children_share_parent_thread_and_close_first() {
    let rec = Recorder::new();
    let vhost = vhost_with(&rec);
    let (ctx, mut workers) = context(2, 8, &vhost);
    fill(&ctx, 0, 1);

    let (pa, _pb) = UnixStream::pair().unwrap();
    let parent = ctx
        .adopt(&vhost, pa.into(), DescriptorKind::RawSocket, None, None)
        .unwrap()
        .unwrap();
    assert_eq!(parent.thread, 1);

    let worker = &mut workers[1];
    worker.drain_handoff();

    // Thread 0 now ties thread 1, so automatic placement would pick 0.
    let (ca, _cb) = UnixStream::pair().unwrap();
    let child = {
        let parent_conn = worker.connection_mut(parent.id).unwrap();
        ctx.adopt(
            &vhost,
            ca.into(),
            DescriptorKind::RawSocket,
            None,
            Some(parent_conn),
        )
        .unwrap()
        .unwrap()
    };
    assert_eq!(child.thread, 1);

    // A failed child leaves no trace on the parent.
    let (fa, _fb) = UnixStream::pair().unwrap();
    {
        let parent_conn = worker.connection_mut(parent.id).unwrap();
        let err = ctx
            .adopt(
                &vhost,
                fa.into(),
                DescriptorKind::RawSocket,
                Some("nope"),
                Some(parent_conn),
            )
            .unwrap_err();
        assert!(matches!(err, AdoptionError::UnknownProtocol { .. }));
    }

    worker.drain_handoff();
    assert_eq!(
        worker.connection(parent.id).unwrap().children(),
        &[child.id]
    );
    assert_eq!(worker.connection(child.id).unwrap().parent(), Some(parent.id));

    assert!(worker.close(parent.id));
    let destroyed: Vec<ConnectionId> = rec
        .events()
        .into_iter()
        .filter(|e| e.reason == Reason::ConnectionDestroyed)
        .map(|e| e.conn)
        .collect();
    assert_eq!(destroyed, vec![child.id, parent.id]);
    assert!(worker.is_empty());
    assert_eq!(ctx.live_connections(), 0);
}

struct FakeTls {
    register: bool,
    accepted: AtomicUsize,
    resumed: AtomicUsize,
}

impl FakeTls {
    fn new(register: bool) -> Arc<Self> {
        Arc::new(Self {
            register,
            accepted: AtomicUsize::new(0),
            resumed: AtomicUsize::new(0),
        })
    }
}

impl TlsAcceptor for FakeTls {
    fn accept(&self, conn: &mut Connection) -> Result<(), TlsError> {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        if self.register {
            conn.register().map_err(|e| TlsError(e.to_string()))?;
        }
        Ok(())
    }

    fn resume(&self, _conn: &mut Connection) -> Result<Handshake, TlsError> {
        self.resumed.fetch_add(1, Ordering::Relaxed);
        Ok(Handshake::Complete)
    }
}

#[test]
fn tls_vhost_adopts_through_acceptor() {
    let rec = Recorder::new();
    let tls = FakeTls::new(true);
    let vhost = VirtualHost::builder("secure")
        .protocol(rec.protocol("http"))
        .tls(tls.clone())
        .build()
        .unwrap();
    let (ctx, mut workers) = context(1, 8, &vhost);

    let (a, mut b) = UnixStream::pair().unwrap();
    let handle = ctx.adopt_socket(&vhost, a).unwrap().unwrap();
    assert_eq!(tls.accepted.load(Ordering::Relaxed), 1);

    let worker = &mut workers[0];
    worker.drain_handoff();
    let conn = worker.connection(handle.id).unwrap();
    assert_eq!(conn.tls_state(), TlsState::Handshaking);
    assert!(!conn.has_parse_context());

    b.write_all(b"hello").unwrap();
    assert!(pump(worker, |_| rec.received() == b"hello".to_vec()));
    assert_eq!(tls.resumed.load(Ordering::Relaxed), 1);
    assert_eq!(
        worker.connection(handle.id).unwrap().tls_state(),
        TlsState::Established
    );
}

#[test]
fn acceptor_that_never_registers_fails_adoption() {
    let rec = Recorder::new();
    let vhost = VirtualHost::builder("secure")
        .protocol(rec.protocol("http"))
        .tls(FakeTls::new(false))
        .build()
        .unwrap();
    let (ctx, _workers) = context(1, 8, &vhost);

    let (a, b) = UnixStream::pair().unwrap();
    let err = ctx.adopt_socket(&vhost, a).unwrap_err();
    assert!(matches!(err, AdoptionError::TlsNegotiationFailed(_)));
    assert!(peer_closed(&b));
    assert_eq!(rec.reasons(), vec![Reason::ConnectionCreated]);
    assert_eq!(ctx.live_connections(), 0);
}

#[test]
fn writable_request_from_birth_is_delivered_once() {
    let rec = Recorder::requesting_writable();
    let vhost = vhost_with(&rec);
    let (ctx, mut workers) = context(1, 8, &vhost);

    let (a, _b) = UnixStream::pair().unwrap();
    ctx.adopt_socket(&vhost, a).unwrap().unwrap();

    let worker = &mut workers[0];
    assert!(pump(worker, |_| rec.count(Reason::Writeable) == 1));
    worker.run_once(0).unwrap();
    assert_eq!(rec.count(Reason::Writeable), 1);
}

#[test]
fn peer_hangup_closes_connection() {
    let rec = Recorder::new();
    let vhost = vhost_with(&rec);
    let (ctx, mut workers) = context(1, 8, &vhost);

    let (a, b) = UnixStream::pair().unwrap();
    ctx.adopt_socket(&vhost, a).unwrap().unwrap();
    let worker = &mut workers[0];
    worker.drain_handoff();
    assert_eq!(worker.len(), 1);

    drop(b);
    assert!(pump(worker, |w| w.is_empty()));
    assert_eq!(rec.count(Reason::ConnectionDestroyed), 1);
    assert_eq!(ctx.thread(0).unwrap().occupancy(), 0);
    assert_eq!(ctx.live_connections(), 0);
}

#[test]
fn file_descriptors_use_file_reasons() {
    let rec = Recorder::new();
    let vhost = vhost_with(&rec);
    let (ctx, mut workers) = context(1, 8, &vhost);

    let (read_end, write_end) = pipe();
    let handle = ctx
        .adopt(
            &vhost,
            Descriptor::File(read_end),
            DescriptorKind::File,
            None,
            None,
        )
        .unwrap()
        .unwrap();
    assert!(rec.reasons().contains(&Reason::RawAdoptFile));

    let worker = &mut workers[0];
    worker.drain_handoff();
    assert_eq!(worker.connection(handle.id).unwrap().peer_addr(), None);
    assert_eq!(worker.connection(handle.id).unwrap().role_name(), Some("raw-file"));

    let mut writer = std::fs::File::from(write_end);
    writer.write_all(b"log line\n").unwrap();
    assert!(pump(worker, |_| rec.received() == b"log line\n".to_vec()));
    assert_eq!(rec.count(Reason::RawRxFile), 1);

    drop(writer);
    assert!(pump(worker, |w| w.is_empty()));
}

#[test]
fn udp_endpoint_receives_datagrams() {
    let rec = Recorder::new();
    let vhost = vhost_with(&rec);
    let (ctx, mut workers) = context(1, 8, &vhost);

    let handle = ctx
        .bootstrap_udp(&vhost, 0, true, None, None)
        .unwrap()
        .unwrap();
    assert!(rec.reasons().contains(&Reason::RawAdopt));

    let worker = &mut workers[0];
    worker.drain_handoff();
    let conn = worker.connection(handle.id).unwrap();
    assert_eq!(conn.kind(), Some(DescriptorKind::Udp));
    assert_eq!(conn.role_name(), Some("raw-udp"));
    let port = match conn.descriptor().unwrap() {
        Descriptor::Socket(s) => s.local_addr().unwrap().as_socket().unwrap().port(),
        Descriptor::File(_) => unreachable!(),
    };

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    sender.send_to(b"ping", ("127.0.0.1", port)).unwrap();
    assert!(pump(worker, |_| rec.received() == b"ping".to_vec()));
    assert_eq!(rec.count(Reason::RawRx), 1);
}

#[test]
fn child_on_full_parent_thread_rolls_back() {
    let rec = Recorder::new();
    let vhost = vhost_with(&rec);
    let (ctx, mut workers) = context(1, 4, &vhost);

    let (pa, _pb) = UnixStream::pair().unwrap();
    let parent = ctx
        .adopt(&vhost, pa.into(), DescriptorKind::RawSocket, None, None)
        .unwrap()
        .unwrap();
    let worker = &mut workers[0];
    worker.drain_handoff();
    fill(&ctx, 0, 3);
    assert!(!ctx.thread(0).unwrap().has_capacity());

    let (ca, cb) = UnixStream::pair().unwrap();
    let err = {
        let parent_conn = worker.connection_mut(parent.id).unwrap();
        ctx.adopt(
            &vhost,
            ca.into(),
            DescriptorKind::RawSocket,
            None,
            Some(parent_conn),
        )
        .unwrap_err()
    };
    assert!(matches!(err, AdoptionError::TableFull { capacity: 4 }));
    assert!(peer_closed(&cb));
    assert_eq!(rec.count(Reason::RawAdopt), 1);
    assert_eq!(rec.count(Reason::ConnectionDestroyed), 0);
    assert_eq!(ctx.live_connections(), 1);
    assert_eq!(ctx.thread(0).unwrap().occupancy(), 4);
    assert!(worker.connection(parent.id).unwrap().children().is_empty());
    assert_eq!(worker.drain_handoff(), 0);
}

#[test]
fn duplicate_descriptor_rolls_back() {
    let rec = Recorder::new();
    let vhost = vhost_with(&rec);
    let (ctx, mut workers) = context(1, 8, &vhost);

    let (a, b) = UnixStream::pair().unwrap();
    let fd = a.as_raw_fd();
    ctx.thread(0)
        .unwrap()
        .insert(PollEntry {
            fd,
            events: POLLIN,
            conn: ConnectionId(u64::MAX),
        })
        .unwrap();

    let err = ctx.adopt_socket(&vhost, a).unwrap_err();
    assert!(matches!(err, AdoptionError::DuplicateEntry { fd: dup } if dup == fd));
    assert!(peer_closed(&b));
    assert_eq!(rec.reasons(), vec![Reason::ConnectionCreated]);
    assert_eq!(ctx.live_connections(), 0);
    assert_eq!(ctx.thread(0).unwrap().occupancy(), 1);
    assert_eq!(workers[0].drain_handoff(), 0);
}

#[test]
fn closing_parent_tears_down_child_still_in_flight() {
    let rec = Recorder::new();
    let vhost = vhost_with(&rec);
    let (ctx, mut workers) = context(1, 8, &vhost);

    let (pa, _pb) = UnixStream::pair().unwrap();
    let parent = ctx
        .adopt(&vhost, pa.into(), DescriptorKind::RawSocket, None, None)
        .unwrap()
        .unwrap();
    let worker = &mut workers[0];
    worker.drain_handoff();

    let (ca, cb) = UnixStream::pair().unwrap();
    let child = {
        let parent_conn = worker.connection_mut(parent.id).unwrap();
        ctx.adopt(
            &vhost,
            ca.into(),
            DescriptorKind::RawSocket,
            None,
            Some(parent_conn),
        )
        .unwrap()
        .unwrap()
    };

    // The child is still in the handoff queue when its parent goes.
    assert!(worker.close(parent.id));
    assert_eq!(ctx.live_connections(), 1);

    assert_eq!(worker.drain_handoff(), 1);
    assert!(worker.connection(child.id).is_none());
    assert!(worker.is_empty());
    assert!(peer_closed(&cb));
    let destroyed: Vec<ConnectionId> = rec
        .events()
        .into_iter()
        .filter(|e| e.reason == Reason::ConnectionDestroyed)
        .map(|e| e.conn)
        .collect();
    assert_eq!(destroyed, vec![parent.id, child.id]);
    assert_eq!(ctx.thread(0).unwrap().occupancy(), 0);
    assert_eq!(ctx.live_connections(), 0);
}

#[test]
fn idle_http_connection_holds_no_parse_context() {
    let rec = Recorder::new();
    let vhost = vhost_with(&rec);
    let config = ServiceConfig {
        parse_contexts_per_thread: 1,
        ..ServiceConfig::with_threads(1, 8)
    };
    let (ctx, mut workers) = context_with(config, &vhost);
    let pool = Arc::clone(ctx.thread(0).unwrap().parse_pool());

    let (idle, _idle_peer) = UnixStream::pair().unwrap();
    let idle = ctx.adopt_socket(&vhost, idle).unwrap().unwrap();
    assert_eq!(pool.available(), 1);

    let (a, mut b) = UnixStream::pair().unwrap();
    b.write_all(b"ping").unwrap();
    ctx.adopt_socket(&vhost, a).unwrap().unwrap();

    let worker = &mut workers[0];
    assert!(pump(worker, |_| rec.received() == b"ping".to_vec()));
    assert!(!worker.connection(idle.id).unwrap().has_parse_context());
    assert_eq!(pool.available(), 1);
}

#[test]
fn starved_connection_stops_polling_until_a_context_frees() {
    let rec = Recorder::new();
    let vhost = vhost_with(&rec);
    let config = ServiceConfig {
        parse_contexts_per_thread: 1,
        ..ServiceConfig::with_threads(1, 8)
    };
    let (ctx, mut workers) = context_with(config, &vhost);
    let thread = Arc::clone(ctx.thread(0).unwrap());
    let held = thread.parse_pool().try_attach().unwrap();

    let (a, mut b) = UnixStream::pair().unwrap();
    let handle = ctx.adopt_socket(&vhost, a).unwrap().unwrap();
    let worker = &mut workers[0];
    worker.drain_handoff();
    let pos = worker.connection(handle.id).unwrap().poll_slot().unwrap();
    let interest = || thread.with_table(|t| t.get(pos).map(|e| e.events));

    b.write_all(b"abcd").unwrap();
    assert_eq!(worker.run_once(20).unwrap(), 1);
    assert_eq!(interest(), Some(0));
    assert_eq!(worker.buffered_len(), 1);

    // Unread input no longer reports the descriptor.
    for _ in 0..10 {
        assert_eq!(worker.run_once(0).unwrap(), 0);
    }
    assert_eq!(rec.count(Reason::Receive), 0);

    drop(held);
    assert!(pump(worker, |_| rec.received() == b"abcd".to_vec()));
    assert_eq!(interest(), Some(POLLIN));
    assert_eq!(worker.buffered_len(), 0);
}

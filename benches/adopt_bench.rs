//! Benchmark: adopt → handoff → close for socket pairs, no poll wait.

use std::hint::black_box;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use adoptd::{
    Connection, Context, Disposition, Protocol, Reason, ServiceConfig, VirtualHost,
};

const BATCH: usize = 256;
const TARGET_DURATION: Duration = Duration::from_secs(2);

fn noop(_: &mut Connection, _: Reason, _: &[u8]) -> Disposition {
    Disposition::Continue
}

fn main() {
    let vhost = VirtualHost::builder("bench")
        .protocol(Protocol::new("noop", noop))
        .build()
        .expect("vhost");
    let (ctx, mut workers) = Context::builder(ServiceConfig::with_threads(1, 4096))
        .vhost(vhost.clone())
        .build()
        .expect("context");
    let worker = &mut workers[0];

    let mut run_batch = |readahead: bool| {
        let mut handles = Vec::with_capacity(BATCH);
        let mut peers = Vec::with_capacity(BATCH);
        for _ in 0..BATCH {
            let (a, b) = UnixStream::pair().expect("socketpair");
            let handle = if readahead {
                ctx.adopt_with_prebuffered(&vhost, a, b"GET / HTTP/1.1\r\n".to_vec())
            } else {
                ctx.adopt_socket(&vhost, a)
            };
            if let Ok(Some(handle)) = black_box(handle) {
                handles.push(handle);
            }
            peers.push(b);
        }
        worker.drain_handoff();
        for handle in handles {
            worker.close(handle.id);
        }
    };

    // Warm up
    for _ in 0..20 {
        run_batch(false);
    }

    for readahead in [false, true] {
        let start = Instant::now();
        let mut iterations: u64 = 0;
        while start.elapsed() < TARGET_DURATION {
            run_batch(readahead);
            iterations += 1;
        }
        let elapsed = start.elapsed();
        let total = iterations * BATCH as u64;
        eprintln!(
            "adopt (readahead: {}): {} adoptions in {:?}",
            readahead, total, elapsed
        );
        eprintln!(
            "  {:.0} adopt/s  {:.2} us/adopt",
            total as f64 / elapsed.as_secs_f64(),
            elapsed.as_secs_f64() * 1_000_000.0 / total as f64
        );
    }

    assert_eq!(ctx.live_connections(), 0);
}

#[cfg(feature = "metrics")]
mod imp {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use tracing::info;

    // Lifecycle (cumulative counts)
    static CONNECTIONS_CREATED: AtomicU64 = AtomicU64::new(0);
    static ADOPTIONS: AtomicU64 = AtomicU64::new(0);
    static HANDOFFS: AtomicU64 = AtomicU64::new(0);
    static ROLLBACKS: AtomicU64 = AtomicU64::new(0);
    static TEARDOWNS: AtomicU64 = AtomicU64::new(0);
    // Admission
    static PEER_LIMIT_DENIED: AtomicU64 = AtomicU64::new(0);
    static NO_CAPACITY: AtomicU64 = AtomicU64::new(0);
    // Readahead
    static REPLAYED_BYTES: AtomicU64 = AtomicU64::new(0);
    static DEFERRED_REPLAYS: AtomicU64 = AtomicU64::new(0);

    #[derive(Clone, Copy)]
    pub struct MetricsSnapshot {
        pub connections_created: u64,
        pub adoptions: u64,
        pub handoffs: u64,
        pub rollbacks: u64,
        pub teardowns: u64,
        pub peer_limit_denied: u64,
        pub no_capacity: u64,
        pub replayed_bytes: u64,
        pub deferred_replays: u64,
    }

    pub fn inc_connections_created() {
        CONNECTIONS_CREATED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_adoptions() {
        ADOPTIONS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_handoffs() {
        HANDOFFS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rollbacks() {
        ROLLBACKS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_teardowns() {
        TEARDOWNS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_peer_limit_denied() {
        PEER_LIMIT_DENIED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_no_capacity() {
        NO_CAPACITY.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_replayed_bytes(n: usize) {
        REPLAYED_BYTES.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn inc_deferred_replays() {
        DEFERRED_REPLAYS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            connections_created: CONNECTIONS_CREATED.load(Ordering::Relaxed),
            adoptions: ADOPTIONS.load(Ordering::Relaxed),
            handoffs: HANDOFFS.load(Ordering::Relaxed),
            rollbacks: ROLLBACKS.load(Ordering::Relaxed),
            teardowns: TEARDOWNS.load(Ordering::Relaxed),
            peer_limit_denied: PEER_LIMIT_DENIED.load(Ordering::Relaxed),
            no_capacity: NO_CAPACITY.load(Ordering::Relaxed),
            replayed_bytes: REPLAYED_BYTES.load(Ordering::Relaxed),
            deferred_replays: DEFERRED_REPLAYS.load(Ordering::Relaxed),
        }
    }

    pub fn spawn_reporter() {
        const INTERVAL_SECS: u64 = 10;
        std::thread::spawn(|| {
            let mut last = snapshot();
            loop {
                std::thread::sleep(Duration::from_secs(INTERVAL_SECS));
                let snap = snapshot();
                info!(
                    interval_secs = INTERVAL_SECS,
                    created = snap.connections_created.saturating_sub(last.connections_created),
                    adopted = snap.adoptions.saturating_sub(last.adoptions),
                    handoffs = snap.handoffs.saturating_sub(last.handoffs),
                    rollbacks = snap.rollbacks.saturating_sub(last.rollbacks),
                    teardowns = snap.teardowns.saturating_sub(last.teardowns),
                    peer_denied = snap.peer_limit_denied.saturating_sub(last.peer_limit_denied),
                    no_capacity = snap.no_capacity.saturating_sub(last.no_capacity),
                    replayed_bytes = snap.replayed_bytes.saturating_sub(last.replayed_bytes),
                    deferred = snap.deferred_replays.saturating_sub(last.deferred_replays),
                    "metrics delta"
                );
                last = snap;
            }
        });
    }
}

#[cfg(not(feature = "metrics"))]
#[allow(dead_code)]
mod imp {
    #[derive(Clone, Copy)]
    pub struct MetricsSnapshot {
        pub connections_created: u64,
        pub adoptions: u64,
        pub handoffs: u64,
        pub rollbacks: u64,
        pub teardowns: u64,
        pub peer_limit_denied: u64,
        pub no_capacity: u64,
        pub replayed_bytes: u64,
        pub deferred_replays: u64,
    }

    pub fn inc_connections_created() {}
    pub fn inc_adoptions() {}
    pub fn inc_handoffs() {}
    pub fn inc_rollbacks() {}
    pub fn inc_teardowns() {}
    pub fn inc_peer_limit_denied() {}
    pub fn inc_no_capacity() {}
    pub fn add_replayed_bytes(_: usize) {}
    pub fn inc_deferred_replays() {}
    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            connections_created: 0,
            adoptions: 0,
            handoffs: 0,
            rollbacks: 0,
            teardowns: 0,
            peer_limit_denied: 0,
            no_capacity: 0,
            replayed_bytes: 0,
            deferred_replays: 0,
        }
    }
    pub fn spawn_reporter() {}
}

pub use imp::*;

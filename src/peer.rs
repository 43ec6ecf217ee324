//! Per-peer admission control.
//!
//! Counts live connections per remote address. Admission checks the ceiling and
//! reserves a slot under one lock acquisition, so concurrent adopters from the same
//! address cannot both slip under the limit.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Default)]
pub struct PeerTable {
    limit: Option<u32>,
    peers: Mutex<HashMap<IpAddr, u32>>,
}

/// Admission refused: `addr` already holds `limit` connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerLimitExceeded {
    pub addr: IpAddr,
    pub limit: u32,
}

impl PeerTable {
    pub fn new(limit: Option<u32>) -> Arc<Self> {
        Arc::new(Self {
            limit,
            peers: Mutex::new(HashMap::new()),
        })
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn admit(self: &Arc<Self>, addr: IpAddr) -> Result<PeerTicket, PeerLimitExceeded> {
        let addr = normalize(addr);
        let mut peers = self.peers.lock();
        let count = peers.entry(addr).or_insert(0);
        if let Some(limit) = self.limit
            && *count >= limit
        {
            if *count == 0 {
                peers.remove(&addr);
            }
            return Err(PeerLimitExceeded { addr, limit });
        }
        *count += 1;
        Ok(PeerTicket {
            table: Arc::clone(self),
            addr,
        })
    }

    pub fn count(&self, addr: IpAddr) -> u32 {
        self.peers
            .lock()
            .get(&normalize(addr))
            .copied()
            .unwrap_or(0)
    }

    /// Number of distinct addresses with at least one live connection.
    pub fn peers(&self) -> usize {
        self.peers.lock().len()
    }

    fn release(&self, addr: IpAddr) {
        let mut peers = self.peers.lock();
        if let Some(count) = peers.get_mut(&addr) {
            *count -= 1;
            if *count == 0 {
                peers.remove(&addr);
            }
        }
    }
}

/// One counted connection from a peer; dropping it gives the slot back.
#[derive(Debug)]
pub struct PeerTicket {
    table: Arc<PeerTable>,
    addr: IpAddr,
}

impl PeerTicket {
    pub fn addr(&self) -> IpAddr {
        self.addr
    }
}

impl Drop for PeerTicket {
    fn drop(&mut self) {
        self.table.release(self.addr);
    }
}

impl std::fmt::Debug for PeerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerTable")
            .field("limit", &self.limit)
            .field("peers", &self.peers())
            .finish()
    }
}

/// Port is not part of the key; IPv4-mapped IPv6 counts as the IPv4 address.
fn normalize(addr: IpAddr) -> IpAddr {
    addr.to_canonical()
}

//! per-tick statistics
//!
//! the reactor produces one [`Snapshot`] per second; rendering it is the
//! embedder's business (the daemon prints a status screen). Closed
//! connections and closed peers keep appearing with their final
//! counters.

use crate::{ConnectionId, PeerState, PerSide, Side};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub connections: Vec<ConnectionStats>,
    /// accepted mirror sockets still waiting to identify themselves
    pub handshaking: usize,
}

#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub cid: ConnectionId,
    pub open: bool,
    /// novel bytes accepted from each side
    pub received: PerSide<u64>,
    pub peers: Vec<PeerStats>,
}

#[derive(Debug, Clone)]
pub struct PeerStats {
    pub side: Side,
    pub remote: String,
    pub state: PeerState,
    /// bytes physically received on this socket, duplicates included
    pub bytes_received: u64,
    /// novel bytes this peer was the first to deliver
    pub was_source_for: u64,
    /// output backlog in bytes
    pub buffered: usize,
    /// time since this peer last contributed novel bytes
    pub idle: Option<Duration>,
}

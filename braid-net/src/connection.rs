use crate::{ConnectionId, PerSide, Side};

/// a logical mirrored stream
///
/// one socket on one side, several redundant sockets on the other; the
/// per-side counters are the watermarks that make the redundancy safe:
/// `bytes_received[side]` is the number of novel bytes accepted from
/// that side so far, which is also the logical offset the next novel
/// byte must land on.
pub(crate) struct Connection {
    pub(crate) cid: ConnectionId,
    /// tokens into the reactor's peer slab, per side
    pub(crate) peers: PerSide<Vec<usize>>,
    pub(crate) bytes_received: PerSide<u64>,
    pub(crate) open: bool,
}

impl Connection {
    pub(crate) fn new(cid: ConnectionId) -> Self {
        Self {
            cid,
            peers: PerSide::default(),
            bytes_received: PerSide::default(),
            open: true,
        }
    }

    pub(crate) fn attach(&mut self, side: Side, token: usize) {
        self.peers[side].push(token);
    }
}

/// how much of a freshly received chunk lies beyond the watermark
///
/// several peers on one side carry the same stream, so a chunk may be
/// anything from entirely stale to entirely novel. Bytes on one TCP
/// socket arrive in order, which is why the novel part is always the
/// trailing slice: the first `watermark - received` bytes of the chunk
/// were already claimed by a faster sibling.
pub(crate) fn novel_len(watermark: u64, received: u64, chunk: usize) -> usize {
    let lag = watermark.saturating_sub(received);
    (chunk as u64).saturating_sub(lag) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_the_watermark_everything_is_novel() {
        assert_eq!(novel_len(500, 500, 100), 100);
        assert_eq!(novel_len(0, 0, 11), 11);
    }

    #[test]
    fn fully_stale_chunk_contributes_nothing() {
        assert_eq!(novel_len(800, 0, 500), 0);
        assert_eq!(novel_len(800, 300, 500), 0);
    }

    #[test]
    fn straddling_chunk_contributes_the_tail() {
        // sibling already pushed the watermark to 500, this peer has
        // seen nothing and now delivers 800 bytes: the last 300 count
        assert_eq!(novel_len(500, 0, 800), 300);
    }

    #[test]
    fn empty_chunk() {
        assert_eq!(novel_len(500, 400, 0), 0);
    }
}

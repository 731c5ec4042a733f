/*!
# braid stream mirroring engine

braid transports a single TCP conversation over several redundant
physical paths at once. Every byte of the stream travels on every path;
the receiving side deduplicates by absolute byte offset, so whichever
path delivers a byte first wins and slower duplicates are discarded
silently. The result is a link with the combined reliability, and at
best the lowest latency, of the whole set of paths.

Two processes cooperate:

1. the **left** side accepts the client socket and fans the stream out
   over one outbound socket per configured [`Endpoint`];
2. the **right** side accepts those sockets, collapses them back onto a
   single stream, and carries it to the real server.

A short fixed-width prelude binds the physical sockets of one logical
connection together (a 4-byte [`ConnectionId`]) and lets both ends
advertise how many bytes they have already received, which is what makes
a dropped path resumable without duplicating or losing data.

The whole engine is a single-threaded, non-blocking [`Reactor`]: no
locks, no tasks, one readiness wait.
*/

mod connection;
mod connection_id;
mod endpoint;
mod peer;
mod reactor;
mod side;
pub mod stats;
pub mod wire;

pub use self::{
    connection_id::ConnectionId,
    endpoint::Endpoint,
    peer::PeerState,
    reactor::Reactor,
    side::{PerSide, Side},
    stats::Snapshot,
};

use crate::{ConnectionId, Endpoint, Side};
use bytes::{Buf as _, BytesMut};
use mio::{net::TcpStream, Interest};
use std::{
    fmt::{self, Formatter},
    io::{self, Read as _, Write as _},
    net::{Shutdown, SocketAddr},
    time::Instant,
};

/// most bytes moved by a single read or write call
pub(crate) const CHUNK_SIZE: usize = 65536;

/// output high-water mark; once a peer buffers this much, reads from the
/// originating side are paused until the backlog drains
pub(crate) const MAX_BUFFERED: usize = 4 * 1024 * 1024;

/// where a peer is in its life cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// outbound socket waiting for the non-blocking connect to complete
    Connecting,
    /// inbound mirror socket reading the 4-byte connection id
    PreludeCid,
    /// reading the 8-byte offset advertisement
    PreludeOffset,
    /// carrying the mirrored stream
    Established,
    /// socket gone; counters retained for the status screen
    Closed,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::Connecting => f.write_str("connecting"),
            PeerState::PreludeCid | PeerState::PreludeOffset => f.write_str("handshake"),
            PeerState::Established => f.write_str("established"),
            PeerState::Closed => f.write_str("closed"),
        }
    }
}

/// how a peer's socket came to be
#[derive(Debug, Clone)]
pub(crate) enum Remote {
    /// accepted by the listener from this address
    Accepted(SocketAddr),
    /// dialed along a configured path; kept so the reactor can redial
    Endpoint(Endpoint),
}

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Remote::Accepted(addr) => addr.fmt(f),
            Remote::Endpoint(endpoint) => endpoint.fmt(f),
        }
    }
}

/// one physical socket belonging to a mirrored connection
pub(crate) struct Peer {
    stream: Option<TcpStream>,
    pub(crate) side: Side,
    pub(crate) remote: Remote,
    pub(crate) connector: bool,
    pub(crate) state: PeerState,
    pub(crate) connection: Option<ConnectionId>,
    /// bytes physically received on this socket, duplicates included
    pub(crate) bytes_received: u64,
    /// prelude bytes staged while the handshake is incomplete
    pub(crate) input_buffer: Vec<u8>,
    output_buffer: BytesMut,
    /// when this peer last contributed novel bytes
    pub(crate) was_leader_at: Option<Instant>,
    /// total novel bytes this peer contributed
    pub(crate) was_source_for: u64,
    /// interest currently registered with the poll, `None` when the
    /// socket is not registered
    pub(crate) interest: Option<Interest>,
}

impl Peer {
    pub(crate) fn accepted(stream: TcpStream, addr: SocketAddr, side: Side, state: PeerState) -> Self {
        Self {
            stream: Some(stream),
            side,
            remote: Remote::Accepted(addr),
            connector: false,
            state,
            connection: None,
            bytes_received: 0,
            input_buffer: Vec::new(),
            output_buffer: BytesMut::new(),
            was_leader_at: None,
            was_source_for: 0,
            interest: None,
        }
    }

    pub(crate) fn outbound(
        stream: TcpStream,
        endpoint: Endpoint,
        side: Side,
        connection: ConnectionId,
    ) -> Self {
        Self {
            stream: Some(stream),
            side,
            remote: Remote::Endpoint(endpoint),
            connector: true,
            state: PeerState::Connecting,
            connection: Some(connection),
            bytes_received: 0,
            input_buffer: Vec::new(),
            output_buffer: BytesMut::new(),
            was_leader_at: None,
            was_source_for: 0,
            interest: None,
        }
    }

    pub(crate) fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }

    /// still holding a socket, in whatever state
    pub(crate) fn is_live(&self) -> bool {
        self.stream.is_some()
    }

    pub(crate) fn is_saturated(&self) -> bool {
        self.output_buffer.len() >= MAX_BUFFERED
    }

    pub(crate) fn buffered(&self) -> usize {
        self.output_buffer.len()
    }

    /// append bytes for this socket to carry
    pub(crate) fn queue(&mut self, bytes: &[u8]) {
        self.output_buffer.extend_from_slice(bytes);
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.as_mut() {
            Some(stream) => stream.read(buf),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// write as much of the pending output as the socket accepts
    ///
    /// partial writes are normal; leftovers stay queued and the reactor
    /// keeps write interest until the buffer is empty.
    pub(crate) fn flush(&mut self) -> io::Result<()> {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Ok(()),
        };
        while !self.output_buffer.is_empty() {
            let chunk = self.output_buffer.len().min(CHUNK_SIZE);
            match stream.write(&self.output_buffer[..chunk]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(sent) => self.output_buffer.advance(sent),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }

    /// check the outcome of a non-blocking connect once the socket
    /// reports writable; `Ok(false)` means the handshake is still going
    pub(crate) fn connected(&mut self) -> io::Result<bool> {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Err(io::ErrorKind::NotConnected.into()),
        };
        if let Some(error) = stream.take_error()? {
            return Err(error);
        }
        match stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(error) if error.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// drop the socket and every pending buffer, keeping the counters
    pub(crate) fn close(&mut self, registry: &mio::Registry) {
        if let Some(mut stream) = self.stream.take() {
            if self.interest.is_some() {
                let _ = registry.deregister(&mut stream);
            }
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.interest = None;
        self.state = PeerState::Closed;
        self.input_buffer.clear();
        self.output_buffer.clear();
    }

    /// which readiness the reactor should ask for right now
    ///
    /// pre-handshake peers are polled for reads only, connectors await
    /// writability, established peers read unless `paused` by
    /// backpressure and write while output is pending.
    pub(crate) fn desired_interest(&self, paused: bool) -> Option<Interest> {
        match self.state {
            PeerState::Closed => None,
            PeerState::Connecting => Some(Interest::WRITABLE),
            PeerState::PreludeCid => Some(Interest::READABLE),
            PeerState::PreludeOffset => {
                if self.output_buffer.is_empty() {
                    Some(Interest::READABLE)
                } else {
                    Some(Interest::READABLE | Interest::WRITABLE)
                }
            }
            PeerState::Established => {
                let read = !paused;
                let write = !self.output_buffer.is_empty();
                match (read, write) {
                    (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
                    (true, false) => Some(Interest::READABLE),
                    (false, true) => Some(Interest::WRITABLE),
                    (false, false) => None,
                }
            }
        }
    }
}

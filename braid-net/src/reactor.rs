//! the single-threaded event loop
//!
//! every socket of every mirrored connection is owned here: the reactor
//! polls the listener, the pre-handshake sockets and the peers of every
//! open connection, dispatches readiness to per-peer handlers, and keeps
//! the per-connection accounting that makes the redundancy safe. A
//! handler failure never escapes its peer: the socket is closed and, for
//! outbound mirror paths, a replacement is dialed on the next tick.

use crate::{
    connection::{novel_len, Connection},
    peer::{Peer, PeerState, Remote, CHUNK_SIZE},
    stats::{ConnectionStats, PeerStats, Snapshot},
    wire::{self, Prelude},
    ConnectionId, Endpoint, Side,
};
use anyhow::{anyhow, bail, Context as _, Result};
use mio::{
    net::{TcpListener, TcpStream},
    Events, Interest, Poll, Token,
};
use rand::rngs::OsRng;
use slab::Slab;
use std::{
    collections::{HashMap, HashSet},
    convert::TryFrom as _,
    io,
    net::SocketAddr,
    time::{Duration, Instant},
};

const LISTENER: Token = Token(0);

/// cadence of the statistics snapshot, which doubles as the latency of
/// the reconnect check
const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// the stream mirroring engine
///
/// one reactor runs per process. The [`Side`] given at construction
/// decides what the listener accepts: on the left a client socket spawns
/// a new mirrored connection and one outbound path per configured
/// [`Endpoint`]; on the right an accepted socket identifies itself with
/// a connection id and is grafted onto the matching connection, dialing
/// the server-facing socket when the id is new.
pub struct Reactor {
    side: Side,
    endpoints: Vec<Endpoint>,
    listener: TcpListener,
    poll: Poll,
    events: Events,
    /// every peer ever created; closed peers stay for the statistics
    peers: Slab<Peer>,
    connections: HashMap<ConnectionId, Connection>,
    /// accepted mirror sockets that have not identified themselves yet
    new_peers: Vec<usize>,
    /// paths to redial on the next tick
    reconnects: Vec<(ConnectionId, Endpoint)>,
    next_stats_at: Instant,
}

impl Reactor {
    pub fn new(side: Side, listen: SocketAddr, endpoints: Vec<Endpoint>) -> Result<Self> {
        let poll = Poll::new().context("cannot create the readiness poll")?;
        let mut listener = TcpListener::bind(listen)
            .with_context(|| format!("cannot listen on {}", listen))?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .context("cannot register the listener")?;

        let local = listener
            .local_addr()
            .context("listener has no local address")?;
        tracing::info!(
            %side,
            listen = %local,
            paths = endpoints.len(),
            "mirroring reactor ready"
        );

        Ok(Self {
            side,
            endpoints,
            listener,
            poll,
            events: Events::with_capacity(1024),
            peers: Slab::new(),
            connections: HashMap::new(),
            new_peers: Vec::new(),
            reconnects: Vec::new(),
            next_stats_at: Instant::now(),
        })
    }

    /// the address the listener actually bound, useful when the
    /// configured port was 0
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// run forever, handing one [`Snapshot`] per second to `on_tick`
    pub fn run(&mut self, mut on_tick: impl FnMut(&Snapshot)) -> Result<()> {
        loop {
            if let Some(snapshot) = self.step(STATS_INTERVAL)? {
                on_tick(&snapshot);
            }
        }
    }

    /// one reactor iteration: tick bookkeeping, readiness wait (bounded
    /// by `timeout`), handler dispatch
    pub fn step(&mut self, timeout: Duration) -> Result<Option<Snapshot>> {
        let now = Instant::now();
        let snapshot = if now >= self.next_stats_at {
            self.next_stats_at = now + STATS_INTERVAL;
            self.reconnect_pending();
            Some(self.snapshot())
        } else {
            None
        };

        self.refresh_interests();

        let wait = self
            .next_stats_at
            .saturating_duration_since(Instant::now())
            .min(timeout);
        if let Err(error) = self.poll.poll(&mut self.events, Some(wait)) {
            if error.kind() == io::ErrorKind::Interrupted {
                return Ok(snapshot);
            }
            return Err(error).context("waiting for readiness");
        }

        // error and hang-up conditions surface through the regular
        // handlers, which observe them on the next read or write
        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|event| {
                (
                    event.token(),
                    event.is_readable() || event.is_error() || event.is_read_closed(),
                    event.is_writable() || event.is_error() || event.is_write_closed(),
                )
            })
            .collect();

        for (token, readable, writable) in ready {
            if token == LISTENER {
                if readable {
                    self.on_accept();
                }
                continue;
            }
            let key = token.0 - 1;
            if writable {
                if let Err(error) = self.peer_writable(key) {
                    self.fail_peer(key, &error);
                }
            }
            if readable {
                if let Err(error) = self.peer_readable(key) {
                    self.fail_peer(key, &error);
                }
            }
        }

        Ok(snapshot)
    }

    /// current per-connection and per-peer counters
    pub fn snapshot(&self) -> Snapshot {
        let mut connections: Vec<ConnectionStats> = self
            .connections
            .values()
            .map(|conn| {
                let peers = Side::BOTH
                    .iter()
                    .flat_map(|&side| conn.peers[side].iter().copied())
                    .filter_map(|token| self.peers.get(token))
                    .map(|peer| PeerStats {
                        side: peer.side,
                        remote: peer.remote.to_string(),
                        state: peer.state,
                        bytes_received: peer.bytes_received,
                        was_source_for: peer.was_source_for,
                        buffered: peer.buffered(),
                        idle: peer.was_leader_at.map(|at| at.elapsed()),
                    })
                    .collect();
                ConnectionStats {
                    cid: conn.cid,
                    open: conn.open,
                    received: conn.bytes_received,
                    peers,
                }
            })
            .collect();
        connections.sort_by_key(|conn| conn.cid);

        let handshaking = self
            .new_peers
            .iter()
            .filter(|&&token| self.peers.get(token).map(Peer::is_live).unwrap_or(false))
            .count();

        Snapshot {
            connections,
            handshaking,
        }
    }

    fn reconnect_pending(&mut self) {
        if self.reconnects.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.reconnects);
        for (cid, endpoint) in pending {
            let open = self
                .connections
                .get(&cid)
                .map(|conn| conn.open)
                .unwrap_or(false);
            if !open {
                continue;
            }
            tracing::info!(cid = %cid, endpoint = %endpoint, "reopening path");
            self.spawn_outbound(cid, endpoint);
        }
    }

    /// bring every registration in line with what each peer wants
    ///
    /// this is where backpressure lives: a side whose opposite peers are
    /// all gone, or have a saturated output buffer, loses read interest
    /// until the situation clears.
    fn refresh_interests(&mut self) {
        let mut paused: HashSet<usize> = HashSet::new();
        for conn in self.connections.values() {
            if !conn.open {
                continue;
            }
            for &side in Side::BOTH.iter() {
                let mut live = 0;
                let mut saturated = false;
                for &token in &conn.peers[side.other()] {
                    if let Some(peer) = self.peers.get(token) {
                        if peer.is_live() {
                            live += 1;
                            if peer.is_saturated() {
                                saturated = true;
                            }
                        }
                    }
                }
                if live == 0 || saturated {
                    paused.extend(conn.peers[side].iter().copied());
                }
            }
        }

        let registry = self.poll.registry();
        for (token, peer) in self.peers.iter_mut() {
            let desired = peer.desired_interest(paused.contains(&token));
            let current = peer.interest;
            if desired == current {
                continue;
            }
            let stream = match peer.stream_mut() {
                Some(stream) => stream,
                None => continue,
            };
            let result = match (desired, current) {
                (Some(interest), Some(_)) => {
                    registry.reregister(stream, Token(token + 1), interest)
                }
                (Some(interest), None) => registry.register(stream, Token(token + 1), interest),
                (None, Some(_)) => registry.deregister(stream),
                (None, None) => Ok(()),
            };
            match result {
                Ok(()) => peer.interest = desired,
                Err(error) => {
                    tracing::warn!(reason = %error, "cannot update a poll registration")
                }
            }
        }
    }

    fn on_accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if self.side == Side::Left {
                        self.accept_client(stream, addr);
                    } else {
                        self.accept_mirror(stream, addr);
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    tracing::error!(reason = %error, "accept failed");
                    break;
                }
            }
        }
    }

    /// a client showed up: new connection, one mirror path per endpoint
    fn accept_client(&mut self, stream: TcpStream, addr: SocketAddr) {
        let mut cid = ConnectionId::generate(&mut OsRng);
        while self.connections.contains_key(&cid) {
            cid = ConnectionId::generate(&mut OsRng);
        }
        tracing::info!(
            cid = %cid,
            client = %addr,
            paths = self.endpoints.len(),
            "accepted client connection"
        );

        let mut peer = Peer::accepted(stream, addr, Side::Left, PeerState::Established);
        peer.connection = Some(cid);
        let token = self.peers.insert(peer);

        let mut conn = Connection::new(cid);
        conn.attach(Side::Left, token);
        self.connections.insert(cid, conn);

        for endpoint in self.endpoints.clone() {
            self.spawn_outbound(cid, endpoint);
        }
    }

    /// the far process opened a path; it has yet to say which connection
    /// it belongs to
    fn accept_mirror(&mut self, stream: TcpStream, addr: SocketAddr) {
        tracing::debug!(remote = %addr, "accepted mirror socket, awaiting connection id");
        let peer = Peer::accepted(stream, addr, self.side, PeerState::PreludeCid);
        let token = self.peers.insert(peer);
        self.new_peers.push(token);
    }

    fn spawn_outbound(&mut self, cid: ConnectionId, endpoint: Endpoint) {
        if let Err(error) = self.try_spawn_outbound(cid, endpoint.clone()) {
            tracing::warn!(
                cid = %cid,
                endpoint = %endpoint,
                reason = %error,
                "cannot open path, will retry"
            );
            self.reconnects.push((cid, endpoint));
        }
    }

    fn try_spawn_outbound(&mut self, cid: ConnectionId, endpoint: Endpoint) -> Result<()> {
        let side = self.side.other();
        let advertise = self
            .connections
            .get(&cid)
            .map(|conn| conn.bytes_received[side.other()])
            .ok_or_else(|| anyhow!("unknown connection {}", cid))?;

        let stream = endpoint.dial().with_context(|| format!("dialing {}", endpoint))?;
        let mut peer = Peer::outbound(stream, endpoint, side, cid);
        if side == Side::Right {
            // mirror path: identify the connection and advertise how far
            // the stream headed our way has progressed
            peer.queue(
                &Prelude {
                    cid,
                    offset: advertise,
                }
                .to_bytes(),
            );
        }
        let token = self.peers.insert(peer);
        if let Some(conn) = self.connections.get_mut(&cid) {
            conn.attach(side, token);
        }
        Ok(())
    }

    fn peer_writable(&mut self, token: usize) -> Result<()> {
        let state = match self.peers.get(token) {
            Some(peer) => peer.state,
            None => return Ok(()),
        };
        if state == PeerState::Closed {
            return Ok(());
        }
        if state == PeerState::Connecting {
            let peer = match self.peers.get_mut(token) {
                Some(peer) => peer,
                None => return Ok(()),
            };
            match peer.connected() {
                Ok(true) => {
                    // a mirror path now flushes its prelude and waits
                    // for the return advertisement; the server-facing
                    // socket has nothing to exchange
                    peer.state = if peer.side == Side::Right {
                        PeerState::PreludeOffset
                    } else {
                        PeerState::Established
                    };
                    tracing::debug!(remote = %peer.remote, "outbound path connected");
                }
                Ok(false) => return Ok(()),
                Err(error) => return Err(error).context("connect failed"),
            }
        }
        if let Some(peer) = self.peers.get_mut(token) {
            peer.flush().context("flushing pending output")?;
        }
        Ok(())
    }

    fn peer_readable(&mut self, token: usize) -> Result<()> {
        // notifications are edge-style: keep reading until the socket
        // has nothing left or the peer stops being readable
        loop {
            let state = match self.peers.get(token) {
                Some(peer) => peer.state,
                None => return Ok(()),
            };
            let progressed = match state {
                PeerState::Connecting | PeerState::Closed => return Ok(()),
                PeerState::PreludeCid => self.read_prelude_cid(token)?,
                PeerState::PreludeOffset => self.read_prelude_offset(token)?,
                PeerState::Established => self.read_established(token)?,
            };
            if !progressed {
                return Ok(());
            }
        }
    }

    /// first handshake phase of an accepted mirror socket
    fn read_prelude_cid(&mut self, token: usize) -> Result<bool> {
        let mut buf = [0; ConnectionId::SIZE];
        let cid = {
            let peer = match self.peers.get_mut(token) {
                Some(peer) => peer,
                None => return Ok(false),
            };
            let need = ConnectionId::SIZE - peer.input_buffer.len();
            let read = match peer.read(&mut buf[..need]) {
                Ok(read) => read,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => return Ok(true),
                Err(error) => return Err(error).context("reading the connection id"),
            };
            if read == 0 {
                bail!("closed before sending a connection id");
            }
            peer.input_buffer.extend_from_slice(&buf[..read]);
            if peer.input_buffer.len() < ConnectionId::SIZE {
                return Ok(true);
            }
            let cid = ConnectionId::try_from(peer.input_buffer.as_slice())
                .context("malformed connection id")?;
            peer.input_buffer.clear();
            cid
        };
        self.attach_inbound(token, cid)?;
        Ok(true)
    }

    /// the cid is in: join (or create) the connection and answer with
    /// our own offset advertisement
    fn attach_inbound(&mut self, token: usize, cid: ConnectionId) -> Result<()> {
        match self.connections.get(&cid).map(|conn| conn.open) {
            Some(true) => {}
            Some(false) => bail!("connection {} is already closed", cid),
            None => {
                tracing::info!(cid = %cid, "new mirrored connection from the far side");
                self.connections.insert(cid, Connection::new(cid));
                for endpoint in self.endpoints.clone() {
                    self.spawn_outbound(cid, endpoint);
                }
            }
        }

        let side = match self.peers.get(token) {
            Some(peer) => peer.side,
            None => return Ok(()),
        };
        let advertise = self
            .connections
            .get_mut(&cid)
            .map(|conn| {
                conn.attach(side, token);
                conn.bytes_received[side.other()]
            })
            .ok_or_else(|| anyhow!("connection {} vanished during attach", cid))?;

        self.new_peers.retain(|&t| t != token);
        if let Some(peer) = self.peers.get_mut(token) {
            peer.connection = Some(cid);
            peer.state = PeerState::PreludeOffset;
            peer.queue(&wire::encode_offset(advertise));
            tracing::debug!(
                cid = %cid,
                remote = %peer.remote,
                advertised = advertise,
                "mirror socket joined"
            );
        }
        Ok(())
    }

    /// second handshake phase, shared by acceptors and connectors: read
    /// the far side's 8-byte offset advertisement
    fn read_prelude_offset(&mut self, token: usize) -> Result<bool> {
        let mut buf = [0; wire::OFFSET_SIZE];
        let (cid, side, offset) = {
            let peer = match self.peers.get_mut(token) {
                Some(peer) => peer,
                None => return Ok(false),
            };
            let need = wire::OFFSET_SIZE - peer.input_buffer.len();
            let read = match peer.read(&mut buf[..need]) {
                Ok(read) => read,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => return Ok(true),
                Err(error) => return Err(error).context("reading the offset advertisement"),
            };
            if read == 0 {
                bail!("closed during the offset exchange");
            }
            peer.input_buffer.extend_from_slice(&buf[..read]);
            if peer.input_buffer.len() < wire::OFFSET_SIZE {
                return Ok(true);
            }
            let mut bytes = [0; wire::OFFSET_SIZE];
            bytes.copy_from_slice(&peer.input_buffer);
            peer.input_buffer.clear();
            let cid = peer
                .connection
                .ok_or_else(|| anyhow!("offset exchange without a connection"))?;
            (cid, peer.side, wire::decode_offset(bytes))
        };

        let watermark = self
            .connections
            .get(&cid)
            .map(|conn| conn.bytes_received[side])
            .ok_or_else(|| anyhow!("connection {} vanished during handshake", cid))?;
        if offset > watermark {
            // the far side claims a resume point we have not reached:
            // siblings have not caught up yet, or the stream is corrupt
            bail!(
                "advertised offset {} is ahead of the local watermark {}",
                offset,
                watermark
            );
        }

        if let Some(peer) = self.peers.get_mut(token) {
            peer.bytes_received = offset;
            peer.state = PeerState::Established;
            tracing::debug!(cid = %cid, remote = %peer.remote, offset, "path established");
        }
        Ok(true)
    }

    /// steady state: deduplicate against the watermark and fan the novel
    /// suffix out to every peer on the other side
    fn read_established(&mut self, token: usize) -> Result<bool> {
        let (side, cid) = match self.peers.get(token) {
            Some(peer) => match peer.connection {
                Some(cid) => (peer.side, cid),
                None => bail!("established peer without a connection"),
            },
            None => return Ok(false),
        };

        // nothing may be consumed that cannot be mirrored out right now;
        // the bytes stay in the kernel buffer until a sink is available
        if !self.fanout_ready(cid, side) {
            return Ok(false);
        }

        let mut buf = [0; CHUNK_SIZE];
        let read = {
            let peer = match self.peers.get_mut(token) {
                Some(peer) => peer,
                None => return Ok(false),
            };
            match peer.read(&mut buf) {
                Ok(read) => read,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => return Ok(true),
                Err(error) => return Err(error).context("reading the stream"),
            }
        };
        if read == 0 {
            tracing::info!(cid = %cid, "end of stream");
            self.close_connection(cid);
            return Ok(false);
        }

        let conn = self
            .connections
            .get_mut(&cid)
            .ok_or_else(|| anyhow!("connection {} vanished", cid))?;
        let watermark = conn.bytes_received[side];
        let targets = conn.peers[side.other()].clone();

        let peer = match self.peers.get_mut(token) {
            Some(peer) => peer,
            None => return Ok(false),
        };
        if peer.bytes_received > watermark {
            bail!(
                "peer has received {} bytes, beyond the watermark {}",
                peer.bytes_received,
                watermark
            );
        }
        let novel = novel_len(watermark, peer.bytes_received, read);
        peer.bytes_received += read as u64;
        if novel == 0 {
            return Ok(true);
        }
        peer.was_leader_at = Some(Instant::now());
        peer.was_source_for += novel as u64;
        conn.bytes_received[side] += novel as u64;

        let data = &buf[read - novel..read];
        for target in targets {
            if let Some(sibling) = self.peers.get_mut(target) {
                if sibling.is_live() {
                    sibling.queue(data);
                }
            }
        }
        Ok(true)
    }

    /// true when the other side can absorb novel bytes from `from`
    fn fanout_ready(&self, cid: ConnectionId, from: Side) -> bool {
        let conn = match self.connections.get(&cid) {
            Some(conn) if conn.open => conn,
            _ => return false,
        };
        let mut live = 0;
        for &token in &conn.peers[from.other()] {
            if let Some(peer) = self.peers.get(token) {
                if peer.is_live() {
                    if peer.is_saturated() {
                        return false;
                    }
                    live += 1;
                }
            }
        }
        live > 0
    }

    /// end of the logical stream: close every socket on both sides; the
    /// connection stays registered for the statistics
    fn close_connection(&mut self, cid: ConnectionId) {
        let tokens: Vec<usize> = match self.connections.get_mut(&cid) {
            Some(conn) if conn.open => {
                conn.open = false;
                Side::BOTH
                    .iter()
                    .flat_map(|&side| conn.peers[side].iter().copied())
                    .collect()
            }
            _ => return,
        };
        tracing::info!(cid = %cid, peers = tokens.len(), "closing mirrored connection");
        let registry = self.poll.registry();
        for token in tokens {
            if let Some(peer) = self.peers.get_mut(token) {
                peer.close(registry);
            }
        }
    }

    /// contain a handler failure: close the peer and, when it is an
    /// outbound mirror path, line up a replacement for the next tick
    ///
    /// a peer that cannot be replaced (the client socket, the
    /// server-facing socket) may leave its side of the connection empty;
    /// that ends the logical session, since nothing can originate or
    /// absorb bytes there anymore.
    fn fail_peer(&mut self, token: usize, error: &anyhow::Error) {
        let (reconnect, membership) = match self.peers.get(token) {
            Some(peer) => {
                tracing::warn!(remote = %peer.remote, reason = %error, "closing peer");
                let reconnect = match (&peer.remote, peer.connector, peer.side, peer.connection) {
                    (Remote::Endpoint(endpoint), true, Side::Right, Some(cid)) => {
                        Some((cid, endpoint.clone()))
                    }
                    _ => None,
                };
                (reconnect, peer.connection.map(|cid| (cid, peer.side)))
            }
            None => return,
        };

        let registry = self.poll.registry();
        if let Some(peer) = self.peers.get_mut(token) {
            peer.close(registry);
        }
        self.new_peers.retain(|&t| t != token);

        if let Some((cid, endpoint)) = reconnect {
            let open = self
                .connections
                .get(&cid)
                .map(|conn| conn.open)
                .unwrap_or(false);
            if open {
                tracing::debug!(cid = %cid, endpoint = %endpoint, "replacement path scheduled");
                self.reconnects.push((cid, endpoint));
            }
            return;
        }

        if let Some((cid, side)) = membership {
            let orphaned = self
                .connections
                .get(&cid)
                .map(|conn| {
                    conn.open
                        && !conn.peers[side].iter().any(|&t| {
                            self.peers.get(t).map(Peer::is_live).unwrap_or(false)
                        })
                })
                .unwrap_or(false);
            if orphaned {
                tracing::info!(cid = %cid, %side, "no live peer left on this side");
                self.close_connection(cid);
            }
        }
    }
}

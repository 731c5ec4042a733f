//! end-to-end scenarios: a left and a right reactor, a plain client and
//! a plain server socket, all driven from one thread through
//! `Reactor::step` so every interleaving is deterministic enough to
//! assert on.

use braid_net::{Endpoint, PeerState, Reactor, Side};
use std::{
    io::{self, Read as _, Write as _},
    net::{SocketAddr, TcpListener, TcpStream},
    time::Duration,
};

const STEP: Duration = Duration::from_millis(10);
const SPINS: usize = 1_000;

fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn endpoint_to(port: u16) -> Endpoint {
    Endpoint {
        bind: "127.0.0.1".parse().unwrap(),
        host: "127.0.0.1".into(),
        port,
    }
}

struct Harness {
    left: Reactor,
    right: Reactor,
    server: TcpListener,
    left_addr: SocketAddr,
}

impl Harness {
    /// a full left/right pair with `paths` redundant sockets per
    /// connection, mirroring toward a fresh local server listener
    fn new(paths: usize) -> Self {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        server.set_nonblocking(true).unwrap();
        let server_port = server.local_addr().unwrap().port();

        let right = Reactor::new(Side::Right, localhost(), vec![endpoint_to(server_port)])
            .unwrap();
        let right_port = right.local_addr().unwrap().port();

        let left = Reactor::new(
            Side::Left,
            localhost(),
            vec![endpoint_to(right_port); paths],
        )
        .unwrap();
        let left_addr = left.local_addr().unwrap();

        Self {
            left,
            right,
            server,
            left_addr,
        }
    }

    fn connect_client(&self) -> TcpStream {
        let client = TcpStream::connect(self.left_addr).unwrap();
        client.set_nonblocking(true).unwrap();
        client
    }

    fn spin(&mut self) {
        self.left.step(STEP).unwrap();
        self.right.step(STEP).unwrap();
    }

    fn accept_server(&mut self) -> Option<TcpStream> {
        match self.server.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(true).unwrap();
                Some(stream)
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => None,
            Err(error) => panic!("server accept: {}", error),
        }
    }
}

/// read whatever is pending on a non-blocking socket; true means EOF
fn drain(stream: &mut TcpStream, into: &mut Vec<u8>) -> bool {
    let mut buf = [0; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return true,
            Ok(read) => into.extend_from_slice(&buf[..read]),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => return false,
            Err(error) => panic!("drain: {}", error),
        }
    }
}

#[test]
fn single_path_mirrors_both_directions() {
    let mut harness = Harness::new(1);
    let mut client = harness.connect_client();
    client.write_all(b"HELLO WORLD").unwrap();

    let mut server_conn = None;
    let mut upstream = Vec::new();
    for _ in 0..SPINS {
        harness.spin();
        if server_conn.is_none() {
            server_conn = harness.accept_server();
        }
        if let Some(conn) = server_conn.as_mut() {
            drain(conn, &mut upstream);
        }
        // also wait for the return advertisement to finish the mirror
        // handshake; the payload can legitimately outrun it
        let settled = harness
            .left
            .snapshot()
            .connections
            .get(0)
            .map(|conn| {
                conn.peers
                    .iter()
                    .all(|peer| peer.state == PeerState::Established)
            })
            .unwrap_or(false);
        if upstream.len() >= 11 && settled {
            break;
        }
    }
    assert_eq!(upstream, b"HELLO WORLD");

    let snapshot = harness.left.snapshot();
    assert_eq!(snapshot.connections.len(), 1);
    let conn = &snapshot.connections[0];
    assert!(conn.open);
    assert_eq!(conn.received[Side::Left], 11);
    assert_eq!(conn.received[Side::Right], 0);
    assert!(conn
        .peers
        .iter()
        .all(|peer| peer.state == PeerState::Established));

    // on the right process the mirror sockets live on the right side,
    // so the client-originated stream counts there
    let snapshot = harness.right.snapshot();
    assert_eq!(snapshot.connections.len(), 1);
    assert_eq!(snapshot.connections[0].received[Side::Right], 11);
    assert_eq!(snapshot.connections[0].received[Side::Left], 0);

    // and back: server to client
    let mut server_conn = server_conn.unwrap();
    server_conn.write_all(b"pong").unwrap();
    let mut downstream = Vec::new();
    for _ in 0..SPINS {
        harness.spin();
        drain(&mut client, &mut downstream);
        if downstream.len() >= 4 {
            break;
        }
    }
    assert_eq!(downstream, b"pong");
    assert_eq!(harness.left.snapshot().connections[0].received[Side::Right], 4);
    assert_eq!(harness.right.snapshot().connections[0].received[Side::Left], 4);
}

#[test]
fn redundant_paths_deliver_exactly_once() {
    let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();

    let mut harness = Harness::new(2);
    let mut client = harness.connect_client();
    client.write_all(&payload).unwrap();

    let mut server_conn = None;
    let mut upstream = Vec::new();
    for _ in 0..SPINS {
        harness.spin();
        if server_conn.is_none() {
            server_conn = harness.accept_server();
        }
        if let Some(conn) = server_conn.as_mut() {
            drain(conn, &mut upstream);
        }

        // wait until both mirror sockets have physically received the
        // whole stream, not just until the server saw it once
        let snapshot = harness.right.snapshot();
        let mirrors: Vec<_> = snapshot
            .connections
            .get(0)
            .map(|conn| {
                conn.peers
                    .iter()
                    .filter(|peer| peer.side == Side::Right)
                    .collect()
            })
            .unwrap_or_default();
        if mirrors.len() == 2 && mirrors.iter().all(|peer| peer.bytes_received == 1000) {
            break;
        }
    }

    // both reactors agree on the connection identity
    let left_cid = harness.left.snapshot().connections[0].cid;
    let right_cid = harness.right.snapshot().connections[0].cid;
    assert_eq!(left_cid, right_cid);

    // a few extra turns must not surface duplicates
    for _ in 0..20 {
        harness.spin();
        if let Some(conn) = server_conn.as_mut() {
            drain(conn, &mut upstream);
        }
    }
    assert_eq!(upstream, payload);

    let snapshot = harness.right.snapshot();
    let conn = &snapshot.connections[0];
    assert_eq!(conn.received[Side::Right], 1000);
    let mirrors: Vec<_> = conn
        .peers
        .iter()
        .filter(|peer| peer.side == Side::Right)
        .collect();
    assert_eq!(mirrors.len(), 2);
    // every path carried everything, whichever handler ran first won
    assert!(mirrors.iter().all(|peer| peer.bytes_received == 1000));
    assert_eq!(
        mirrors.iter().map(|peer| peer.was_source_for).sum::<u64>(),
        1000
    );

    // on the left the client peer sourced the whole stream
    let snapshot = harness.left.snapshot();
    let client_peer = snapshot.connections[0]
        .peers
        .iter()
        .find(|peer| peer.side == Side::Left)
        .unwrap();
    assert_eq!(client_peer.was_source_for, 1000);
}

#[test]
fn client_eof_tears_the_whole_connection_down() {
    let mut harness = Harness::new(2);
    let mut client = harness.connect_client();
    client.write_all(&[7; 50]).unwrap();

    let mut server_conn = None;
    let mut upstream = Vec::new();
    for _ in 0..SPINS {
        harness.spin();
        if server_conn.is_none() {
            server_conn = harness.accept_server();
        }
        if let Some(conn) = server_conn.as_mut() {
            drain(conn, &mut upstream);
        }
        if upstream.len() >= 50 {
            break;
        }
    }
    assert_eq!(upstream.len(), 50);

    drop(client);

    let mut server_conn = server_conn.unwrap();
    let mut server_eof = false;
    for _ in 0..SPINS {
        harness.spin();
        if drain(&mut server_conn, &mut upstream) {
            server_eof = true;
        }
        let left = harness.left.snapshot();
        let right = harness.right.snapshot();
        if server_eof
            && !left.connections[0].open
            && !right.connections[0].open
        {
            break;
        }
    }
    assert!(server_eof);

    // both registries keep the connection, every socket is gone
    for snapshot in [harness.left.snapshot(), harness.right.snapshot()].iter() {
        assert_eq!(snapshot.connections.len(), 1);
        let conn = &snapshot.connections[0];
        assert!(!conn.open);
        assert!(conn
            .peers
            .iter()
            .all(|peer| peer.state == PeerState::Closed));
    }
    // no duplicate or phantom bytes slipped through during teardown
    assert_eq!(upstream.len(), 50);
}

#[test]
fn a_refused_path_does_not_stop_the_mirror() {
    // reserve a port, then close it again: connecting there is refused
    let dead_port = {
        let placeholder = TcpListener::bind("127.0.0.1:0").unwrap();
        placeholder.local_addr().unwrap().port()
    };

    let server = TcpListener::bind("127.0.0.1:0").unwrap();
    server.set_nonblocking(true).unwrap();
    let server_port = server.local_addr().unwrap().port();

    let right = Reactor::new(Side::Right, localhost(), vec![endpoint_to(server_port)])
        .unwrap();
    let right_port = right.local_addr().unwrap().port();

    let left = Reactor::new(
        Side::Left,
        localhost(),
        vec![endpoint_to(right_port), endpoint_to(dead_port)],
    )
    .unwrap();
    let left_addr = left.local_addr().unwrap();

    let mut harness = Harness {
        left,
        right,
        server,
        left_addr,
    };

    let mut client = harness.connect_client();
    client.write_all(b"still getting through").unwrap();

    let mut server_conn = None;
    let mut upstream = Vec::new();
    for _ in 0..SPINS {
        harness.spin();
        if server_conn.is_none() {
            server_conn = harness.accept_server();
        }
        if let Some(conn) = server_conn.as_mut() {
            drain(conn, &mut upstream);
        }
        if upstream.len() >= 21 {
            break;
        }
    }
    assert_eq!(upstream, b"still getting through");
    assert!(harness.left.snapshot().connections[0].open);
}

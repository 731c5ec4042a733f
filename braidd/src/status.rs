//! the once-per-second status screen
//!
//! rendering is split from printing so the layout can be tested; the
//! reactor only hands over plain counters.

use braid_net::{Side, Snapshot};
use std::fmt::Write as _;

/// clear the terminal and print the state of every mirrored connection
pub fn render(snapshot: &Snapshot) {
    print!("\x1b[H\x1b[2J\x1b[3J");
    print!("{}", format(snapshot));
}

pub fn format(snapshot: &Snapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", chrono::Local::now().format("%H:%M:%S"));
    let _ = writeln!(
        out,
        "{} connection(s), {} socket(s) in handshake.",
        snapshot.connections.len(),
        snapshot.handshaking,
    );
    for conn in &snapshot.connections {
        let status = if conn.open { "OPEN" } else { "CLOSED" };
        let _ = writeln!(
            out,
            "Connection {}: {}, {}/{} bytes received.",
            conn.cid,
            status,
            conn.received[Side::Left],
            conn.received[Side::Right],
        );
        for peer in &conn.peers {
            let _ = writeln!(
                out,
                "- {}, {}, {}, {} bytes received, {} new bytes, output buffer has {} bytes.",
                peer.side,
                peer.remote,
                peer.state,
                peer.bytes_received,
                peer.was_source_for,
                peer.buffered,
            );
        }
    }
    out
}

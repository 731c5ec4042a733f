use mio::net::TcpStream;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Formatter},
    io,
    net::{IpAddr, SocketAddr, ToSocketAddrs as _},
};

/// one configured physical path toward the far process
///
/// every logical connection opens one outbound socket per endpoint. The
/// socket is bound to `bind` (and an ephemeral port) before connecting,
/// which is what pins the path to a specific uplink when the host has
/// several.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Endpoint {
    /// local address to bind the outbound socket to
    pub bind: IpAddr,
    /// remote host name or address
    pub host: String,
    /// remote port
    pub port: u16,
}

impl Endpoint {
    /// start a non-blocking connect along this path
    ///
    /// an in-progress connect is success: the socket becomes writable
    /// once the three-way handshake completes, and the reactor picks the
    /// transition up from there.
    pub(crate) fn dial(&self) -> io::Result<TcpStream> {
        use socket2::{Domain, Socket, Type};

        let remote = self.resolve()?;
        let domain = if remote.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::new(self.bind, 0).into())?;

        match socket.connect(&remote.into()) {
            Ok(()) => {}
            Err(error) if error.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {}
            Err(error) => return Err(error),
        }

        tracing::debug!(endpoint = %self, remote = %remote, "dialing");

        Ok(TcpStream::from_std(socket.into()))
    }

    fn resolve(&self) -> io::Result<SocketAddr> {
        let family = self.bind.is_ipv4();
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .find(|addr| addr.is_ipv4() == family)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("no address of {} matches the bind family", self.host),
                )
            })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}:{}", self.bind, self.host, self.port)
    }
}

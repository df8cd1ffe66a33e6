//! Transport adapter: name resolution and stream connections.
//!
//! The engine talks to the network only through [`Connector`] and
//! [`Connection`]. [`TcpConnector`] is the real implementation: it resolves
//! the host, walks the candidates of the requested address family in
//! resolution order and keeps the first connection that succeeds. Connected
//! streams are non-blocking so that `peek` reports would-block instead of
//! parking the caller.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, info, warn};

use crate::error::{DfuError, DfuResult};

/// An open byte-stream connection owned by a download session.
pub trait Connection {
    /// Copy available bytes into `buf` without consuming them.
    fn peek(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Read and consume available bytes.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all of `data`, blocking until it is handed to the OS.
    fn send(&mut self, data: &[u8]) -> io::Result<()>;

    /// Release the connection.
    fn close(self);
}

/// Opens connections for a session.
pub trait Connector {
    type Connection: Connection;

    fn connect(&self, host: &str, port: u16) -> DfuResult<Self::Connection>;
}

/// TCP connector backed by `socket2`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub family: Domain,
    pub protocol: Protocol,
    pub connect_timeout: Option<Duration>,
}

impl TcpConnector {
    /// IPv4 TCP with blocking connects.
    pub fn new() -> Self {
        Self {
            family: Domain::IPV4,
            protocol: Protocol::TCP,
            connect_timeout: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for TcpConnector {
    type Connection = TcpConnection;

    fn connect(&self, host: &str, port: u16) -> DfuResult<TcpConnection> {
        connect(host, port, self.family, self.protocol, self.connect_timeout)
    }
}

/// Resolve `host` and connect to the first reachable address of `family`.
pub fn connect(
    host: &str,
    port: u16,
    family: Domain,
    protocol: Protocol,
    connect_timeout: Option<Duration>,
) -> DfuResult<TcpConnection> {
    if host.is_empty() {
        return Err(DfuError::MissingField("host"));
    }

    let resolved: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|source| DfuError::Resolve {
            host: host.to_string(),
            source,
        })?
        .collect();

    let candidates: Vec<SocketAddr> = resolved
        .iter()
        .copied()
        .filter(|addr| family_matches(family, addr))
        .collect();

    debug!(
        host,
        resolved = resolved.len(),
        usable = candidates.len(),
        "resolved host"
    );

    if candidates.is_empty() {
        return Err(DfuError::NoAddress {
            host: host.to_string(),
        });
    }

    let mut last_error = None;
    for addr in candidates {
        match connect_addr(addr, family, protocol, connect_timeout) {
            Ok(stream) => {
                info!(host, %addr, "connected");
                return TcpConnection::new(stream).map_err(|source| DfuError::Connect {
                    host: host.to_string(),
                    source,
                });
            }
            Err(e) => {
                warn!(host, %addr, error = %e, "connect attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(DfuError::Connect {
        host: host.to_string(),
        source: last_error.unwrap_or_else(|| io::Error::from(io::ErrorKind::NotConnected)),
    })
}

fn family_matches(family: Domain, addr: &SocketAddr) -> bool {
    if family == Domain::IPV4 {
        addr.is_ipv4()
    } else if family == Domain::IPV6 {
        addr.is_ipv6()
    } else {
        false
    }
}

/// One attempt on a fresh socket. A socket whose connect failed is not reused.
fn connect_addr(
    addr: SocketAddr,
    family: Domain,
    protocol: Protocol,
    connect_timeout: Option<Duration>,
) -> io::Result<TcpStream> {
    let socket = Socket::new(family, Type::STREAM, Some(protocol))?;
    let remote = SockAddr::from(addr);
    match connect_timeout {
        Some(timeout) => socket.connect_timeout(&remote, timeout)?,
        None => socket.connect(&remote)?,
    }
    socket.set_nodelay(true)?;
    Ok(socket.into())
}

/// Non-blocking TCP stream.
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
}

impl TcpConnection {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self { stream })
    }
}

impl Connection for TcpConnection {
    fn peek(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.peek(buf)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.set_nonblocking(false)?;
        let written = self.stream.write_all(data);
        self.stream.set_nonblocking(true)?;
        written
    }

    fn close(self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

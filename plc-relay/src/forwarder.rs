use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use crate::error::ForwardError;

/// Anything that can emit one datagram to an address.
pub trait Transport: Send {
    fn send_to(&self, payload: &[u8], destination: SocketAddr) -> io::Result<usize>;
}

impl Transport for UdpSocket {
    fn send_to(&self, payload: &[u8], destination: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, payload, destination)
    }
}

/// Creates fresh outbound sockets for a [`ForwardingSocket`].
pub trait Connector: Send {
    type Socket: Transport;

    fn connect(&self) -> io::Result<Self::Socket>;
}

/// Binds an ephemeral UDP socket of the destination's address family with
/// the configured I/O timeout.
#[derive(Debug, Clone)]
pub struct UdpConnector {
    bind_addr: SocketAddr,
    timeout: Duration,
}

impl UdpConnector {
    pub fn for_destination(destination: SocketAddr, timeout: Duration) -> Self {
        let unspecified = match destination.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        Self {
            bind_addr: SocketAddr::new(unspecified, 0),
            timeout,
        }
    }
}

impl Connector for UdpConnector {
    type Socket = UdpSocket;

    fn connect(&self) -> io::Result<UdpSocket> {
        let socket = UdpSocket::bind(self.bind_addr)?;
        socket.set_write_timeout(Some(self.timeout))?;
        socket.set_read_timeout(Some(self.timeout))?;
        Ok(socket)
    }
}

enum SocketState<S> {
    Unset,
    Live(S),
}

/// Owns at most one outbound socket and replaces it whenever a send fails.
///
/// `Unset --create--> Live --send fails--> Live (recreated)`. If recreation
/// itself fails the state falls back to `Unset` and the next send tries again.
pub struct ForwardingSocket<C: Connector = UdpConnector> {
    connector: C,
    destination: SocketAddr,
    state: SocketState<C::Socket>,
    recreations: u64,
}

impl ForwardingSocket<UdpConnector> {
    pub fn udp(destination: SocketAddr, timeout: Duration) -> Self {
        Self::new(UdpConnector::for_destination(destination, timeout), destination)
    }
}

impl<C: Connector> ForwardingSocket<C> {
    pub fn new(connector: C, destination: SocketAddr) -> Self {
        Self {
            connector,
            destination,
            state: SocketState::Unset,
            recreations: 0,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.state, SocketState::Live(_))
    }

    /// Number of times the socket was replaced after a failed send.
    pub fn recreations(&self) -> u64 {
        self.recreations
    }

    /// Create the socket if there is none yet.
    pub fn ensure_live(&mut self) -> Result<(), ForwardError> {
        if let SocketState::Unset = self.state {
            let socket = self.connector.connect().map_err(ForwardError::Unavailable)?;
            self.state = SocketState::Live(socket);
        }
        Ok(())
    }

    /// Close the current socket, if any, and put a new one in its place.
    pub fn recreate(&mut self) -> Result<(), ForwardError> {
        self.state = SocketState::Unset;
        self.recreations += 1;
        match self.connector.connect() {
            Ok(socket) => {
                self.state = SocketState::Live(socket);
                tracing::info!("Socket recreated successfully");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to recreate socket");
                Err(ForwardError::Unavailable(e))
            }
        }
    }

    /// Send one datagram to the destination.
    ///
    /// A failed send is logged and the socket is recreated before the error
    /// is returned, so the caller only has to count the drop.
    pub fn send(&mut self, payload: &[u8]) -> Result<usize, ForwardError> {
        // The failed recreation was logged when it happened.
        if let Err(e) = self.ensure_live() {
            tracing::debug!(error = %e, "Dropping packet");
            return Err(e);
        }

        let result = match &self.state {
            SocketState::Live(socket) => socket.send_to(payload, self.destination),
            SocketState::Unset => Err(io::Error::from(io::ErrorKind::NotConnected)),
        };

        match result {
            Ok(sent) => Ok(sent),
            Err(e) => {
                match e.kind() {
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                        tracing::error!(destination = %self.destination, "Socket timeout while forwarding packet");
                    }
                    _ => {
                        tracing::error!(destination = %self.destination, error = %e, "Socket error while forwarding");
                    }
                }
                // Already logged; the next send retries creation.
                let _ = self.recreate();
                Err(ForwardError::Send {
                    destination: self.destination,
                    source: e,
                })
            }
        }
    }

    /// Release the socket. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.state = SocketState::Unset;
    }
}

//! UDP socket plumbing for sACN.
//!
//! Receive sockets bind a universe's multicast group on the configured
//! interface (with address reuse, so several listeners on one host can
//! coexist) or the interface's unicast address, so unicast-delivered sACN
//! for arbitrary universes is picked up as well. The transmit socket binds
//! the interface, enables multicast loopback and selects the outbound
//! multicast interface.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Socket, Type};

use crate::{DEFAULT_PORT, UniverseNumber};

/// The largest datagram the engine will read; generously above the 638 byte
/// maximum E1.31 data packet.
pub(crate) const MAX_DATAGRAM_SIZE: usize = 1144;

/// Error type for socket construction and I/O.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    /// Binding the UDP socket failed.
    #[error("failed to bind socket on {addr}: {source}")]
    BindFailed {
        /// The address that could not be bound.
        addr: SocketAddr,
        /// The underlying OS error.
        source: io::Error,
    },

    /// Joining the universe multicast group failed.
    #[error("failed to join multicast group {group}: {source}")]
    MulticastJoinFailed {
        /// The group that could not be joined.
        group: Ipv4Addr,
        /// The underlying OS error.
        source: io::Error,
    },

    /// An [std::io::Error] wrapper.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// E1.31 9.3.1: the multicast group for a universe is
/// `239.255.{high byte}.{low byte}` of the universe number.
pub fn multicast_address(universe: UniverseNumber) -> Ipv4Addr {
    let [high, low] = universe.to_be_bytes();
    Ipv4Addr::new(239, 255, high, low)
}

fn new_rx_socket() -> Result<Socket, SocketError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(not(windows))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// A receive socket owned by one listener.
pub(crate) struct RxSocket {
    socket: Socket,
    local: SocketAddr,
    joined: Option<(Ipv4Addr, Ipv4Addr)>,
}

impl RxSocket {
    /// Binds the universe's multicast group and joins it on `interface`.
    pub fn multicast(universe: UniverseNumber, interface: Ipv4Addr) -> Result<Self, SocketError> {
        let group = multicast_address(universe);
        let addr = SocketAddr::V4(SocketAddrV4::new(group, DEFAULT_PORT));

        let socket = new_rx_socket()?;
        socket
            .bind(&addr.into())
            .map_err(|source| SocketError::BindFailed { addr, source })?;
        socket
            .join_multicast_v4(&group, &interface)
            .map_err(|source| SocketError::MulticastJoinFailed { group, source })?;

        log::debug!("joined multicast group {group} for universe {universe} on {interface}");

        Ok(Self { socket, local: addr, joined: Some((group, interface)) })
    }

    /// Binds the interface's unicast address on the sACN port.
    pub fn unicast(interface: Ipv4Addr) -> Result<Self, SocketError> {
        let addr = SocketAddr::V4(SocketAddrV4::new(interface, DEFAULT_PORT));

        let socket = new_rx_socket()?;
        socket
            .bind(&addr.into())
            .map_err(|source| SocketError::BindFailed { addr, source })?;

        log::debug!("bound unicast receive socket on {addr}");

        Ok(Self { socket, local: addr, joined: None })
    }

    /// The address this socket was bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Reads one pending datagram into `data`, replacing its contents.
    ///
    /// Returns `Ok(None)` when no datagram is waiting.
    pub fn recv_from(&self, data: &mut Vec<u8>) -> io::Result<Option<SocketAddr>> {
        data.clear();
        data.reserve(MAX_DATAGRAM_SIZE);
        let buffer = data.spare_capacity_mut();

        match self.socket.recv_from(buffer) {
            Ok((received, sender)) => {
                // SAFETY: just received into the `buffer`.
                unsafe {
                    data.set_len(received);
                }
                Ok(sender.as_socket())
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl Drop for RxSocket {
    fn drop(&mut self) {
        if let Some((group, interface)) = self.joined {
            self.socket.leave_multicast_v4(&group, &interface).ok();
        }
    }
}

/// The transmit socket shared by all sending universes.
pub(crate) struct TxSocket {
    socket: Socket,
}

impl TxSocket {
    /// Binds `interface` and routes outbound multicast through it, with
    /// loopback enabled so local listeners see our own output.
    pub fn bind(interface: Ipv4Addr) -> Result<Self, SocketError> {
        let addr = SocketAddr::V4(SocketAddrV4::new(interface, 0));

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
        socket
            .bind(&addr.into())
            .map_err(|source| SocketError::BindFailed { addr, source })?;
        socket.set_multicast_if_v4(&interface)?;
        socket.set_multicast_loop_v4(true)?;

        log::debug!("bound transmit socket on {interface}");

        Ok(Self { socket })
    }

    /// Emits one datagram.
    pub fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, &addr.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multicast_address_encodes_universe_big_endian() {
        assert_eq!(multicast_address(1), Ipv4Addr::new(239, 255, 0, 1));
        assert_eq!(multicast_address(256), Ipv4Addr::new(239, 255, 1, 0));
        assert_eq!(multicast_address(63999), Ipv4Addr::new(239, 255, 249, 255));
    }

    #[test]
    fn tx_socket_binds_loopback() {
        let socket = TxSocket::bind(Ipv4Addr::LOCALHOST);
        assert!(socket.is_ok());
    }
}

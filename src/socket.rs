//! UDP socket abstraction.
//!
//! The data plane picks among listeners by address family and reacts
//! specially to the message-too-long send failure, so both are part of the
//! trait. Tests drive the pipelines with in-memory implementations.

use std::net::{SocketAddr, UdpSocket};

use socket2::SockRef;

use crate::error::WireError;

/// One bound UDP socket usable by the data plane.
pub trait ListenSocket {
    /// Whether this socket is bound to an IPv4 address.
    fn is_ipv4(&self) -> bool;
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<(), WireError>;
    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), WireError>;
    /// Updates the IP type-of-service byte used for subsequent sends.
    fn set_tos(&self, tos: i32) -> Result<(), WireError>;
}

/// [`ListenSocket`] over an OS UDP socket.
pub struct UdpListenSocket {
    socket: UdpSocket,
}

impl UdpListenSocket {
    /// Wraps an already bound (and typically non-blocking) socket.
    pub fn new(socket: UdpSocket) -> Self {
        Self { socket }
    }
}

impl ListenSocket for UdpListenSocket {
    fn is_ipv4(&self) -> bool {
        self.socket.local_addr().map(|a| a.is_ipv4()).unwrap_or(false)
    }

    fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<(), WireError> {
        match self.socket.send_to(data, addr) {
            Ok(_) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EMSGSIZE) => Err(WireError::MessageTooLong),
            Err(e) => Err(WireError::Io(e)),
        }
    }

    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), WireError> {
        Ok(self.socket.recv_from(buf)?)
    }

    fn set_tos(&self, tos: i32) -> Result<(), WireError> {
        SockRef::from(&self.socket).set_tos(tos as u32)?;
        Ok(())
    }
}

/// Rewrites a v4-mapped IPv6 address as plain IPv4 so peer lookup does not
/// depend on which family the OS reported a sender under.
pub fn unmap_v4(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(ip) => SocketAddr::new(ip.into(), v6.port()),
            None => addr,
        },
        v4 => v4,
    }
}

//! Non-blocking datagram sockets behind a closed set of backends.
//!
//! Ordinary network conditions are reported as [SocketStatus] values rather than errors: a socket
//!  that can not currently send or has nothing to receive is `NotReady`, which callers retry on
//!  their next cycle. Only local failures (binding, a socket in a genuine error state) are
//!  returned as `Err`.

mod udp;
mod virtual_network;

pub use udp::UdpBackend;
pub use virtual_network::{VirtualBackend, VirtualNetwork};

use std::net::{IpAddr, SocketAddr};
#[cfg(test)] use mockall::automock;
use tracing::debug;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SocketStatus<T = ()> {
    Ok(T),
    NotReady,
    PeerClosed,
}

/// The capability set each backend provides. [SocketAdapter] selects one implementation at
///  construction and forwards to it.
#[cfg_attr(test, automock)]
pub trait DatagramBackend {
    fn bind(&mut self, addr: IpAddr, port: u16) -> anyhow::Result<()>;

    fn send(&self, packet: &[u8], to: SocketAddr) -> anyhow::Result<SocketStatus>;

    /// On success, returns the number of bytes written to `buf` and the sender's address
    fn recv(&self, buf: &mut [u8]) -> anyhow::Result<SocketStatus<(usize, SocketAddr)>>;

    fn close(&mut self);

    fn local_addr(&self) -> Option<SocketAddr>;
}

pub enum SocketAdapter {
    Udp(UdpBackend),
    Virtual(VirtualBackend),
    #[cfg(test)]
    Mock(MockDatagramBackend),
}

impl SocketAdapter {
    pub fn udp(recv_buffer_size: Option<usize>) -> SocketAdapter {
        SocketAdapter::Udp(UdpBackend::new(recv_buffer_size))
    }

    pub fn virtual_network(network: &VirtualNetwork) -> SocketAdapter {
        SocketAdapter::Virtual(VirtualBackend::new(network.clone()))
    }

    pub fn bind(&mut self, addr: IpAddr, port: u16) -> anyhow::Result<()> {
        match self {
            SocketAdapter::Udp(b) => b.bind(addr, port)?,
            SocketAdapter::Virtual(b) => b.bind(addr, port)?,
            #[cfg(test)]
            SocketAdapter::Mock(b) => b.bind(addr, port)?,
        }
        debug!("socket bound to {:?}", self.local_addr());
        Ok(())
    }

    pub fn send(&self, packet: &[u8], to: SocketAddr) -> anyhow::Result<SocketStatus> {
        match self {
            SocketAdapter::Udp(b) => b.send(packet, to),
            SocketAdapter::Virtual(b) => b.send(packet, to),
            #[cfg(test)]
            SocketAdapter::Mock(b) => b.send(packet, to),
        }
    }

    pub fn recv(&self, buf: &mut [u8]) -> anyhow::Result<SocketStatus<(usize, SocketAddr)>> {
        match self {
            SocketAdapter::Udp(b) => b.recv(buf),
            SocketAdapter::Virtual(b) => b.recv(buf),
            #[cfg(test)]
            SocketAdapter::Mock(b) => b.recv(buf),
        }
    }

    pub fn close(&mut self) {
        match self {
            SocketAdapter::Udp(b) => b.close(),
            SocketAdapter::Virtual(b) => b.close(),
            #[cfg(test)]
            SocketAdapter::Mock(b) => b.close(),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            SocketAdapter::Udp(b) => b.local_addr(),
            SocketAdapter::Virtual(b) => b.local_addr(),
            #[cfg(test)]
            SocketAdapter::Mock(b) => b.local_addr(),
        }
    }

    pub fn local_port(&self) -> Option<u16> {
        self.local_addr().map(|a| a.port())
    }
}

use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use anyhow::bail;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, trace};
use crate::socket::{DatagramBackend, SocketStatus};

/// A plain OS UDP socket in non-blocking mode
pub struct UdpBackend {
    socket: Option<UdpSocket>,
    recv_buffer_size: Option<usize>,
}

impl UdpBackend {
    pub fn new(recv_buffer_size: Option<usize>) -> UdpBackend {
        UdpBackend {
            socket: None,
            recv_buffer_size,
        }
    }

    fn bound_socket(&self) -> anyhow::Result<&UdpSocket> {
        match &self.socket {
            Some(socket) => Ok(socket),
            None => bail!("UDP socket is not bound"),
        }
    }
}

impl DatagramBackend for UdpBackend {
    fn bind(&mut self, addr: IpAddr, port: u16) -> anyhow::Result<()> {
        if self.socket.is_some() {
            bail!("UDP socket is already bound");
        }

        let addr = SocketAddr::new(addr, port);
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        if let Some(size) = self.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        self.socket = Some(socket.into());
        Ok(())
    }

    fn send(&self, packet: &[u8], to: SocketAddr) -> anyhow::Result<SocketStatus> {
        trace!("UDP socket: sending {} bytes to {:?}", packet.len(), to);

        match self.bound_socket()?.send_to(packet, to) {
            Ok(_) => Ok(SocketStatus::Ok(())),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                Ok(SocketStatus::NotReady)
            }
            Err(e) if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused) => {
                debug!("UDP socket: {:?} is not reachable: {}", to, e);
                Ok(SocketStatus::PeerClosed)
            }
            Err(e) => {
                error!("error sending UDP packet to {:?}: {}", to, e);
                Err(e.into())
            }
        }
    }

    fn recv(&self, buf: &mut [u8]) -> anyhow::Result<SocketStatus<(usize, SocketAddr)>> {
        match self.bound_socket()?.recv_from(buf) {
            Ok((num_read, from)) => Ok(SocketStatus::Ok((num_read, from))),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                Ok(SocketStatus::NotReady)
            }
            Err(e) if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused) => {
                // some platforms report ICMP 'port unreachable' for an earlier send on the next receive
                debug!("UDP socket: ignoring {}", e);
                Ok(SocketStatus::NotReady)
            }
            Err(e) => {
                error!("socket error: {}", e);
                Err(e.into())
            }
        }
    }

    fn close(&mut self) {
        self.socket = None;
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref()
            .and_then(|s| s.local_addr().ok())
    }
}

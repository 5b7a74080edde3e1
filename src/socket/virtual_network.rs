use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use anyhow::bail;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use tracing::trace;
use crate::socket::{DatagramBackend, SocketStatus};

const FIRST_EPHEMERAL_PORT: u16 = 49152;

struct LossModel {
    drop_rate: f64,
    rng: StdRng,
}

#[derive(Default)]
struct NetworkInner {
    endpoints: FxHashMap<SocketAddr, VecDeque<(Bytes, SocketAddr)>>,
    next_ephemeral_port: u16,
    loss: Option<LossModel>,
}

impl NetworkInner {
    fn allocate_port(&mut self, ip: IpAddr) -> anyhow::Result<u16> {
        if self.next_ephemeral_port < FIRST_EPHEMERAL_PORT {
            self.next_ephemeral_port = FIRST_EPHEMERAL_PORT;
        }
        for port in self.next_ephemeral_port..=u16::MAX {
            if !self.endpoints.contains_key(&SocketAddr::new(ip, port)) {
                self.next_ephemeral_port = port.saturating_add(1);
                return Ok(port);
            }
        }
        bail!("no free ephemeral port on virtual network for {}", ip)
    }

    fn is_dropped(&mut self) -> bool {
        match &mut self.loss {
            Some(loss) => loss.rng.gen_bool(loss.drop_rate),
            None => false,
        }
    }
}

/// An in-process datagram network. Sockets bound to it exchange packets through per-address
///  queues, optionally losing a seeded, reproducible share of them. Cloning yields another handle
///  to the same network.
#[derive(Clone, Default)]
pub struct VirtualNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl VirtualNetwork {
    pub fn new() -> VirtualNetwork {
        Default::default()
    }

    /// `drop_rate` is the probability in `[0, 1]` that any single datagram is lost
    pub fn with_packet_loss(drop_rate: f64, seed: u64) -> anyhow::Result<VirtualNetwork> {
        if !(0.0..=1.0).contains(&drop_rate) {
            bail!("drop rate must be between 0 and 1, was {}", drop_rate);
        }

        let network = VirtualNetwork::new();
        network.lock().loss = Some(LossModel {
            drop_rate,
            rng: StdRng::seed_from_u64(seed),
        });
        Ok(network)
    }

    fn lock(&self) -> MutexGuard<'_, NetworkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bind(&self, ip: IpAddr, port: u16) -> anyhow::Result<SocketAddr> {
        let mut inner = self.lock();
        let port = if port == 0 {
            inner.allocate_port(ip)?
        }
        else {
            port
        };

        let addr = SocketAddr::new(ip, port);
        if inner.endpoints.contains_key(&addr) {
            bail!("virtual address {:?} is already in use", addr);
        }
        inner.endpoints.insert(addr, VecDeque::new());
        Ok(addr)
    }

    fn unbind(&self, addr: SocketAddr) {
        self.lock().endpoints.remove(&addr);
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, packet: &[u8]) {
        let mut inner = self.lock();
        if inner.is_dropped() {
            trace!("virtual network: dropping packet from {:?} to {:?}", from, to);
            return;
        }
        match inner.endpoints.get_mut(&to) {
            Some(queue) => queue.push_back((Bytes::copy_from_slice(packet), from)),
            None => trace!("virtual network: no socket bound to {:?} - discarding packet", to),
        }
    }

    fn take(&self, addr: SocketAddr) -> Option<(Bytes, SocketAddr)> {
        self.lock().endpoints.get_mut(&addr)
            .and_then(|queue| queue.pop_front())
    }
}

/// A socket on a [VirtualNetwork]
pub struct VirtualBackend {
    network: VirtualNetwork,
    local_addr: Option<SocketAddr>,
}

impl VirtualBackend {
    pub fn new(network: VirtualNetwork) -> VirtualBackend {
        VirtualBackend {
            network,
            local_addr: None,
        }
    }

    fn bound_addr(&self) -> anyhow::Result<SocketAddr> {
        match self.local_addr {
            Some(addr) => Ok(addr),
            None => bail!("virtual socket is not bound"),
        }
    }
}

impl DatagramBackend for VirtualBackend {
    fn bind(&mut self, addr: IpAddr, port: u16) -> anyhow::Result<()> {
        if self.local_addr.is_some() {
            bail!("virtual socket is already bound");
        }
        self.local_addr = Some(self.network.bind(addr, port)?);
        Ok(())
    }

    fn send(&self, packet: &[u8], to: SocketAddr) -> anyhow::Result<SocketStatus> {
        let from = self.bound_addr()?;
        self.network.deliver(from, to, packet);
        Ok(SocketStatus::Ok(()))
    }

    fn recv(&self, buf: &mut [u8]) -> anyhow::Result<SocketStatus<(usize, SocketAddr)>> {
        let addr = self.bound_addr()?;
        match self.network.take(addr) {
            Some((packet, from)) => {
                // excess bytes are discarded, as for a real datagram socket
                let num_read = packet.len().min(buf.len());
                buf[..num_read].copy_from_slice(&packet[..num_read]);
                Ok(SocketStatus::Ok((num_read, from)))
            }
            None => Ok(SocketStatus::NotReady),
        }
    }

    fn close(&mut self) {
        if let Some(addr) = self.local_addr.take() {
            self.network.unbind(addr);
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for VirtualBackend {
    fn drop(&mut self) {
        self.close();
    }
}

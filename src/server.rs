use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use anyhow::bail;
use bytes::Bytes;
use tracing::{debug, info, span, trace, Level};
use uuid::Uuid;
use crate::config::RigelNetConfig;
use crate::connector::{Connector, ConnectorStatus};
use crate::event::ConnectorEvent;
use crate::handler::MessageDispatcher;
use crate::local_mailbox::LocalMailbox;
use crate::socket::{SocketAdapter, SocketStatus};
use crate::telemetry::{Telemetry, UDP_HEADER_LEN};

/// A connector event, tagged with the slot it happened in
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerEvent {
    pub client_index: i32,
    pub event: ConnectorEvent,
}

/// Accepts connections from up to a fixed number of clients, each in its own connector slot. The
///  slot index is the client's index for the lifetime of the connection.
pub struct Server {
    socket: SocketAdapter,
    connectors: Vec<Connector>,
    recv_buf: Vec<u8>,
    events: VecDeque<ServerEvent>,
}

impl Server {
    pub fn new(config: RigelNetConfig, socket: SocketAdapter, max_clients: usize) -> anyhow::Result<Server> {
        config.validate()?;
        if max_clients == 0 || max_clients > i32::MAX as usize {
            bail!("server must have between 1 and {} client slots, was {}", i32::MAX, max_clients);
        }

        let config = Arc::new(config);
        Ok(Server {
            socket,
            connectors: (0..max_clients)
                .map(|_| Connector::new(config.clone()))
                .collect(),
            recv_buf: vec![0; RigelNetConfig::MAX_UDP_PAYLOAD],
            events: VecDeque::new(),
        })
    }

    /// Binds to `port` on all local IPv4 interfaces
    pub fn start(&mut self, port: u16) -> anyhow::Result<()> {
        self.start_on(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
    }

    pub fn start_on(&mut self, addr: IpAddr, port: u16) -> anyhow::Result<()> {
        self.socket.bind(addr, port)?;
        info!("server listening on {:?}", self.socket.local_addr());
        Ok(())
    }

    /// Disconnects all clients, notifying them, and releases the socket
    pub fn stop(&mut self, message: &str) {
        for connector in self.connectors.iter_mut() {
            connector.disconnect(&self.socket, true, message);
        }
        self.socket.close();
        self.collect_events();
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn local_port(&self) -> Option<u16> {
        self.socket.local_port()
    }

    pub fn max_clients(&self) -> usize {
        self.connectors.len()
    }

    /// The number of fully connected clients
    pub fn client_count(&self) -> usize {
        self.connectors.iter()
            .filter(|c| c.is_connected())
            .count()
    }

    pub fn connector(&self, client_index: i32) -> Option<&Connector> {
        usize::try_from(client_index).ok()
            .and_then(|idx| self.connectors.get(idx))
    }

    pub fn connector_mut(&mut self, client_index: i32) -> Option<&mut Connector> {
        usize::try_from(client_index).ok()
            .and_then(|idx| self.connectors.get_mut(idx))
    }

    pub fn poll_event(&mut self) -> Option<ServerEvent> {
        self.events.pop_front()
    }

    /// Pairs a free slot with a client in the same process. Returns the slot index and the mailbox
    ///  for the client's side.
    pub fn accept_local_connection(&mut self, passphrase: &str) -> anyhow::Result<(i32, LocalMailbox)> {
        let Some(idx) = self.free_slot() else {
            bail!("no free client slot for a local connection");
        };
        let client_index = idx as i32;

        let result = match self.connectors[idx].try_accept_local(passphrase, client_index) {
            Some(mailbox) => Ok((client_index, mailbox)),
            None => Err(anyhow::anyhow!("local connection rejected: passphrase mismatch")),
        };
        self.collect_events();
        result
    }

    pub fn kick_client(&mut self, client_index: i32, notify_remote: bool, message: &str) -> anyhow::Result<()> {
        let Some(connector) = usize::try_from(client_index).ok().and_then(|idx| self.connectors.get_mut(idx)) else {
            bail!("no client slot {}", client_index);
        };

        info!("kicking client {}: {}", client_index, message);
        connector.disconnect(&self.socket, notify_remote, message);
        self.collect_events();
        Ok(())
    }

    fn free_slot(&self) -> Option<usize> {
        self.connectors.iter()
            .position(|c| c.status() == ConnectorStatus::Disconnected)
    }

    /// The receive phase of a cycle: drains the socket, routes every datagram to its connector,
    ///  and dispatches the messages that became complete
    pub fn update_receive(&mut self, dispatcher: &mut dyn MessageDispatcher) -> anyhow::Result<Telemetry> {
        let mut telemetry = Telemetry::default();

        for connector in self.connectors.iter_mut() {
            connector.prep_to_receive();
        }

        if self.socket.local_addr().is_some() {
            loop {
                let (num_read, from) = match self.socket.recv(&mut self.recv_buf)? {
                    SocketStatus::Ok(x) => x,
                    SocketStatus::NotReady | SocketStatus::PeerClosed => break,
                };
                telemetry += Telemetry::downloaded((num_read + UDP_HEADER_LEN) as u64);

                let correlation_id = Uuid::new_v4();
                let span = span!(Level::TRACE, "packet_received", ?correlation_id);
                let _entered = span.enter();

                trace!("received {} bytes from {:?}", num_read, from);
                let packet = Bytes::copy_from_slice(&self.recv_buf[..num_read]);
                self.route_packet(from, packet);
            }
        }

        for connector in self.connectors.iter_mut() {
            if connector.is_connected() {
                connector.receiving_finished();
            }
        }
        for connector in self.connectors.iter_mut() {
            if connector.status() != ConnectorStatus::Disconnected {
                connector.handle_data_messages(&self.socket, dispatcher);
                connector.check_for_timeout();
            }
        }

        self.collect_events();
        Ok(telemetry)
    }

    fn route_packet(&mut self, from: SocketAddr, packet: Bytes) {
        let existing = self.connectors.iter_mut()
            .find(|c| c.status() != ConnectorStatus::Disconnected
                && !c.is_connected_locally()
                && c.remote_info().addr == from);
        if let Some(connector) = existing {
            connector.received_packet(packet);
            return;
        }

        match self.free_slot() {
            Some(idx) => {
                if !self.connectors[idx].try_accept(from, idx as i32, packet) {
                    trace!("dropping packet from unknown sender {:?}", from);
                }
            }
            None => debug!("no free client slot for {:?} - dropping packet", from),
        }
    }

    /// The send phase of a cycle for all connectors
    pub fn update_send(&mut self) -> anyhow::Result<Telemetry> {
        let mut telemetry = Telemetry::default();
        for connector in self.connectors.iter_mut() {
            if connector.status() != ConnectorStatus::Disconnected {
                telemetry += connector.send(&self.socket)?;
            }
        }
        self.collect_events();
        Ok(telemetry)
    }

    fn collect_events(&mut self) {
        for (idx, connector) in self.connectors.iter_mut().enumerate() {
            while let Some(event) = connector.poll_event() {
                debug!("client {}: {:?}", idx, event);
                self.events.push_back(ServerEvent {
                    client_index: idx as i32,
                    event,
                });
            }
        }
    }
}

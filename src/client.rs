use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use bytes::Bytes;
use tracing::{info, span, trace, Level};
use uuid::Uuid;
use crate::config::RigelNetConfig;
use crate::connector::{Connector, ConnectorStatus};
use crate::event::ConnectorEvent;
use crate::handler::MessageDispatcher;
use crate::server::Server;
use crate::socket::{SocketAdapter, SocketStatus};
use crate::telemetry::{Telemetry, UDP_HEADER_LEN};

/// The connecting side: a single connector talking to one server, either over the socket or
///  in-process
pub struct Client {
    config: Arc<RigelNetConfig>,
    socket: SocketAdapter,
    connector: Connector,
    server_addr: Option<SocketAddr>,
    recv_buf: Vec<u8>,
}

impl Client {
    pub fn new(config: RigelNetConfig, socket: SocketAdapter) -> anyhow::Result<Client> {
        config.validate()?;

        let config = Arc::new(config);
        Ok(Client {
            connector: Connector::new(config.clone()),
            config,
            socket,
            server_addr: None,
            recv_buf: vec![0; RigelNetConfig::MAX_UDP_PAYLOAD],
        })
    }

    /// Binds the socket to `local_port` (0 for any) unless it is bound already, and starts the
    ///  handshake with the server
    pub fn connect(&mut self, local_port: u16, server_addr: SocketAddr) -> anyhow::Result<()> {
        if self.socket.local_addr().is_none() {
            let local_ip = match server_addr {
                SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            };
            self.socket.bind(local_ip, local_port)?;
        }

        self.connector.connect(server_addr)?;
        self.server_addr = Some(server_addr);
        info!("connecting to server at {:?} from {:?}", server_addr, self.socket.local_addr());
        Ok(())
    }

    /// Joins a server in the same process, bypassing the socket
    pub fn connect_local(&mut self, server: &mut Server) -> anyhow::Result<()> {
        let (client_index, mailbox) = server.accept_local_connection(&self.config.passphrase)?;
        self.connector.connect_local(mailbox, client_index)?;
        self.server_addr = None;
        Ok(())
    }

    pub fn disconnect(&mut self, notify_remote: bool, message: &str) {
        self.connector.disconnect(&self.socket, notify_remote, message);
    }

    pub fn local_port(&self) -> Option<u16> {
        self.socket.local_port()
    }

    pub fn is_connected(&self) -> bool {
        self.connector.is_connected()
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    pub fn connector_mut(&mut self) -> &mut Connector {
        &mut self.connector
    }

    pub fn poll_event(&mut self) -> Option<ConnectorEvent> {
        self.connector.poll_event()
    }

    /// The receive phase of a cycle. Datagrams from anywhere but the server are discarded.
    pub fn update_receive(&mut self, dispatcher: &mut dyn MessageDispatcher) -> anyhow::Result<Telemetry> {
        let mut telemetry = Telemetry::default();
        self.connector.prep_to_receive();

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

                if Some(from) != self.server_addr || self.connector.is_connected_locally() {
                    trace!("dropping packet from {:?}, which is not the server", from);
                    continue;
                }
                self.connector.received_packet(Bytes::copy_from_slice(&self.recv_buf[..num_read]));
            }
        }

        if self.connector.is_connected() {
            self.connector.receiving_finished();
        }
        if self.connector.status() != ConnectorStatus::Disconnected {
            self.connector.handle_data_messages(&self.socket, dispatcher);
            self.connector.check_for_timeout();
        }
        Ok(telemetry)
    }

    pub fn update_send(&mut self) -> anyhow::Result<Telemetry> {
        self.connector.send(&self.socket)
    }
}

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use crate::config::RigelNetConfig;
use crate::event::{ConnectAttemptFailedReason, ConnectorEvent, DisconnectReason};
use crate::handler::{compose_message, HandlerId, MessageContext, MessageDispatcher};
use crate::local_mailbox::{LocalMailbox, MailboxStatus};
use crate::packet_kind::PacketKind;
use crate::packet_ordinal::PacketOrdinal;
use crate::receive_buffer::ReceiveBuffer;
use crate::remote_info::{LatencyAccumulator, RemoteInfo};
use crate::send_buffer::SendBuffer;
use crate::socket::{SocketAdapter, SocketStatus};
use crate::telemetry::{Telemetry, UDP_HEADER_LEN};
use crate::util::buf::{put_string, string_ser_len, try_get_string};

const NO_DISCONNECT_DETAILS: &str = "No additional details available.";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectorStatus {
    Disconnected,
    /// waiting for the peer to confirm our HELLO with a CONNECT
    Connecting,
    /// waiting for the first data packet after confirming the peer's HELLO
    Accepting,
    Connected,
}

/// The result of processing a single packet. A fatal violation terminates the connection.
#[derive(Debug, Eq, PartialEq)]
enum PacketOutcome {
    Continue,
    FatalViolation(String),
}

/// One end of a RigelNet connection.
///
/// A connector is driven in cycles by the node that owns it: a receive phase
///  ([Connector::prep_to_receive], [Connector::received_packet] for every packet from the peer,
///  [Connector::receiving_finished], [Connector::handle_data_messages],
///  [Connector::check_for_timeout]) followed by a send phase ([Connector::send]). None of these
///  block.
///
/// Anything the peer does wrong ends the connection with an event rather than an error. Only
///  local failures of the socket are returned as `Err`.
///
/// Connectors are reused: disconnecting resets all per-session state, and the connector can
///  connect again afterwards.
pub struct Connector {
    config: Arc<RigelNetConfig>,
    status: ConnectorStatus,
    remote_info: RemoteInfo,
    send_buffer: SendBuffer,
    receive_buffer: ReceiveBuffer,
    /// ordinals received in the current cycle, acknowledged weakly in an ACKS packet
    weak_acks: Vec<PacketOrdinal>,
    latency_samples: LatencyAccumulator,
    client_index: Option<i32>,
    local_mailbox: Option<LocalMailbox>,
    events: VecDeque<ConnectorEvent>,
    /// set when a session starts in the receive phase, so that the application can poll the
    ///  `Connected` event before the first message is dispatched
    skip_next_dispatch: bool,
}

impl Connector {
    pub fn new(config: Arc<RigelNetConfig>) -> Connector {
        let send_buffer = SendBuffer::new(config.max_packet_size, config.retransmit_predicate.clone());
        Connector {
            config,
            status: ConnectorStatus::Disconnected,
            remote_info: RemoteInfo::default(),
            send_buffer,
            receive_buffer: ReceiveBuffer::default(),
            weak_acks: Vec::new(),
            latency_samples: LatencyAccumulator::default(),
            client_index: None,
            local_mailbox: None,
            events: VecDeque::new(),
            skip_next_dispatch: false,
        }
    }

    pub fn status(&self) -> ConnectorStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectorStatus::Connected
    }

    pub fn is_connected_locally(&self) -> bool {
        self.local_mailbox.is_some()
    }

    pub fn remote_info(&self) -> &RemoteInfo {
        &self.remote_info
    }

    pub fn client_index(&self) -> Option<i32> {
        self.client_index
    }

    pub fn poll_event(&mut self) -> Option<ConnectorEvent> {
        self.events.pop_front()
    }

    /// Starts the handshake with a peer that is expected to accept the connection
    pub fn connect(&mut self, addr: SocketAddr) -> anyhow::Result<()> {
        if self.status != ConnectorStatus::Disconnected {
            bail!("connect requires a disconnected connector, status is {:?}", self.status);
        }

        debug!("connecting to {:?}", addr);
        self.remote_info = RemoteInfo::for_addr(addr);
        self.status = ConnectorStatus::Connecting;
        Ok(())
    }

    /// Checks whether `packet` from `from` is a HELLO with the right passphrase, and if so starts
    ///  accepting the connection under `client_index`
    pub fn try_accept(&mut self, from: SocketAddr, client_index: i32, packet: Bytes) -> bool {
        if self.status != ConnectorStatus::Disconnected {
            return false;
        }

        let passphrase = match Self::parse_hello(packet) {
            Ok(passphrase) => passphrase,
            Err(e) => {
                debug!("not accepting connection from {:?}: {}", from, e);
                return false;
            }
        };
        if passphrase != self.config.passphrase {
            warn!("not accepting connection from {:?}: passphrase mismatch", from);
            return false;
        }

        debug!("accepting connection from {:?} as client {}", from, client_index);
        self.remote_info = RemoteInfo::for_addr(from);
        self.client_index = Some(client_index);
        self.status = ConnectorStatus::Accepting;
        true
    }

    fn parse_hello(mut packet: Bytes) -> anyhow::Result<String> {
        let kind = PacketKind::deser(&mut packet)?;
        if kind != PacketKind::Hello {
            bail!("expected HELLO, got {:?}", kind);
        }
        try_get_string(&mut packet)
    }

    /// Accepts an in-process peer. On success, returns the mailbox for the peer's side, which
    ///  the peer passes to [Connector::connect_local].
    pub fn try_accept_local(&mut self, passphrase: &str, client_index: i32) -> Option<LocalMailbox> {
        if self.status != ConnectorStatus::Disconnected {
            return None;
        }
        if passphrase != self.config.passphrase {
            warn!("not accepting local connection: passphrase mismatch");
            return None;
        }

        let (own, peer) = LocalMailbox::pair();
        self.start_local_session(own, client_index);
        Some(peer)
    }

    pub fn connect_local(&mut self, mailbox: LocalMailbox, client_index: i32) -> anyhow::Result<()> {
        if self.status != ConnectorStatus::Disconnected {
            bail!("connect requires a disconnected connector, status is {:?}", self.status);
        }
        self.start_local_session(mailbox, client_index);
        Ok(())
    }

    fn start_local_session(&mut self, mailbox: LocalMailbox, client_index: i32) {
        info!("connected locally as client {}", client_index);
        self.remote_info = RemoteInfo::default();
        self.local_mailbox = Some(mailbox);
        self.client_index = Some(client_index);
        self.start_session();
        self.events.push_back(ConnectorEvent::Connected);
    }

    fn start_session(&mut self) {
        self.status = ConnectorStatus::Connected;
        self.skip_next_dispatch = !self.is_connected_locally();
        self.remote_info.timeout_stopwatch = Instant::now();
    }

    /// Ends the connection. This is a no-op for a disconnected connector.
    pub fn disconnect(&mut self, socket: &SocketAdapter, notify_remote: bool, message: &str) {
        if self.status == ConnectorStatus::Disconnected {
            return;
        }

        if notify_remote && self.status == ConnectorStatus::Connected && !self.is_connected_locally() {
            let packet = control_packet(PacketKind::Disconnect, message);
            match socket.send(&packet, self.remote_info.addr) {
                Ok(SocketStatus::Ok(())) => {}
                Ok(status) => debug!("DISCONNECT to {:?} not sent: {:?}", self.remote_info.addr, status),
                Err(e) => warn!("error sending DISCONNECT to {:?}: {}", self.remote_info.addr, e),
            }
        }

        info!("disconnecting from {:?}: {}", self.remote_info.addr, message);
        self.reset_all();
        self.events.push_back(ConnectorEvent::Disconnected {
            reason: DisconnectReason::Graceful,
            message: message.to_string(),
        });
    }

    fn reset_all(&mut self) {
        self.send_buffer.reset();
        self.receive_buffer.reset();
        self.weak_acks.clear();
        self.latency_samples = LatencyAccumulator::default();
        self.remote_info = RemoteInfo::default();
        self.status = ConnectorStatus::Disconnected;
        self.client_index = None;
        self.skip_next_dispatch = false;

        if let Some(mailbox) = self.local_mailbox.take() {
            mailbox.set_status(MailboxStatus::EndedGraceful);
        }
    }

    fn fail(&mut self, reason: String) {
        warn!("terminating connection to {:?}: {}", self.remote_info.addr, reason);

        let was_connected = self.status == ConnectorStatus::Connected;
        if let Some(mailbox) = &self.local_mailbox {
            mailbox.set_status(MailboxStatus::EndedError);
        }
        self.reset_all();

        if was_connected {
            self.events.push_back(ConnectorEvent::Disconnected {
                reason: DisconnectReason::Error,
                message: reason,
            });
        }
        else {
            self.events.push_back(ConnectorEvent::ConnectAttemptFailed {
                reason: ConnectAttemptFailedReason::Error,
            });
        }
    }

    /// Queues application data for the peer. Data appended to a disconnected connector is
    ///  discarded.
    pub fn append_for_sending(&mut self, data: &[u8]) {
        if self.status == ConnectorStatus::Disconnected {
            debug!("discarding {} bytes appended to a disconnected connector", data.len());
            return;
        }
        self.send_buffer.append_for_sending(data);
    }

    pub fn send_message(&mut self, handler_id: HandlerId, args: &[u8]) {
        self.append_for_sending(&compose_message(handler_id, args));
    }

    pub fn prep_to_receive(&mut self) {
        self.latency_samples = LatencyAccumulator::default();
    }

    /// Processes a packet from the peer
    pub fn received_packet(&mut self, packet: Bytes) {
        if self.status == ConnectorStatus::Disconnected {
            debug!("disconnected connector ignores packet");
            return;
        }
        self.remote_info.timeout_stopwatch = Instant::now();

        let outcome = self.process_packet(packet)
            .unwrap_or_else(|e| PacketOutcome::FatalViolation(format!("malformed packet: {}", e)));
        if let PacketOutcome::FatalViolation(reason) = outcome {
            self.fail(reason);
        }
    }

    /// Commits the latency samples collected since [Connector::prep_to_receive]
    pub fn receiving_finished(&mut self) {
        self.remote_info.apply_latency_samples(&self.latency_samples);
    }

    fn process_packet(&mut self, mut packet: Bytes) -> anyhow::Result<PacketOutcome> {
        let kind = PacketKind::deser(&mut packet)?;
        trace!("received {:?} packet of {} bytes while {:?}", kind, packet.len() + PacketKind::SERIALIZED_LEN, self.status);

        match kind {
            PacketKind::Hello => Ok(self.process_hello()),
            PacketKind::Connect => self.process_connect(packet),
            PacketKind::Disconnect => Ok(self.process_disconnect(packet)),
            PacketKind::Data | PacketKind::DataMore | PacketKind::DataTail => self.process_data(kind, packet),
            PacketKind::Acks => self.process_acks(packet),
        }
    }

    fn process_hello(&mut self) -> PacketOutcome {
        match self.status {
            ConnectorStatus::Connecting => PacketOutcome::FatalViolation("received HELLO while connecting".to_string()),
            ConnectorStatus::Connected => {
                debug!("ignoring HELLO from {:?} on established connection", self.remote_info.addr);
                PacketOutcome::Continue
            }
            ConnectorStatus::Accepting | ConnectorStatus::Disconnected => PacketOutcome::Continue,
        }
    }

    fn process_connect(&mut self, mut packet: Bytes) -> anyhow::Result<PacketOutcome> {
        match self.status {
            ConnectorStatus::Connecting => {}
            ConnectorStatus::Accepting => return Ok(PacketOutcome::FatalViolation("received CONNECT while accepting".to_string())),
            ConnectorStatus::Connected | ConnectorStatus::Disconnected => {
                debug!("ignoring CONNECT from {:?} on established connection", self.remote_info.addr);
                return Ok(PacketOutcome::Continue);
            }
        }

        let passphrase = try_get_string(&mut packet)?;
        let client_index = packet.try_get_i32()?;

        if passphrase != self.config.passphrase {
            warn!("{:?} answered with a different passphrase", self.remote_info.addr);
            self.reset_all();
            self.events.push_back(ConnectorEvent::BadPassphrase);
            return Ok(PacketOutcome::Continue);
        }

        info!("connected to {:?} as client {}", self.remote_info.addr, client_index);
        self.client_index = Some(client_index);
        self.start_session();
        self.events.push_back(ConnectorEvent::Connected);
        Ok(PacketOutcome::Continue)
    }

    fn process_disconnect(&mut self, mut packet: Bytes) -> PacketOutcome {
        let details = try_get_string(&mut packet)
            .unwrap_or_else(|_| NO_DISCONNECT_DETAILS.to_string());

        info!("{:?} terminated the connection: {}", self.remote_info.addr, details);
        self.reset_all();
        self.events.push_back(ConnectorEvent::Disconnected {
            reason: DisconnectReason::Graceful,
            message: format!("Remote terminated the connection: {}", details),
        });
        PacketOutcome::Continue
    }

    fn process_data(&mut self, kind: PacketKind, mut packet: Bytes) -> anyhow::Result<PacketOutcome> {
        match self.status {
            ConnectorStatus::Connecting => return Ok(PacketOutcome::FatalViolation(format!("received {:?} while connecting", kind))),
            ConnectorStatus::Accepting => {
                info!("connection from {:?} established", self.remote_info.addr);
                self.start_session();
                self.events.push_back(ConnectorEvent::Connected);
            }
            ConnectorStatus::Connected => {}
            ConnectorStatus::Disconnected => return Ok(PacketOutcome::Continue),
        }

        let ordinal = PacketOrdinal::deser(&mut packet)?;
        self.prepare_ack(ordinal);

        let max_window_len = if self.is_connected_locally() { None } else { self.config.max_receive_window };
        let acks = self.receive_buffer.store_data_packet(packet, ordinal, kind, max_window_len)?;
        for ack in acks {
            self.received_ack(ack, true)?;
        }
        Ok(PacketOutcome::Continue)
    }

    fn process_acks(&mut self, mut packet: Bytes) -> anyhow::Result<PacketOutcome> {
        if self.status != ConnectorStatus::Connected {
            return Ok(PacketOutcome::FatalViolation(format!("received ACKS while {:?}", self.status)));
        }

        while packet.has_remaining() {
            let ordinal = PacketOrdinal::deser(&mut packet)?;
            if ordinal == PacketOrdinal::TERMINATOR {
                break;
            }
            self.received_ack(ordinal, false)?;
        }
        Ok(PacketOutcome::Continue)
    }

    fn prepare_ack(&mut self, ordinal: PacketOrdinal) {
        if self.is_connected_locally() {
            return;
        }
        self.send_buffer.append_ack(ordinal);
        self.weak_acks.push(ordinal);
    }

    fn received_ack(&mut self, ordinal: PacketOrdinal, is_strong: bool) -> anyhow::Result<()> {
        if let Some(time_to_ack) = self.send_buffer.ack_received(ordinal, is_strong)? {
            self.latency_samples.add_sample(time_to_ack);
        }
        Ok(())
    }

    /// Dispatches all complete messages that arrived from the peer, in order. Dispatching stops
    ///  as soon as the connection ends, e.g. because a handler disconnected.
    ///
    /// In the cycle a session over the network starts, nothing is dispatched: the messages stay
    ///  buffered until the next cycle, after the `Connected` event was observable.
    pub fn handle_data_messages(&mut self, socket: &SocketAdapter, dispatcher: &mut dyn MessageDispatcher) {
        if self.status == ConnectorStatus::Disconnected {
            return;
        }

        let local_packets = self.local_mailbox.as_mut()
            .map(|mailbox| mailbox.get_data())
            .unwrap_or_default();
        for packet in local_packets {
            self.received_packet(packet);
            if self.status == ConnectorStatus::Disconnected {
                return;
            }
        }

        let skip_dispatch = std::mem::take(&mut self.skip_next_dispatch);
        while !skip_dispatch && self.status == ConnectorStatus::Connected {
            let message = match self.receive_buffer.take_next_ready() {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(e) => {
                    self.fail(format!("corrupt receive buffer: {}", e));
                    return;
                }
            };
            if message.is_empty() {
                continue;
            }

            let result = dispatcher.on_message(&mut MessageContext::new(self, socket), message);
            if let Err(e) = result {
                self.fail(format!("error handling message: {}", e));
                return;
            }
        }

        let local_status = self.local_mailbox.as_ref().map(|m| m.status());
        match local_status {
            None | Some(MailboxStatus::Active) => {}
            Some(MailboxStatus::EndedGraceful) => {
                info!("local peer terminated the connection");
                self.reset_all();
                self.events.push_back(ConnectorEvent::Disconnected {
                    reason: DisconnectReason::Graceful,
                    message: "Local peer terminated the connection".to_string(),
                });
            }
            Some(MailboxStatus::EndedError) => {
                info!("local connection ended with an error");
                self.reset_all();
                self.events.push_back(ConnectorEvent::Disconnected {
                    reason: DisconnectReason::Error,
                    message: "Local connection ended with an error".to_string(),
                });
            }
        }
    }

    /// Ends the connection if nothing arrived from the peer for the configured timeout. In-process
    ///  connections never time out.
    pub fn check_for_timeout(&mut self) {
        if self.status == ConnectorStatus::Disconnected
            || self.is_connected_locally()
            || self.config.timeout_limit.is_zero()
        {
            return;
        }
        if self.remote_info.time_since_last_receive() < self.config.timeout_limit {
            return;
        }

        info!("connection to {:?} timed out while {:?}", self.remote_info.addr, self.status);
        let was_connected = self.status == ConnectorStatus::Connected;
        self.reset_all();

        if was_connected {
            self.events.push_back(ConnectorEvent::Disconnected {
                reason: DisconnectReason::TimedOut,
                message: "Connection timed out".to_string(),
            });
        }
        else {
            self.events.push_back(ConnectorEvent::ConnectAttemptFailed {
                reason: ConnectAttemptFailedReason::TimedOut,
            });
        }
    }

    /// The send phase of a cycle: handshake packets while connecting or accepting, data and
    ///  acknowledgements while connected
    pub fn send(&mut self, socket: &SocketAdapter) -> anyhow::Result<Telemetry> {
        match self.status {
            ConnectorStatus::Disconnected => Ok(Telemetry::default()),
            ConnectorStatus::Connecting => {
                let packet = control_packet(PacketKind::Hello, &self.config.passphrase);
                self.send_control_packet(socket, &packet)
            }
            ConnectorStatus::Accepting => {
                let mut packet = control_packet(PacketKind::Connect, &self.config.passphrase);
                packet.put_i32(self.client_index.unwrap_or(-1));
                self.send_control_packet(socket, &packet)
            }
            ConnectorStatus::Connected => {
                if let Some(mailbox) = &self.local_mailbox {
                    mailbox.put_data(self.send_buffer.export_packets());
                    Ok(Telemetry::default())
                }
                else {
                    self.upload_all_data(socket)
                }
            }
        }
    }

    fn send_control_packet(&self, socket: &SocketAdapter, packet: &[u8]) -> anyhow::Result<Telemetry> {
        match socket.send(packet, self.remote_info.addr)? {
            SocketStatus::Ok(()) => Ok(Telemetry::uploaded((packet.len() + UDP_HEADER_LEN) as u64)),
            status => {
                debug!("handshake packet to {:?} not sent: {:?}", self.remote_info.addr, status);
                Ok(Telemetry::default())
            }
        }
    }

    fn upload_all_data(&mut self, socket: &SocketAdapter) -> anyhow::Result<Telemetry> {
        let addr = self.remote_info.addr;
        let mut packet_limit = self.config.max_packets_per_send;

        let outcome = self.send_buffer.send(&mut packet_limit, self.remote_info.mean_latency, |packet| socket.send(packet, addr))?;
        let mut telemetry = Telemetry::uploaded(outcome.uploaded_bytes);

        match outcome.status {
            SocketStatus::Ok(()) | SocketStatus::NotReady => {}
            SocketStatus::PeerClosed => {
                // not expected for UDP, but treated as the peer closing the connection
                info!("{:?} closed the connection", addr);
                self.reset_all();
                self.events.push_back(ConnectorEvent::Disconnected {
                    reason: DisconnectReason::Graceful,
                    message: "Remote terminated the connection".to_string(),
                });
                return Ok(telemetry);
            }
        }

        telemetry += self.send_weak_acks(socket)?;
        Ok(telemetry)
    }

    fn send_weak_acks(&mut self, socket: &SocketAdapter) -> anyhow::Result<Telemetry> {
        let mut telemetry = Telemetry::default();
        if self.weak_acks.is_empty() {
            return Ok(telemetry);
        }

        let acks_per_packet = (self.config.max_packet_size - PacketKind::SERIALIZED_LEN) / PacketOrdinal::SERIALIZED_LEN - 1;
        for chunk in self.weak_acks.chunks(acks_per_packet) {
            let mut packet = BytesMut::with_capacity(self.config.max_packet_size);
            PacketKind::Acks.ser(&mut packet);
            for ordinal in chunk {
                ordinal.ser(&mut packet);
            }
            PacketOrdinal::TERMINATOR.ser(&mut packet);

            match socket.send(&packet, self.remote_info.addr)? {
                SocketStatus::Ok(()) => telemetry += Telemetry::uploaded((packet.len() + UDP_HEADER_LEN) as u64),
                // weak acks are best effort, the strong acks follow with the next data packets
                _ => break,
            }
        }
        self.weak_acks.clear();
        Ok(telemetry)
    }
}

/// A handshake or disconnect packet: the kind followed by a length-prefixed string. The
///  capacity leaves room for the client index trailing a CONNECT packet.
fn control_packet(kind: PacketKind, text: &str) -> BytesMut {
    let mut packet = BytesMut::with_capacity(PacketKind::SERIALIZED_LEN + string_ser_len(text) + size_of::<i32>());
    kind.ser(&mut packet);
    put_string(&mut packet, text);
    packet
}

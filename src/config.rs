use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;
use crate::send_buffer::SendBuffer;

/// Decides whether an unacknowledged packet is sent again. The arguments are the number of send
///  cycles since the packet was last transmitted, the time since it was last transmitted, and the
///  current mean latency estimate for the connection.
pub type RetransmitPredicate = Arc<dyn Fn(u32, Duration, Duration) -> bool + Send + Sync>;

/// Retransmit once twice the mean latency has passed without an acknowledgement. While there is
///  no latency estimate yet, this resends on every cycle.
pub fn default_retransmit_predicate() -> RetransmitPredicate {
    Arc::new(|_cycles, elapsed, latency| elapsed >= 2 * latency)
}

#[derive(Clone)]
pub struct RigelNetConfig {
    /// Shared secret that both sides exchange in cleartext during the handshake. It guards
    ///  against accidental cross-talk between deployments, not against an attacker.
    pub passphrase: String,

    /// This is the maximum size of a UDP payload (i.e. a RigelNet packet including its header).
    ///  Messages that do not fit are fragmented by RigelNet rather than relying on IP level
    ///  fragmentation.
    ///
    /// With full Ethernet frames and no optional IP headers, this is `1500 - 20 - 8 = 1472`
    ///  for IPV4 and `1500 - 40 - 8 = 1452` for IPV6.
    pub max_packet_size: usize,

    /// A connection is considered dead if nothing arrives from the peer for this long.
    ///  `Duration::ZERO` disables timeouts. In-process connections never time out.
    pub timeout_limit: Duration,

    /// The maximum number of data packets a connector sends (or re-sends) per send cycle
    pub max_packets_per_send: usize,

    pub retransmit_predicate: RetransmitPredicate,

    /// Size of the OS level receive buffer for UDP sockets, if it should differ from the
    ///  system default
    pub recv_buffer_size: Option<usize>,

    /// Upper bound for the number of packets a connector holds in its receive window, counted
    ///  from the oldest packet not yet delivered. A peer that exceeds it is disconnected. `None`
    ///  lets the window grow as far as the peer's data requires, which is what messages spanning
    ///  many fragments need. In-process connections are never limited.
    pub max_receive_window: Option<usize>,
}

impl RigelNetConfig {
    /// The biggest payload a UDP datagram can carry over IPV4
    pub const MAX_UDP_PAYLOAD: usize = 65507;

    /// Defaults for IPV4 with end-to-end full Ethernet MTU and no optional headers
    pub fn default_ipv4(passphrase: impl Into<String>) -> RigelNetConfig {
        RigelNetConfig {
            passphrase: passphrase.into(),
            max_packet_size: 1472,
            timeout_limit: Duration::from_secs(5),
            max_packets_per_send: 10,
            retransmit_predicate: default_retransmit_predicate(),
            recv_buffer_size: None,
            max_receive_window: None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_packet_size <= SendBuffer::MAX_HEADER_LEN {
            bail!("max packet size must exceed the maximum header size of {} bytes", SendBuffer::MAX_HEADER_LEN);
        }
        if self.max_packet_size > Self::MAX_UDP_PAYLOAD {
            bail!("max packet size must not exceed the maximum UDP payload of {} bytes", Self::MAX_UDP_PAYLOAD);
        }
        if self.max_packets_per_send == 0 {
            bail!("at least one packet must be sent per send cycle");
        }
        if let Some(0) = self.recv_buffer_size {
            bail!("receive buffer size must not be zero");
        }
        if let Some(0) = self.max_receive_window {
            bail!("receive window limit must not be zero");
        }
        Ok(())
    }
}

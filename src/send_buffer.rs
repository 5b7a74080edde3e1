use std::cmp::min;
use std::collections::VecDeque;
use std::time::Duration;
use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{trace, warn};
use crate::config::RetransmitPredicate;
use crate::packet_kind::PacketKind;
use crate::packet_ordinal::PacketOrdinal;
use crate::socket::SocketStatus;
use crate::telemetry::UDP_HEADER_LEN;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SendTag {
    ReadyForSending,
    NotAcknowledged,
    WeaklyAcknowledged,
    StronglyAcknowledged,
}

struct TaggedPacket {
    packet: BytesMut,
    header_len: usize,
    tag: SendTag,
    last_transmit: Instant,
    /// send cycles since the packet was last transmitted
    cycles: u32,
}

impl TaggedPacket {
    fn set_kind(&mut self, kind: PacketKind) {
        self.packet[..PacketKind::SERIALIZED_LEN].copy_from_slice(&u32::from(kind).to_be_bytes());
    }
}

#[derive(Debug, Eq, PartialEq)]
pub struct SendOutcome {
    pub status: SocketStatus,
    /// bytes that went onto the wire, including UDP headers
    pub uploaded_bytes: u64,
}

/// The outbound half of a connection: turns appended application bytes into a window of data
///  packets and keeps them until the peer acknowledges them.
///
/// The last packet in the window (the 'tail') is the one that appended data goes to. It is never
///  transmitted before a send cycle finalizes it, and every send cycle starts a fresh tail so that
///  at least one packet per cycle reaches the peer. These possibly empty packets carry
///  piggy-backed acknowledgements and keep the connection alive.
pub struct SendBuffer {
    max_packet_size: usize,
    retransmit_predicate: RetransmitPredicate,
    packets: VecDeque<TaggedPacket>,
    head_ordinal: PacketOrdinal,
    /// strong acks owed to the peer, embedded in the next packets that are prepared
    acknowledges: VecDeque<PacketOrdinal>,
}

impl SendBuffer {
    pub const MAX_ACKS_PER_PACKET: usize = 16;
    pub const MIN_HEADER_LEN: usize = PacketKind::SERIALIZED_LEN + 2 * PacketOrdinal::SERIALIZED_LEN;
    pub const MAX_HEADER_LEN: usize = Self::MIN_HEADER_LEN + Self::MAX_ACKS_PER_PACKET * PacketOrdinal::SERIALIZED_LEN;

    pub fn new(max_packet_size: usize, retransmit_predicate: RetransmitPredicate) -> SendBuffer {
        assert!(max_packet_size > Self::MAX_HEADER_LEN, "config validation should have ensured a sufficient packet size");

        let mut result = SendBuffer {
            max_packet_size,
            retransmit_predicate,
            packets: VecDeque::new(),
            head_ordinal: PacketOrdinal::FIRST,
            acknowledges: VecDeque::new(),
        };
        result.prepare_next_packet(PacketKind::Data);
        result
    }

    pub fn reset(&mut self) {
        self.packets.clear();
        self.head_ordinal = PacketOrdinal::FIRST;
        self.acknowledges.clear();
        self.prepare_next_packet(PacketKind::Data);
    }

    /// number of packets in the window, including the tail
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn head_ordinal(&self) -> PacketOrdinal {
        self.head_ordinal
    }

    fn tail(&self) -> &TaggedPacket {
        self.packets.back()
            .expect("send buffer always has a tail packet")
    }

    fn tail_mut(&mut self) -> &mut TaggedPacket {
        self.packets.back_mut()
            .expect("send buffer always has a tail packet")
    }

    fn next_header_len(&self) -> usize {
        Self::MIN_HEADER_LEN + min(self.acknowledges.len(), Self::MAX_ACKS_PER_PACKET) * PacketOrdinal::SERIALIZED_LEN
    }

    fn prepare_next_packet(&mut self, kind: PacketKind) {
        let ordinal = self.head_ordinal + self.packets.len();

        let mut packet = BytesMut::with_capacity(self.max_packet_size);
        kind.ser(&mut packet);
        ordinal.ser(&mut packet);

        if self.acknowledges.len() > Self::MAX_ACKS_PER_PACKET {
            warn!("excessive number of pending acknowledges ({}) - sending the rest with the next packet", self.acknowledges.len());
        }
        let num_acks = min(self.acknowledges.len(), Self::MAX_ACKS_PER_PACKET);
        for ack in self.acknowledges.drain(..num_acks) {
            ack.ser(&mut packet);
        }
        PacketOrdinal::TERMINATOR.ser(&mut packet);

        self.packets.push_back(TaggedPacket {
            header_len: packet.len(),
            packet,
            tag: SendTag::ReadyForSending,
            last_transmit: Instant::now(),
            cycles: 0,
        });
    }

    /// Queues a strong acknowledgement for a packet received from the peer
    pub fn append_ack(&mut self, ordinal: PacketOrdinal) {
        self.acknowledges.push_back(ordinal);
    }

    /// Appends application data. Data is kept together in a single packet whenever it fits, and
    ///  fragmented into a run of `DataMore` packets terminated by a `DataTail` packet otherwise.
    pub fn append_for_sending(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        if self.tail().tag != SendTag::ReadyForSending {
            self.prepare_next_packet(PacketKind::Data);
        }

        if self.tail().packet.len() + data.len() <= self.max_packet_size {
            self.tail_mut().packet.put_slice(data);
            return;
        }
        if data.len() + self.next_header_len() <= self.max_packet_size {
            self.prepare_next_packet(PacketKind::Data);
            self.tail_mut().packet.put_slice(data);
            return;
        }

        // A tail that is more than half full goes out on its own, a less full tail becomes the
        //  first fragment
        if self.tail().packet.len() > self.max_packet_size / 2 {
            self.prepare_next_packet(PacketKind::DataMore);
        }
        else {
            self.tail_mut().set_kind(PacketKind::DataMore);
        }

        let mut remaining = data;
        loop {
            let max_packet_size = self.max_packet_size;
            let tail = self.tail_mut();
            let (now, rest) = remaining.split_at(min(max_packet_size - tail.packet.len(), remaining.len()));
            tail.packet.put_slice(now);
            remaining = rest;

            if remaining.is_empty() {
                break;
            }
            self.prepare_next_packet(PacketKind::DataMore);
        }
        self.tail_mut().set_kind(PacketKind::DataTail);

        // the next write must not be glued to the fragment run
        self.prepare_next_packet(PacketKind::Data);
    }

    /// Transmits packets that were never sent, and re-transmits unacknowledged packets for which
    ///  the retransmit predicate says so. Every successful transmission consumes one unit of
    ///  `packet_limit`, and sending stops when it is used up or the socket reports anything but
    ///  `Ok`.
    ///
    /// If all due packets went out, the tail is finalized and a new tail is started.
    pub fn send(&mut self, packet_limit: &mut usize, latency: Duration, mut send_fn: impl FnMut(&[u8]) -> anyhow::Result<SocketStatus>) -> anyhow::Result<SendOutcome> {
        let mut uploaded_bytes = 0;

        for (idx, tagged) in self.packets.iter_mut().enumerate() {
            if *packet_limit == 0 {
                break;
            }

            match tagged.tag {
                SendTag::WeaklyAcknowledged | SendTag::StronglyAcknowledged => continue,
                SendTag::ReadyForSending | SendTag::NotAcknowledged => {}
            }

            let is_due = tagged.tag == SendTag::ReadyForSending
                || (self.retransmit_predicate)(tagged.cycles, tagged.last_transmit.elapsed(), latency);

            if is_due {
                trace!("sending packet {} ({} bytes)", self.head_ordinal + idx, tagged.packet.len());
                match send_fn(&tagged.packet)? {
                    SocketStatus::Ok(()) => {}
                    status => return Ok(SendOutcome { status, uploaded_bytes }),
                }
                uploaded_bytes += (tagged.packet.len() + UDP_HEADER_LEN) as u64;
                *packet_limit -= 1;
                tagged.last_transmit = Instant::now();
                tagged.cycles = 0;
            }
            else {
                tagged.cycles += 1;
            }
            tagged.tag = SendTag::NotAcknowledged;
        }

        if self.tail().tag != SendTag::ReadyForSending {
            self.prepare_next_packet(PacketKind::Data);
        }

        Ok(SendOutcome {
            status: SocketStatus::Ok(()),
            uploaded_bytes,
        })
    }

    /// Applies an acknowledgement from the peer. A strong ack retires the packet, a weak ack only
    ///  stops it from being re-transmitted.
    ///
    /// Returns the time since the packet's latest transmission if this was the first strong ack
    ///  for it, which is a sample of the round trip latency. Acks for packets that were already
    ///  retired are ignored, acks for packets that were never sent are a protocol violation.
    pub fn ack_received(&mut self, ordinal: PacketOrdinal, is_strong: bool) -> anyhow::Result<Option<Duration>> {
        let Some(idx) = ordinal.index_from(self.head_ordinal) else {
            return Ok(None);
        };
        let Some(target) = self.packets.get_mut(idx) else {
            bail!("received ACK for a packet that was not sent yet ({})", ordinal);
        };

        match (target.tag, is_strong) {
            (SendTag::ReadyForSending, _) => {
                bail!("received ACK for a packet that was not sent yet ({})", ordinal);
            }
            (SendTag::StronglyAcknowledged, _) => {
                return Ok(None);
            }
            (SendTag::WeaklyAcknowledged, false) => {
                return Ok(None);
            }
            (SendTag::NotAcknowledged, false) => {
                target.tag = SendTag::WeaklyAcknowledged;
                target.packet = BytesMut::new();
                return Ok(None);
            }
            (SendTag::NotAcknowledged | SendTag::WeaklyAcknowledged, true) => {}
        }

        let time_to_ack = target.last_transmit.elapsed();
        target.tag = SendTag::StronglyAcknowledged;
        target.packet = BytesMut::new();

        if idx == 0 {
            while let Some(SendTag::StronglyAcknowledged) = self.packets.front().map(|p| p.tag) {
                self.packets.pop_front();
                self.head_ordinal = self.head_ordinal + 1;
            }
            if self.packets.is_empty() {
                self.prepare_next_packet(PacketKind::Data);
            }
        }

        Ok(Some(time_to_ack))
    }

    /// Drains the window for hand-over to an in-process peer. Acknowledgements play no role
    ///  there, so every packet is handed over exactly once. An empty tail stays behind.
    pub fn export_packets(&mut self) -> Vec<Bytes> {
        let mut result = Vec::with_capacity(self.packets.len());

        while self.packets.len() > 1 {
            if let Some(tagged) = self.packets.pop_front() {
                result.push(tagged.packet.freeze());
                self.head_ordinal = self.head_ordinal + 1;
            }
        }

        if self.tail().packet.len() > self.tail().header_len {
            if let Some(tagged) = self.packets.pop_front() {
                result.push(tagged.packet.freeze());
                self.head_ordinal = self.head_ordinal + 1;
            }
            self.prepare_next_packet(PacketKind::Data);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_retransmit_predicate;
    use bytes::Buf;
    use rstest::rstest;
    use std::sync::Arc;
    use tokio::time::advance;

    struct ParsedPacket {
        kind: PacketKind,
        ordinal: u32,
        acks: Vec<u32>,
        payload: Vec<u8>,
    }

    fn parse(packet: &[u8]) -> ParsedPacket {
        let mut buf = packet;
        let kind = PacketKind::deser(&mut buf).unwrap();
        let ordinal = buf.get_u32();
        let mut acks = Vec::new();
        loop {
            let ack = buf.get_u32();
            if ack == 0 {
                break;
            }
            acks.push(ack);
        }
        ParsedPacket { kind, ordinal, acks, payload: buf.to_vec() }
    }

    fn never_retransmit() -> RetransmitPredicate {
        Arc::new(|_, _, _| false)
    }

    fn send_all(buffer: &mut SendBuffer) -> Vec<ParsedPacket> {
        let mut sent = Vec::new();
        let mut limit = usize::MAX;
        let outcome = buffer.send(&mut limit, Duration::ZERO, |p| {
            sent.push(parse(p));
            Ok(SocketStatus::Ok(()))
        }).unwrap();
        assert_eq!(outcome.status, SocketStatus::Ok(()));
        sent
    }

    fn exported(buffer: &mut SendBuffer) -> Vec<ParsedPacket> {
        buffer.export_packets().iter()
            .map(|p| parse(p))
            .collect()
    }

    #[test]
    fn test_new() {
        let mut buffer = SendBuffer::new(200, never_retransmit());
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.head_ordinal(), PacketOrdinal::FIRST);

        let sent = send_all(&mut buffer);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, PacketKind::Data);
        assert_eq!(sent[0].ordinal, 1);
        assert!(sent[0].acks.is_empty());
        assert!(sent[0].payload.is_empty());
    }

    #[rstest]
    #[case::single(vec![10], vec![(PacketKind::Data, 10)])]
    #[case::combined(vec![10, 20, 30], vec![(PacketKind::Data, 60)])]
    #[case::exactly_full(vec![188], vec![(PacketKind::Data, 188)])]
    #[case::second_packet(vec![100, 100], vec![(PacketKind::Data, 100), (PacketKind::Data, 100)])]
    #[case::max_unfragmented(vec![100, 188], vec![(PacketKind::Data, 100), (PacketKind::Data, 188)])]
    #[case::fragmented_reusing_tail(vec![50, 300], vec![(PacketKind::DataMore, 188), (PacketKind::DataTail, 162)])]
    #[case::fragmented_after_full_tail(vec![150, 300], vec![(PacketKind::Data, 150), (PacketKind::DataMore, 188), (PacketKind::DataTail, 112)])]
    #[case::fragmented_exact(vec![376], vec![(PacketKind::DataMore, 188), (PacketKind::DataTail, 188)])]
    #[case::data_after_fragments(vec![189, 5], vec![(PacketKind::DataMore, 188), (PacketKind::DataTail, 1), (PacketKind::Data, 5)])]
    fn test_append_for_sending(#[case] appended: Vec<usize>, #[case] expected: Vec<(PacketKind, usize)>) {
        let mut buffer = SendBuffer::new(200, never_retransmit());

        let mut all_data = Vec::new();
        for (i, &len) in appended.iter().enumerate() {
            let data = vec![i as u8 + 1; len];
            buffer.append_for_sending(&data);
            all_data.extend_from_slice(&data);
        }

        let sent = send_all(&mut buffer);
        let actual = sent.iter()
            .filter(|p| !p.payload.is_empty())
            .map(|p| (p.kind, p.payload.len()))
            .collect::<Vec<_>>();
        assert_eq!(actual, expected);

        for (i, p) in sent.iter().enumerate() {
            assert_eq!(p.ordinal, i as u32 + 1);
            assert!(p.payload.len() + 12 <= 200);
        }

        let concatenated = sent.iter()
            .flat_map(|p| p.payload.iter().cloned())
            .collect::<Vec<_>>();
        assert_eq!(concatenated, all_data);
    }

    #[test]
    fn test_fragment_5000_bytes() {
        let mut buffer = SendBuffer::new(1200, never_retransmit());
        let data = (0..5000).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        buffer.append_for_sending(&data);

        let sent = send_all(&mut buffer);
        // the trailing packet is the fresh Data packet started after the fragment run
        let (fragments, rest) = sent.split_at(sent.len() - 1);
        assert_eq!(rest[0].kind, PacketKind::Data);
        assert!(rest[0].payload.is_empty());

        assert_eq!(fragments.len(), 5);
        for p in &fragments[..fragments.len() - 1] {
            assert_eq!(p.kind, PacketKind::DataMore);
            assert_eq!(p.payload.len(), 1200 - 12);
        }
        assert_eq!(fragments[4].kind, PacketKind::DataTail);

        let reassembled = fragments.iter()
            .flat_map(|p| p.payload.iter().cloned())
            .collect::<Vec<_>>();
        assert_eq!(reassembled, data);
    }

    #[test]
    fn test_ordinals_strictly_increasing() {
        let mut buffer = SendBuffer::new(100, never_retransmit());
        let mut ordinals = Vec::new();
        for i in 0..20 {
            buffer.append_for_sending(&vec![1u8; 7 * i + 1]);
            ordinals.extend(send_all(&mut buffer).iter().map(|p| p.ordinal));
        }
        assert!(ordinals.windows(2).all(|w| w[0] + 1 == w[1]));
        assert_eq!(ordinals[0], 1);
    }

    #[test]
    fn test_acks_piggy_backed() {
        let mut buffer = SendBuffer::new(200, never_retransmit());
        for ack in 1..=20 {
            buffer.append_ack(PacketOrdinal::from_raw(ack));
        }

        // the initial tail was prepared before the acks were queued
        let first = send_all(&mut buffer);
        assert_eq!(first.len(), 1);
        assert!(first[0].acks.is_empty());

        let second = send_all(&mut buffer);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].acks, (1..=16).collect::<Vec<_>>());

        let third = send_all(&mut buffer);
        assert_eq!(third[0].acks, vec![17, 18, 19, 20]);

        let fourth = send_all(&mut buffer);
        assert!(fourth[0].acks.is_empty());
    }

    #[test]
    fn test_header_len_with_pending_acks() {
        let mut buffer = SendBuffer::new(200, never_retransmit());
        buffer.append_for_sending(&[1; 100]);
        for ack in 1..=4 {
            buffer.append_ack(PacketOrdinal::from_raw(ack));
        }
        // 172 bytes plus a header with 4 acks fits exactly
        buffer.append_for_sending(&[2; 172]);

        let sent = send_all(&mut buffer);
        assert_eq!(sent[1].kind, PacketKind::Data);
        assert_eq!(sent[1].acks, vec![1, 2, 3, 4]);
        assert_eq!(sent[1].payload.len(), 172);
    }

    #[test]
    fn test_send_packet_limit() {
        let mut buffer = SendBuffer::new(100, never_retransmit());
        for _ in 0..5 {
            buffer.append_for_sending(&[1; 80]);
        }
        assert_eq!(buffer.len(), 5);

        let mut sent = Vec::new();
        let mut limit = 3;
        let outcome = buffer.send(&mut limit, Duration::ZERO, |p| {
            sent.push(parse(p).ordinal);
            Ok(SocketStatus::Ok(()))
        }).unwrap();
        assert_eq!(limit, 0);
        assert_eq!(sent, vec![1, 2, 3]);
        assert_eq!(outcome.uploaded_bytes, 3 * (92 + 8));
        // the tail was not sent, so no new tail
        assert_eq!(buffer.len(), 5);

        let sent = send_all(&mut buffer);
        assert_eq!(sent.iter().map(|p| p.ordinal).collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(buffer.len(), 6);
    }

    #[rstest]
    #[case::not_ready(SocketStatus::NotReady)]
    #[case::peer_closed(SocketStatus::PeerClosed)]
    fn test_send_socket_not_ok(#[case] status: SocketStatus) {
        let mut buffer = SendBuffer::new(100, never_retransmit());
        buffer.append_for_sending(&[1; 80]);
        buffer.append_for_sending(&[2; 80]);

        let mut num_calls = 0;
        let mut limit = 10;
        let outcome = buffer.send(&mut limit, Duration::ZERO, |_| {
            num_calls += 1;
            Ok(status)
        }).unwrap();
        assert_eq!(outcome, SendOutcome { status, uploaded_bytes: 0 });
        assert_eq!(num_calls, 1);
        assert_eq!(limit, 10);

        // nothing was sent, so the first packet is still due
        let sent = send_all(&mut buffer);
        assert_eq!(sent.iter().map(|p| p.ordinal).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_send_error() {
        let mut buffer = SendBuffer::new(100, never_retransmit());
        let mut limit = 10;
        assert!(buffer.send(&mut limit, Duration::ZERO, |_| Err(anyhow::anyhow!("broken"))).is_err());
    }

    #[test]
    fn test_retransmit_by_cycles() {
        let mut buffer = SendBuffer::new(100, Arc::new(|cycles, _, _| cycles >= 2));
        buffer.append_for_sending(&[1; 10]);

        assert_eq!(send_all(&mut buffer).iter().map(|p| p.ordinal).collect::<Vec<_>>(), vec![1]);
        assert_eq!(send_all(&mut buffer).iter().map(|p| p.ordinal).collect::<Vec<_>>(), vec![2]);
        assert_eq!(send_all(&mut buffer).iter().map(|p| p.ordinal).collect::<Vec<_>>(), vec![3]);
        assert_eq!(send_all(&mut buffer).iter().map(|p| p.ordinal).collect::<Vec<_>>(), vec![1, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmit_by_latency() {
        let mut buffer = SendBuffer::new(100, default_retransmit_predicate());
        buffer.append_for_sending(&[1; 10]);

        let latency = Duration::from_millis(10);
        let send = |buffer: &mut SendBuffer| {
            let mut sent = Vec::new();
            let mut limit = 10;
            buffer.send(&mut limit, latency, |p| {
                sent.push(parse(p).ordinal);
                Ok(SocketStatus::Ok(()))
            }).unwrap();
            sent
        };

        assert_eq!(send(&mut buffer), vec![1]);
        advance(Duration::from_millis(19)).await;
        assert_eq!(send(&mut buffer), vec![2]);
        advance(Duration::from_millis(1)).await;
        assert_eq!(send(&mut buffer), vec![1, 3]);
    }

    #[test]
    fn test_ack_stale_is_ignored() {
        let mut buffer = SendBuffer::new(100, never_retransmit());
        send_all(&mut buffer);
        assert!(buffer.ack_received(PacketOrdinal::FIRST, true).unwrap().is_some());
        assert_eq!(buffer.head_ordinal(), PacketOrdinal::from_raw(2));

        assert_eq!(buffer.ack_received(PacketOrdinal::FIRST, true).unwrap(), None);
        assert_eq!(buffer.ack_received(PacketOrdinal::FIRST, false).unwrap(), None);
    }

    #[rstest]
    #[case::beyond_window(5, true)]
    #[case::beyond_window_weak(5, false)]
    #[case::unsent_tail(2, true)]
    #[case::unsent_tail_weak(2, false)]
    fn test_ack_for_unsent_packet(#[case] ordinal: u32, #[case] is_strong: bool) {
        let mut buffer = SendBuffer::new(100, never_retransmit());
        send_all(&mut buffer);
        assert!(buffer.ack_received(PacketOrdinal::from_raw(ordinal), is_strong).is_err());
    }

    #[test]
    fn test_strong_ack_out_of_order() {
        let mut buffer = SendBuffer::new(100, never_retransmit());
        for _ in 0..3 {
            buffer.append_for_sending(&[1; 80]);
        }
        send_all(&mut buffer);
        assert_eq!(buffer.len(), 4);

        assert!(buffer.ack_received(PacketOrdinal::from_raw(3), true).unwrap().is_some());
        assert!(buffer.ack_received(PacketOrdinal::from_raw(2), true).unwrap().is_some());
        assert_eq!(buffer.head_ordinal(), PacketOrdinal::FIRST);
        assert_eq!(buffer.len(), 4);

        assert!(buffer.ack_received(PacketOrdinal::FIRST, true).unwrap().is_some());
        assert_eq!(buffer.head_ordinal(), PacketOrdinal::from_raw(4));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_strong_ack_idempotent() {
        let mut buffer = SendBuffer::new(100, never_retransmit());
        buffer.append_for_sending(&[1; 80]);
        buffer.append_for_sending(&[1; 80]);
        send_all(&mut buffer);

        assert!(buffer.ack_received(PacketOrdinal::from_raw(2), true).unwrap().is_some());
        assert_eq!(buffer.ack_received(PacketOrdinal::from_raw(2), true).unwrap(), None);
        assert_eq!(buffer.ack_received(PacketOrdinal::from_raw(2), false).unwrap(), None);
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_append_after_ack() {
        let mut buffer = SendBuffer::new(100, never_retransmit());
        send_all(&mut buffer);
        assert!(buffer.ack_received(PacketOrdinal::FIRST, true).unwrap().is_some());
        assert!(buffer.ack_received(PacketOrdinal::from_raw(2), true).is_err());

        buffer.append_for_sending(&[7; 3]);
        let sent = send_all(&mut buffer);
        assert_eq!(sent[0].ordinal, 2);
        assert_eq!(sent[0].payload, vec![7; 3]);
    }

    #[test]
    fn test_weak_ack_suppresses_retransmit() {
        let mut buffer = SendBuffer::new(100, Arc::new(|_, _, _| true));
        buffer.append_for_sending(&[1; 80]);
        buffer.append_for_sending(&[2; 80]);
        send_all(&mut buffer);

        assert_eq!(buffer.ack_received(PacketOrdinal::FIRST, false).unwrap(), None);
        assert_eq!(buffer.head_ordinal(), PacketOrdinal::FIRST);

        let resent = send_all(&mut buffer);
        assert_eq!(resent.iter().map(|p| p.ordinal).collect::<Vec<_>>(), vec![2, 3]);

        // a strong ack after a weak one still retires the packet and yields a latency sample
        assert!(buffer.ack_received(PacketOrdinal::FIRST, true).unwrap().is_some());
        assert_eq!(buffer.head_ordinal(), PacketOrdinal::from_raw(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_to_ack() {
        let mut buffer = SendBuffer::new(100, never_retransmit());
        send_all(&mut buffer);
        advance(Duration::from_millis(30)).await;
        assert_eq!(buffer.ack_received(PacketOrdinal::FIRST, true).unwrap(), Some(Duration::from_millis(30)));
    }

    #[test]
    fn test_export_packets() {
        let mut buffer = SendBuffer::new(100, never_retransmit());
        assert!(exported(&mut buffer).is_empty());

        buffer.append_for_sending(&[1; 80]);
        buffer.append_for_sending(&[2; 150]);

        let packets = exported(&mut buffer);
        assert_eq!(packets.iter().map(|p| (p.kind, p.ordinal, p.payload.len())).collect::<Vec<_>>(), vec![
            (PacketKind::Data, 1, 80),
            (PacketKind::DataMore, 2, 88),
            (PacketKind::DataTail, 3, 62),
        ]);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.head_ordinal(), PacketOrdinal::from_raw(4));

        buffer.append_for_sending(&[3; 5]);
        let packets = exported(&mut buffer);
        assert_eq!(packets.iter().map(|p| (p.kind, p.ordinal, p.payload.len())).collect::<Vec<_>>(), vec![
            (PacketKind::Data, 4, 5),
        ]);
        assert_eq!(buffer.head_ordinal(), PacketOrdinal::from_raw(5));
    }

    #[test]
    fn test_reset() {
        let mut buffer = SendBuffer::new(100, never_retransmit());
        buffer.append_for_sending(&[1; 80]);
        buffer.append_ack(PacketOrdinal::from_raw(9));
        send_all(&mut buffer);

        buffer.reset();
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.head_ordinal(), PacketOrdinal::FIRST);

        let sent = send_all(&mut buffer);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].ordinal, 1);
        assert!(sent[0].acks.is_empty());
    }
}

use std::collections::VecDeque;
use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;
use crate::packet_kind::PacketKind;
use crate::packet_ordinal::PacketOrdinal;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ReceiveTag {
    WaitingForData,
    Fragment,
    FragmentTail,
    ReadyForUnpacking,
    Unpacked,
}

struct TaggedPacket {
    payload: Bytes,
    tag: ReceiveTag,
}

impl TaggedPacket {
    fn waiting() -> TaggedPacket {
        TaggedPacket {
            payload: Bytes::new(),
            tag: ReceiveTag::WaitingForData,
        }
    }
}

/// The inbound half of a connection: a window of received data packets indexed by
///  `ordinal - head_ordinal`, which yields complete messages strictly in ordinal order.
///
/// Entries below the head were delivered already, so packets for them are duplicates. Slots
///  that were not received yet are `WaitingForData`, and nothing at or behind such a gap is
///  delivered.
pub struct ReceiveBuffer {
    packets: VecDeque<TaggedPacket>,
    head_ordinal: PacketOrdinal,
}

impl Default for ReceiveBuffer {
    fn default() -> Self {
        ReceiveBuffer {
            packets: VecDeque::new(),
            head_ordinal: PacketOrdinal::FIRST,
        }
    }
}

impl ReceiveBuffer {
    pub fn reset(&mut self) {
        self.packets.clear();
        self.head_ordinal = PacketOrdinal::FIRST;
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn head_ordinal(&self) -> PacketOrdinal {
        self.head_ordinal
    }

    /// Stores a data packet. `packet` starts with the zero-terminated ack list, i.e. kind and
    ///  ordinal were consumed by the caller.
    ///
    /// The window grows on demand. If `max_window_len` is given, a packet that would grow it
    ///  beyond that is rejected.
    ///
    /// Returns the acks the peer piggy-backed on the packet. Duplicates are ignored and yield no
    ///  acks.
    pub fn store_data_packet(&mut self, mut packet: Bytes, ordinal: PacketOrdinal, kind: PacketKind, max_window_len: Option<usize>) -> anyhow::Result<Vec<PacketOrdinal>> {
        let tag = match kind {
            PacketKind::Data => ReceiveTag::ReadyForUnpacking,
            PacketKind::DataMore => ReceiveTag::Fragment,
            PacketKind::DataTail => ReceiveTag::FragmentTail,
            _ => bail!("packet kind {:?} does not carry data", kind),
        };

        let Some(idx) = ordinal.index_from(self.head_ordinal) else {
            trace!("dropping stale packet {}", ordinal);
            return Ok(vec![]);
        };
        if max_window_len.is_some_and(|max| idx >= max) {
            bail!("packet {} is too far ahead of the receive window starting at {}", ordinal, self.head_ordinal);
        }

        if idx >= self.packets.len() {
            self.packets.resize_with(idx + 1, TaggedPacket::waiting);
        }
        else if self.packets[idx].tag != ReceiveTag::WaitingForData {
            trace!("dropping duplicate packet {}", ordinal);
            return Ok(vec![]);
        }

        let mut acks = Vec::new();
        while packet.has_remaining() {
            let ack = PacketOrdinal::deser(&mut packet)?;
            if ack == PacketOrdinal::TERMINATOR {
                break;
            }
            acks.push(ack);
        }

        self.packets[idx] = TaggedPacket {
            payload: packet,
            tag,
        };
        Ok(acks)
    }

    /// Returns the next complete message if it is available
    pub fn take_next_ready(&mut self) -> anyhow::Result<Option<Bytes>> {
        loop {
            match self.packets.front().map(|p| p.tag) {
                None | Some(ReceiveTag::WaitingForData) => return Ok(None),
                Some(ReceiveTag::Fragment) | Some(ReceiveTag::ReadyForUnpacking) => break,
                Some(ReceiveTag::FragmentTail) => bail!("unexpected fragment tail at the head of the receive buffer ({})", self.head_ordinal),
                Some(ReceiveTag::Unpacked) => self.pop_head(),
            }
        }

        self.try_assemble_fragments_at_head()?;

        match self.packets.front() {
            Some(p) if p.tag == ReceiveTag::ReadyForUnpacking => {}
            _ => return Ok(None),
        }

        trace!("packet {} taken for handling", self.head_ordinal);
        let payload = std::mem::take(&mut self.packets[0].payload);
        self.pop_head();
        Ok(Some(payload))
    }

    fn pop_head(&mut self) {
        self.packets.pop_front();
        self.head_ordinal = self.head_ordinal + 1;
    }

    fn try_assemble_fragments_at_head(&mut self) -> anyhow::Result<()> {
        if self.packets.front().map(|p| p.tag) != Some(ReceiveTag::Fragment) {
            return Ok(());
        }

        let mut tail_idx = None;
        for (idx, p) in self.packets.iter().enumerate().skip(1) {
            match p.tag {
                ReceiveTag::WaitingForData => return Ok(()),
                ReceiveTag::Fragment => {}
                ReceiveTag::FragmentTail => {
                    tail_idx = Some(idx);
                    break;
                }
                ReceiveTag::ReadyForUnpacking | ReceiveTag::Unpacked => {
                    bail!("packet {} interrupts the fragmented message starting at {}", self.head_ordinal + idx, self.head_ordinal);
                }
            }
        }
        let Some(tail_idx) = tail_idx else {
            return Ok(());
        };

        let total_len = self.packets.iter()
            .take(tail_idx + 1)
            .map(|p| p.payload.len())
            .sum();
        let mut assembled = BytesMut::with_capacity(total_len);
        for p in self.packets.iter_mut().take(tail_idx + 1) {
            assembled.put(std::mem::take(&mut p.payload));
            p.tag = ReceiveTag::Unpacked;
        }

        trace!("assembled message of {} bytes from packets {} to {}", total_len, self.head_ordinal, self.head_ordinal + tail_idx);
        self.packets[0] = TaggedPacket {
            payload: assembled.freeze(),
            tag: ReceiveTag::ReadyForUnpacking,
        };
        Ok(())
    }
}

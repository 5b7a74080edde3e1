use std::fmt::{Display, Formatter};
use std::ops::Add;
use bytes::{Buf, BufMut};

/// Per-direction sequence number of a data packet. Ordinals start at 1 for every session,
///  0 terminates ack lists on the wire and never names a packet.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PacketOrdinal(u32);

impl Display for PacketOrdinal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PacketOrdinal {
    pub const TERMINATOR: PacketOrdinal = PacketOrdinal(0);
    pub const FIRST: PacketOrdinal = PacketOrdinal(1);

    pub const SERIALIZED_LEN: usize = size_of::<u32>();

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    /// The position of this ordinal in a window starting at `head`, or `None` if it is below
    ///  the window
    pub fn index_from(&self, head: PacketOrdinal) -> Option<usize> {
        self.0.checked_sub(head.0).map(|d| d as usize)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.0);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketOrdinal> {
        Ok(PacketOrdinal(buf.try_get_u32()?))
    }
}

impl Add<usize> for PacketOrdinal {
    type Output = PacketOrdinal;

    fn add(self, rhs: usize) -> PacketOrdinal {
        let rhs = u32::try_from(rhs)
            .expect("this is a bug: packet windows are far smaller than the ordinal range");
        PacketOrdinal(
            self.0.checked_add(rhs)
                .expect("packet ordinal overflow - a session can not carry 2^32 packets")
        )
    }
}

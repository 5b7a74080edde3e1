use anyhow::anyhow;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The leading four bytes of every packet. The values are arbitrary but fixed, so that stray
///  datagrams are unlikely to be mistaken for RigelNet traffic.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum PacketKind {
    Hello = 0x3BF0_E110,
    Connect = 0x83C9_6CA4,
    Disconnect = 0xD0F2_35AB,
    Data = 0xA765_B8F6,
    DataMore = 0x782A_2A78,
    DataTail = 0x00DA_7A11,
    Acks = 0x71AC_2519,
}

impl PacketKind {
    pub const SERIALIZED_LEN: usize = size_of::<u32>();

    pub fn ser(self, buf: &mut impl BufMut) {
        buf.put_u32(self.into());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketKind> {
        let raw = buf.try_get_u32()?;
        PacketKind::try_from(raw)
            .map_err(|_| anyhow!("unknown packet kind {:#010x}", raw))
    }
}

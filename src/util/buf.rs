use bytes::{Buf, BufMut};
use anyhow::bail;

/// Strings go on the wire as a `u32` length (network byte order) followed by UTF-8 bytes.
///
/// NB: strings are bounded by the maximum packet size long before the `u32` range matters
pub fn put_string(buf: &mut impl BufMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = buf.try_get_u32()? as usize;
    if buf.remaining() < len {
        bail!("string length {} exceeds remaining buffer of {} bytes", len, buf.remaining());
    }

    let raw = buf.copy_to_bytes(len);
    let s = String::from_utf8(raw.to_vec())?;
    Ok(s)
}

pub fn string_ser_len(s: &str) -> usize {
    size_of::<u32>() + s.len()
}

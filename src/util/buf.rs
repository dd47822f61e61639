use std::mem::size_of;
use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

//NB: free functions rather than an extension trait - recent versions of `bytes` have their own
//     `try_get_*` methods on `Buf`, and a trait with the same method names would be ambiguous

pub fn try_get_u8(buf: &mut impl Buf) -> anyhow::Result<u8> {
    if buf.remaining() < size_of::<u8>() {
        bail!("buffer underflow reading u8");
    }
    Ok(buf.get_u8())
}

pub fn try_get_u32_le(buf: &mut impl Buf) -> anyhow::Result<u32> {
    if buf.remaining() < size_of::<u32>() {
        bail!("buffer underflow reading u32: {} bytes remaining", buf.remaining());
    }
    Ok(buf.get_u32_le())
}

/// writes a varint length prefix followed by the raw bytes
pub fn put_bytes(buf: &mut impl BufMut, bytes: &[u8]) {
    buf.put_u64_varint(bytes.len() as u64);
    buf.put_slice(bytes);
}

pub fn try_get_bytes(buf: &mut impl Buf) -> anyhow::Result<Bytes> {
    let len = buf.get_u64_varint()
        .map_err(|e| anyhow!("invalid length prefix: {:?}", e))?;
    let len = usize::try_from(len)?;
    if buf.remaining() < len {
        bail!("length prefix {} exceeds remaining buffer of {} bytes", len, buf.remaining());
    }
    Ok(buf.copy_to_bytes(len))
}

use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
#[cfg(test)] use mockall::automock;

use crate::protocol::{Request, Response, ResponseKind};
use crate::util::buf::{put_bytes, try_get_bytes, try_get_u32_le, try_get_u8};


/// Encoding and decoding of message bodies, i.e. of what goes *inside* a frame. The client treats
///  this as an opaque step, so deployments can plug in a different schema without touching
///  connection handling.
#[cfg_attr(test, automock)]
pub trait MessageCodec: Send + Sync + 'static {
    fn encode(&self, request: &Request, buf: &mut BytesMut) -> anyhow::Result<()>;

    fn decode(&self, buf: &[u8]) -> anyhow::Result<Response>;
}

/// The default body layout, all numbers little endian:
///
/// ```ascii
/// request:  id (u32) | payload length (varint) | payload
/// response: request id (u32) | kind (u8) | payload length (varint) | payload
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryCodec;

impl BinaryCodec {
    pub fn encode_response(response: &Response, buf: &mut impl BufMut) {
        buf.put_u32_le(response.request_id);
        buf.put_u8(response.kind.tag());
        put_bytes(buf, &response.payload);
    }

    pub fn decode_request(mut buf: &[u8]) -> anyhow::Result<Request> {
        let id = try_get_u32_le(&mut buf)?;
        let payload = try_get_bytes(&mut buf)?;
        if buf.has_remaining() {
            bail!("{} trailing bytes after request body", buf.remaining());
        }
        Ok(Request { id, payload })
    }
}

impl MessageCodec for BinaryCodec {
    fn encode(&self, request: &Request, buf: &mut BytesMut) -> anyhow::Result<()> {
        buf.put_u32_le(request.id);
        put_bytes(buf, &request.payload);
        Ok(())
    }

    fn decode(&self, mut buf: &[u8]) -> anyhow::Result<Response> {
        let request_id = try_get_u32_le(&mut buf)?;
        let kind = ResponseKind::from(try_get_u8(&mut buf)?);
        let payload = try_get_bytes(&mut buf)?;
        if buf.has_remaining() {
            bail!("{} trailing bytes after response body", buf.remaining());
        }
        Ok(Response {
            request_id,
            kind,
            payload,
        })
    }
}

//! Request frame encoding

use super::message::Request;
use bytes::{BufMut, BytesMut};

/// Encode a request into a complete length-prefixed frame.
///
/// Layout: `i32` length (big-endian, excluding itself), request header
/// (API key `i16`, API version `i16`, correlation id `i32`, nullable
/// client-id string), then the opaque body.
pub fn encode_request(request: &Request, correlation_id: i32, client_id: Option<&str>) -> BytesMut {
    let mut buf = BytesMut::with_capacity(
        4 + 8 + 2 + client_id.map_or(0, str::len) + request.body.len(),
    );

    // Reserve space for the length (filled at the end)
    let len_pos = buf.len();
    buf.put_i32(0);

    buf.put_i16(request.api_key);
    buf.put_i16(request.api_version);
    buf.put_i32(correlation_id);
    put_nullable_string(&mut buf, client_id);
    buf.put_slice(&request.body);

    let len = buf.len() - len_pos - 4;
    buf[len_pos..len_pos + 4].copy_from_slice(&(len as i32).to_be_bytes());

    buf
}

/// Length-prefixed string; `-1` length encodes null
fn put_nullable_string(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        Some(s) => {
            buf.put_i16(s.len() as i16);
            buf.put_slice(s.as_bytes());
        }
        None => buf.put_i16(-1),
    }
}

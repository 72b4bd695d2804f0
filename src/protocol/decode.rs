//! Frame and response decoding

use super::constants::LENGTH_PREFIX_SIZE;
use super::message::Response;
use crate::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};

/// Maximum frame length (100 MB), matching the broker default
/// `socket.request.max.bytes`.
///
/// Any frame whose length prefix exceeds this value is rejected before
/// allocation to prevent denial-of-service via crafted length headers.
pub const MAX_FRAME_LENGTH: usize = 104_857_600;

/// Try to extract one complete length-prefixed frame from the buffer.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame;
/// the caller keeps accumulating bytes across partial reads and retries.
/// On success the prefix and payload are consumed from the buffer.
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Bytes>> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let len = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len < 0 {
        return Err(Error::Protocol(format!("negative frame length {len}")));
    }
    let len = len as usize;
    if len > MAX_FRAME_LENGTH {
        return Err(Error::Protocol(format!(
            "frame length {len} exceeds maximum allowed {MAX_FRAME_LENGTH}"
        )));
    }

    if buf.len() < LENGTH_PREFIX_SIZE + len {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    Ok(Some(buf.split_to(len).freeze()))
}

/// Decode the response envelope header from a frame payload.
///
/// The payload begins with the `i32` correlation id; the rest is the opaque
/// response body.
pub fn decode_response(mut frame: Bytes) -> Result<Response> {
    if frame.len() < 4 {
        return Err(Error::Protocol(format!(
            "response frame of {} bytes is shorter than the correlation id",
            frame.len()
        )));
    }
    let correlation_id = frame.get_i32();
    Ok(Response {
        correlation_id,
        body: frame,
    })
}

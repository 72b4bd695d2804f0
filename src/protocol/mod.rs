//! Length-prefixed request/response framing
//!
//! Every request and response on the wire is an `i32` big-endian length
//! (excluding itself) followed by that many payload bytes. Payloads begin
//! with a correlation id matching responses to their originating requests;
//! everything above the envelope is an opaque codec concern.

pub mod constants;
pub mod decode;
pub mod encode;
pub mod message;

pub use decode::{decode_response, try_decode_frame, MAX_FRAME_LENGTH};
pub use encode::encode_request;
pub use message::{Request, Response};

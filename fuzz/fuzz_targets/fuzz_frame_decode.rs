#![no_main]

use bytes::BytesMut;
use kafka_conn::protocol::{decode_response, try_decode_frame};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut buf = BytesMut::from(data);
    // Drain every complete frame; errors and incomplete tails are fine, the
    // decoder must just never panic or over-allocate
    while let Ok(Some(frame)) = try_decode_frame(&mut buf) {
        let _ = decode_response(frame);
    }
});

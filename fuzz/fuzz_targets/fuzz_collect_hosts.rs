#![no_main]

use kafka_conn::collect_hosts;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    let _ = collect_hosts(data, 9092, false);
});

//! Connect to a broker, send an ApiVersions request, print the raw response.
//!
//! Usage: `cargo run --example poll_loop -- localhost:9092`

use std::time::{Duration, Instant};

use bytes::Bytes;
use kafka_conn::protocol::constants::api_keys;
use kafka_conn::{collect_hosts, BrokerConnection, ConnectionConfig, Request, DEFAULT_PORT};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let spec = std::env::args().nth(1).unwrap_or_else(|| "localhost".to_string());
    let brokers = collect_hosts(&spec, DEFAULT_PORT, true)?;
    let broker = brokers
        .into_iter()
        .next()
        .ok_or("no brokers in host specification")?;

    let config = ConnectionConfig::builder().client_id("poll-loop-demo").build();
    println!("connecting to {}:{}", broker.host, broker.port);
    let mut conn = BrokerConnection::from_broker_addr(broker, config);

    let deadline = Instant::now() + Duration::from_secs(10);
    while !conn.connected() {
        conn.connect();
        if Instant::now() > deadline {
            return Err(format!("gave up connecting: {conn:?}").into());
        }
        std::thread::sleep(conn.connection_delay().min(Duration::from_millis(10)));
    }
    println!("connected");

    let future = conn.send(Request::new(api_keys::API_VERSIONS, 0, Bytes::new()));
    while !future.is_done() {
        conn.recv();
        if Instant::now() > deadline {
            return Err("timed out waiting for the response".into());
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    match future.take().expect("future is done") {
        Ok(Some(response)) => {
            println!(
                "ApiVersions response: correlation id {}, {} body bytes",
                response.correlation_id,
                response.body.len()
            );
        }
        Ok(None) => println!("request was fire-and-forget"),
        Err(e) => return Err(e.into()),
    }

    conn.close(None);
    Ok(())
}

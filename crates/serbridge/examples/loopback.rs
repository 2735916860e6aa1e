//! Loopback demo: everything written comes back through the inbound ring.
//!
//! This example shows:
//! - Opening a session (reset pulse, worker start, init handshake)
//! - Writing more than one ring's worth of bytes
//! - Short reads, spillover and the "no data" result
//!
//! Run with: `cargo run --example loopback -p serbridge`

use std::time::Duration;

use serbridge::{BridgeConfig, PortSession, RingConfig, SessionError};
use serbridge_testkit::MockTransport;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("serbridge=debug")),
        )
        .init();

    let device = MockTransport::loopback();
    let config = BridgeConfig::default()
        .with_ring(RingConfig::new(256, 3))
        .with_poll_interval(Duration::from_millis(2));
    let mut session = PortSession::new(device.clone(), config)?;

    session.open(115_200).await?;
    println!("open: state={} baud={:?}", session.state(), session.baud_rate());

    let message: Vec<u8> = b"the quick brown fox jumps over the lazy dog. "
        .iter()
        .copied()
        .cycle()
        .take(1000)
        .collect();
    // Interleave writes and reads so the inbound ring never fills up.
    let mut echoed = Vec::new();
    let mut buf = [0u8; 64];
    for chunk in message.chunks(100) {
        session.write(chunk).await?;
        let target = echoed.len() + chunk.len();
        while echoed.len() < target {
            match session.recv(&mut buf, Duration::from_millis(200)).await {
                Ok(n) => echoed.extend_from_slice(&buf[..n]),
                Err(SessionError::NoData) => break,
                Err(e) => return Err(e.into()),
            }
        }
    }
    println!("echoed {} of {} bytes, intact: {}", echoed.len(), message.len(), echoed == message);

    match session.recv(&mut buf, Duration::from_millis(50)).await {
        Err(SessionError::NoData) => println!("idle line: no data"),
        other => println!("unexpected: {:?}", other),
    }

    println!("stats: {:?}", session.stats());
    session.close().await?;
    println!("closed: device open = {}", device.is_open());
    Ok(())
}

//! serbridge-testkit: scripted devices and shared session scenarios.
//!
//! Provides a [`MockTransport`] plus scenario functions that every
//! [`HostTransport`] implementation can run through a [`ProviderFactory`].
//!
//! # Usage
//!
//! ```ignore
//! use serbridge_testkit::{ProviderFactory, TestError};
//!
//! struct MyFactory;
//!
//! impl ProviderFactory for MyFactory {
//!     type Provider = MyTransport;
//!
//!     fn loopback() -> Result<Self::Provider, TestError> {
//!         /* a device whose writes come back as reads */
//!     }
//! }
//!
//! #[tokio::test]
//! async fn my_transport_round_trip() {
//!     serbridge_testkit::run_round_trip_wraparound::<MyFactory>().await;
//! }
//! ```

use std::time::{Duration, Instant};

use serbridge::{
    BridgeConfig, HostTransport, PortSession, RingConfig, SessionError, SessionState,
};

mod mock;

pub use mock::{DeviceEvent, DeviceOp, MockDevice, MockTransport};

/// Error type for test scenarios.
#[derive(Debug)]
pub enum TestError {
    /// Provider or session creation failed.
    Setup(String),
    /// A session operation failed.
    Session(SessionError),
    /// Assertion failed.
    Assertion(String),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Setup(msg) => write!(f, "setup error: {}", msg),
            TestError::Session(e) => write!(f, "session error: {}", e),
            TestError::Assertion(msg) => write!(f, "assertion failed: {}", msg),
        }
    }
}

impl std::error::Error for TestError {}

impl From<SessionError> for TestError {
    fn from(e: SessionError) -> Self {
        TestError::Session(e)
    }
}

/// Factory for providers under test.
pub trait ProviderFactory: Send + Sync + 'static {
    type Provider: HostTransport;

    /// A provider whose device echoes every written byte back.
    fn loopback() -> Result<Self::Provider, TestError>;

    /// Session configuration used by the scenarios.
    fn config() -> BridgeConfig {
        BridgeConfig::default()
            .with_reset_settle(Duration::from_millis(10))
            .with_poll_interval(Duration::from_millis(2))
            .with_ack_timeout(Duration::from_secs(2))
    }
}

/// Mock-backed factory.
pub struct MockFactory;

impl ProviderFactory for MockFactory {
    type Provider = MockTransport;

    fn loopback() -> Result<MockTransport, TestError> {
        Ok(MockTransport::loopback())
    }
}

/// Install a test-friendly tracing subscriber (once per process).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn ensure(cond: bool, msg: impl FnOnce() -> String) -> Result<(), TestError> {
    if cond {
        Ok(())
    } else {
        Err(TestError::Assertion(msg()))
    }
}

async fn open_session<F: ProviderFactory>(
    config: BridgeConfig,
    baud_rate: u32,
) -> Result<PortSession<F::Provider>, TestError> {
    let provider = F::loopback()?;
    let mut session =
        PortSession::new(provider, config).map_err(|e| TestError::Setup(e.to_string()))?;
    session.open(baud_rate).await?;
    Ok(session)
}

/// Read exactly `len` bytes, allowing short reads along the way.
async fn read_exact<P: HostTransport>(
    session: &mut PortSession<P>,
    len: usize,
    timeout: Duration,
) -> Result<Vec<u8>, TestError> {
    let mut out = vec![0u8; len];
    let mut filled = 0;
    let deadline = Instant::now() + timeout;
    while filled < len {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TestError::Assertion(format!(
                "only {} of {} bytes arrived",
                filled, len
            )));
        }
        match session.recv(&mut out[filled..], remaining).await {
            Ok(n) => filled += n,
            Err(SessionError::NoData) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(out)
}

// ============================================================================
// Scenarios
// ============================================================================

/// Stream more than a ring's worth of bytes through a small ring and read
/// them back in order.
pub async fn run_round_trip_wraparound<F: ProviderFactory>() {
    if let Err(e) = run_round_trip_wraparound_inner::<F>().await {
        panic!("run_round_trip_wraparound failed: {}", e);
    }
}

async fn run_round_trip_wraparound_inner<F: ProviderFactory>() -> Result<(), TestError> {
    let ring = RingConfig::new(64, 3);
    let mut session = open_session::<F>(F::config().with_ring(ring), 115_200).await?;

    let total = 1000;
    let data: Vec<u8> = (0..total).map(|i| (i * 7 % 256) as u8).collect();
    let mut received = Vec::with_capacity(total);

    for chunk in data.chunks(40) {
        session.write(chunk).await?;
        received.extend(read_exact(&mut session, chunk.len(), Duration::from_secs(2)).await?);
    }

    ensure(received == data, || "bytes read differ from bytes written".into())?;
    ensure(total > ring.payload_len(), || "stream did not wrap".into())?;

    let stats = session.stats();
    ensure(stats.bytes_out == total as u64, || {
        format!("worker wrote {} bytes, expected {}", stats.bytes_out, total)
    })?;
    ensure(stats.dropped == 0, || format!("{} bytes dropped", stats.dropped))?;

    session.close().await?;
    Ok(())
}

/// Over-read bytes stay queued for the next call, in order.
pub async fn run_spillover_fifo<F: ProviderFactory>() {
    if let Err(e) = run_spillover_fifo_inner::<F>().await {
        panic!("run_spillover_fifo failed: {}", e);
    }
}

async fn run_spillover_fifo_inner<F: ProviderFactory>() -> Result<(), TestError> {
    let mut session = open_session::<F>(F::config(), 115_200).await?;

    let data: Vec<u8> = (0..30).collect();
    session.write(&data).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut first = [0u8; 10];
    let n = session.recv(&mut first, Duration::from_secs(1)).await?;
    ensure(n == 10, || format!("first recv returned {}", n))?;
    ensure(session.buffered() == 20, || {
        format!("{} bytes held after first recv", session.buffered())
    })?;

    // The remaining 20 bytes were drained together with the first 10.
    let mut second = [0u8; 10];
    let n = session.recv(&mut second, Duration::ZERO).await?;
    ensure(n == 10, || format!("second recv returned {}", n))?;

    let mut third = [0u8; 10];
    let n = session.recv(&mut third, Duration::ZERO).await?;
    ensure(n == 10, || format!("third recv returned {}", n))?;

    let joined: Vec<u8> = [first, second, third].concat();
    ensure(joined == data, || format!("out of order: {:?}", joined))?;

    session.close().await?;
    Ok(())
}

/// A read for more than arrives returns what arrived, on time.
pub async fn run_partial_timeout<F: ProviderFactory>() {
    if let Err(e) = run_partial_timeout_inner::<F>().await {
        panic!("run_partial_timeout failed: {}", e);
    }
}

async fn run_partial_timeout_inner<F: ProviderFactory>() -> Result<(), TestError> {
    let config = F::config();
    let slack = config.poll_interval + Duration::from_millis(100);
    let mut session = open_session::<F>(config, 115_200).await?;

    session.write(&[0x42; 40]).await?;
    tokio::time::sleep(Duration::from_millis(30)).await;

    let mut buf = [0u8; 100];
    let timeout = Duration::from_millis(50);
    let start = Instant::now();
    let n = session.recv(&mut buf, timeout).await?;
    let elapsed = start.elapsed();

    ensure(n == 40, || format!("expected 40 bytes, got {}", n))?;
    ensure(buf[..40].iter().all(|&b| b == 0x42), || "fabricated data".into())?;
    ensure(elapsed >= timeout, || format!("returned early after {:?}", elapsed))?;
    ensure(elapsed <= timeout + slack, || format!("overran deadline: {:?}", elapsed))?;

    match session.recv(&mut buf, timeout).await {
        Err(SessionError::NoData) => {}
        other => {
            return Err(TestError::Assertion(format!(
                "expected no data, got {:?}",
                other
            )))
        }
    }

    session.close().await?;
    Ok(())
}

/// Closing a closed session is a no-op.
pub async fn run_idempotent_close<F: ProviderFactory>() {
    if let Err(e) = run_idempotent_close_inner::<F>().await {
        panic!("run_idempotent_close failed: {}", e);
    }
}

async fn run_idempotent_close_inner<F: ProviderFactory>() -> Result<(), TestError> {
    let provider = F::loopback()?;
    let mut session =
        PortSession::new(provider, F::config()).map_err(|e| TestError::Setup(e.to_string()))?;

    session.close().await?;
    session.open(9600).await?;
    ensure(session.is_open(), || "session not open".into())?;

    session.close().await?;
    session.close().await?;
    ensure(session.state() == SessionState::Closed, || {
        format!("state is {}", session.state())
    })?;
    ensure(!session.is_open(), || "device still open after close".into())?;

    let mut buf = [0u8; 4];
    match session.recv(&mut buf, Duration::from_millis(10)).await {
        Err(SessionError::NotOpen) => Ok(()),
        other => Err(TestError::Assertion(format!(
            "recv on closed session returned {:?}",
            other
        ))),
    }
}

/// `drain` throws away bytes that arrived before it.
pub async fn run_drain_discards_stale<F: ProviderFactory>() {
    if let Err(e) = run_drain_discards_stale_inner::<F>().await {
        panic!("run_drain_discards_stale failed: {}", e);
    }
}

async fn run_drain_discards_stale_inner<F: ProviderFactory>() -> Result<(), TestError> {
    let mut session = open_session::<F>(F::config(), 115_200).await?;

    session.write(b"stale-stale").await?;
    tokio::time::sleep(Duration::from_millis(30)).await;
    // Leave part of it in the spillover too.
    let mut one = [0u8; 1];
    session.recv(&mut one, Duration::from_millis(100)).await?;

    session.drain(Duration::from_millis(20)).await?;

    session.write(b"fresh").await?;
    let got = read_exact(&mut session, 5, Duration::from_secs(1)).await?;
    ensure(got == b"fresh", || {
        format!("expected fresh bytes, got {:?}", String::from_utf8_lossy(&got))
    })?;

    session.close().await?;
    Ok(())
}

/// Reopening at a new baud rate gives a working session.
pub async fn run_reopen<F: ProviderFactory>() {
    if let Err(e) = run_reopen_inner::<F>().await {
        panic!("run_reopen failed: {}", e);
    }
}

async fn run_reopen_inner<F: ProviderFactory>() -> Result<(), TestError> {
    let mut session = open_session::<F>(F::config(), 9600).await?;
    session.write(b"one").await?;
    ensure(read_exact(&mut session, 3, Duration::from_secs(1)).await? == b"one", || {
        "first session echo mismatch".into()
    })?;

    // Open on an open session closes it first.
    session.open(115_200).await?;
    ensure(session.baud_rate() == Some(115_200), || {
        format!("baud is {:?}", session.baud_rate())
    })?;

    session.write(b"two").await?;
    ensure(read_exact(&mut session, 3, Duration::from_secs(1)).await? == b"two", || {
        "second session echo mismatch".into()
    })?;

    session.close().await?;
    session.open(57_600).await?;
    ensure(session.state() == SessionState::Open, || "reopen after close failed".into())?;
    session.close().await?;
    Ok(())
}

/// The reset pulse runs before every open, at any baud rate.
///
/// Mock-specific: checks the recorded device operations.
pub async fn run_reset_sequence(baud_rate: u32) {
    if let Err(e) = run_reset_sequence_inner(baud_rate).await {
        panic!("run_reset_sequence({}) failed: {}", baud_rate, e);
    }
}

async fn run_reset_sequence_inner(baud_rate: u32) -> Result<(), TestError> {
    use serbridge::ControlLines;

    let mock = MockTransport::new();
    let config = MockFactory::config().with_reset_settle(Duration::from_millis(100));
    let mut session = PortSession::new(mock.clone(), config)
        .map_err(|e| TestError::Setup(e.to_string()))?;

    session.open(baud_rate).await?;
    let events = mock.events();
    let ops: Vec<DeviceOp> = events.iter().map(|e| e.op.clone()).collect();

    let expected = [
        DeviceOp::Acquire,
        DeviceOp::Open { baud_rate },
        DeviceOp::Close,
        DeviceOp::Open { baud_rate: 1200 },
        DeviceOp::ControlLines(ControlLines::dtr(false)),
        DeviceOp::ControlLines(ControlLines::dtr(true)),
        DeviceOp::Close,
        DeviceOp::Open { baud_rate },
    ];
    ensure(ops.len() >= expected.len() && ops[..expected.len()] == expected, || {
        format!("unexpected device sequence: {:?}", ops)
    })?;

    let settle = events[5].at.duration_since(events[4].at);
    ensure(settle >= Duration::from_millis(100), || {
        format!("DTR held low for only {:?}", settle)
    })?;
    ensure(mock.baud_rate() == Some(baud_rate), || {
        format!("device left at {:?}", mock.baud_rate())
    })?;

    session.close().await?;
    Ok(())
}

//! Bridge configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ring::{LayoutError, RingConfig};

/// What the session does after the worker reports an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerErrorPolicy {
    /// Return a [`SessionError`](crate::SessionError) and leave the session
    /// `Closed`.
    #[default]
    Surface,
    /// Terminate the process with the given exit code.
    Exit(i32),
}

/// Tunables for one [`PortSession`](crate::PortSession).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Geometry shared by the outbound and inbound channels.
    pub ring: RingConfig,
    /// Baud rate used during the reset pulse.
    pub reset_baud_rate: u32,
    /// How long DTR stays deasserted during the reset pulse.
    #[serde(with = "duration_ms")]
    pub reset_settle: Duration,
    /// Worker read timeout per iteration.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Largest chunk the worker moves per read/write call.
    pub io_chunk: usize,
    /// How long to wait for the worker to answer a control request.
    #[serde(with = "duration_ms")]
    pub ack_timeout: Duration,
    /// How long a write may wait for space in the outbound channel.
    #[serde(with = "duration_ms")]
    pub write_timeout: Duration,
    /// Buffer size hint passed to the provider on open.
    pub port_buffer_size: usize,
    pub worker_error_policy: WorkerErrorPolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            ring: RingConfig::default(),
            reset_baud_rate: 1200,
            reset_settle: Duration::from_millis(100),
            poll_interval: Duration::from_millis(5),
            io_chunk: 256,
            ack_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(1),
            port_buffer_size: 2048,
            worker_error_policy: WorkerErrorPolicy::Surface,
        }
    }
}

impl BridgeConfig {
    pub fn with_ring(mut self, ring: RingConfig) -> Self {
        self.ring = ring;
        self
    }

    pub fn with_reset_settle(mut self, settle: Duration) -> Self {
        self.reset_settle = settle;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_io_chunk(mut self, io_chunk: usize) -> Self {
        self.io_chunk = io_chunk;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_worker_error_policy(mut self, policy: WorkerErrorPolicy) -> Self {
        self.worker_error_policy = policy;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ring.validate()?;
        if self.io_chunk == 0 {
            return Err(ConfigError::ZeroIoChunk);
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroPollInterval);
        }
        if self.reset_baud_rate == 0 {
            return Err(ConfigError::ZeroResetBaud);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid ring layout: {0}")]
    Layout(#[from] LayoutError),

    #[error("io_chunk must be greater than zero")]
    ZeroIoChunk,

    #[error("poll_interval must be greater than zero")]
    ZeroPollInterval,

    #[error("reset_baud_rate must be greater than zero")]
    ZeroResetBaud,
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

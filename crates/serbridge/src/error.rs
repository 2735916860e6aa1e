//! Caller-facing error type.

use std::time::Duration;

use crate::config::ConfigError;
use crate::ring::{LayoutError, RingError};
use crate::transport::TransportError;

/// Errors returned by [`PortSession`](crate::PortSession) operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The provider could not hand out a device.
    #[error("device acquisition failed: {0}")]
    DeviceAcquisition(#[source] TransportError),

    /// A provider call made from the foreground failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The worker answered a control request with an error.
    #[error("worker rejected {request}: {message}")]
    Worker {
        request: &'static str,
        message: String,
    },

    #[error("worker did not acknowledge {request} within {timeout:?}")]
    AckTimeout {
        request: &'static str,
        timeout: Duration,
    },

    /// The worker thread is gone (panicked or already shut down).
    #[error("worker is not running")]
    WorkerGone,

    #[error("failed to start worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    #[error("session is not open")]
    NotOpen,

    /// A receive timed out without collecting a single byte.
    #[error("no data")]
    NoData,

    #[error(transparent)]
    Overflow(#[from] RingError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("doorbell error: {0}")]
    Doorbell(#[source] std::io::Error),
}

impl From<LayoutError> for SessionError {
    fn from(e: LayoutError) -> Self {
        SessionError::Config(ConfigError::Layout(e))
    }
}

impl SessionError {
    /// True for errors after which the session has been torn down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::Worker { .. }
                | SessionError::AckTimeout { .. }
                | SessionError::WorkerGone
                | SessionError::WorkerSpawn(_)
        )
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

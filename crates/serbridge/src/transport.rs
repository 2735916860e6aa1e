//! Host Transport Provider interface.
//!
//! A provider owns the physical (or virtual) serial device. The session uses
//! it from the foreground for lifecycle and control-line calls; the worker
//! thread is the only caller of [`HostTransport::read_chunk`] and
//! [`HostTransport::write_chunk`].

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings passed to [`HostTransport::open_device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortOptions {
    pub baud_rate: u32,
    /// Driver-side buffer size hint.
    pub buffer_size: usize,
}

impl PortOptions {
    pub const DEFAULT_BUFFER_SIZE: usize = 2048;

    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            buffer_size: Self::DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }
}

/// Requested modem control line levels. `None` leaves a line untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlLines {
    pub dtr: Option<bool>,
    pub rts: Option<bool>,
}

impl ControlLines {
    /// Drive DTR only.
    pub fn dtr(level: bool) -> Self {
        Self {
            dtr: Some(level),
            rts: None,
        }
    }

    /// Drive DTR and RTS to the same level.
    pub fn both(level: bool) -> Self {
        Self {
            dtr: Some(level),
            rts: Some(level),
        }
    }
}

/// Errors reported by a provider.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// No device was granted or none is present.
    #[error("no device available: {0}")]
    NoDevice(String),

    /// The device has not been opened, or was closed underneath us.
    #[error("device is not open")]
    NotOpen,

    #[error("failed to open device: {0}")]
    Open(String),

    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// The capability that owns the actual device handle.
///
/// `Device` is a cheap, cloneable handle; the session keeps the one returned
/// by [`acquire_device`](Self::acquire_device) and reuses it across opens.
pub trait HostTransport: Send + Sync + 'static {
    type Device: Clone + Send + Sync + fmt::Debug + 'static;

    fn acquire_device(&self) -> Result<Self::Device, TransportError>;

    fn open_device(&self, device: &Self::Device, options: &PortOptions) -> Result<(), TransportError>;

    fn close_device(&self, device: &Self::Device) -> Result<(), TransportError>;

    fn is_readable_writable(&self, device: &Self::Device) -> bool;

    fn set_control_lines(&self, device: &Self::Device, lines: ControlLines) -> Result<(), TransportError>;

    /// Read at most `max_len` bytes, waiting up to `timeout` for the first
    /// one. An empty vector means nothing arrived.
    fn read_chunk(
        &self,
        device: &Self::Device,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    fn write_chunk(&self, device: &Self::Device, bytes: &[u8]) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_lines_helpers() {
        assert_eq!(
            ControlLines::dtr(false),
            ControlLines {
                dtr: Some(false),
                rts: None
            }
        );
        assert_eq!(
            ControlLines::both(true),
            ControlLines {
                dtr: Some(true),
                rts: Some(true)
            }
        );
        assert_eq!(ControlLines::default().dtr, None);
    }

    #[test]
    fn test_port_options_defaults() {
        let opts = PortOptions::new(115_200);
        assert_eq!(opts.buffer_size, 2048);
        assert_eq!(opts.with_buffer_size(64).buffer_size, 64);
    }
}

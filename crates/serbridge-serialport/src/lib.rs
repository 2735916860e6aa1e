//! serbridge-serialport: [`HostTransport`] over a real serial port.
//!
//! Opens ports through the `serialport` crate, 8N1 without flow control.
//! The device handle is shared between the session (lifecycle and control
//! lines) and the worker thread (reads and writes); every call takes the
//! port lock for its own duration only.
//!
//! ```ignore
//! use serbridge::{BridgeConfig, PortSession};
//! use serbridge_serialport::SerialPortTransport;
//!
//! let mut session = PortSession::new(SerialPortTransport::with_path("/dev/ttyACM0"), BridgeConfig::default())?;
//! session.open(115_200).await?;
//! session.write(b"\x30\x20").await?;
//! ```

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serbridge::{ControlLines, HostTransport, PortOptions, TransportError};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

/// Read timeout applied when a port is opened; reads override it per call.
const OPEN_TIMEOUT: Duration = Duration::from_millis(10);

/// Provider for OS serial ports.
#[derive(Debug, Clone, Default)]
pub struct SerialPortTransport {
    path: Option<String>,
}

impl SerialPortTransport {
    /// Use the first port the OS enumerates.
    pub fn new() -> Self {
        Self::default()
    }

    /// Always use `path` (e.g. `/dev/ttyUSB0`, `COM3`).
    pub fn with_path(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }
}

/// A granted serial port. Clones refer to the same port.
#[derive(Clone)]
pub struct SerialDevice {
    path: Arc<str>,
    port: Arc<Mutex<Option<Box<dyn SerialPort>>>>,
}

impl SerialDevice {
    fn new(path: &str) -> Self {
        Self {
            path: Arc::from(path),
            port: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Debug for SerialDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialDevice")
            .field("path", &self.path)
            .field("open", &self.port.lock().is_some())
            .finish()
    }
}

fn map_serial_error(e: serialport::Error) -> TransportError {
    match e.kind() {
        serialport::ErrorKind::NoDevice => TransportError::NoDevice(e.description),
        serialport::ErrorKind::Io(kind) => TransportError::Io(io::Error::new(kind, e.description)),
        _ => TransportError::Open(e.description),
    }
}

impl HostTransport for SerialPortTransport {
    type Device = SerialDevice;

    fn acquire_device(&self) -> Result<SerialDevice, TransportError> {
        if let Some(path) = &self.path {
            return Ok(SerialDevice::new(path));
        }

        let ports = serialport::available_ports().map_err(map_serial_error)?;
        let first = ports
            .first()
            .ok_or_else(|| TransportError::NoDevice("no serial ports found".into()))?;
        tracing::debug!(port = %first.port_name, "selected serial port");
        Ok(SerialDevice::new(&first.port_name))
    }

    fn open_device(&self, device: &SerialDevice, options: &PortOptions) -> Result<(), TransportError> {
        let mut slot = device.port.lock();
        // Reopening replaces the old handle; drop it first so the OS releases the port.
        slot.take();

        let port = serialport::new(device.path(), options.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(OPEN_TIMEOUT)
            .open()
            .map_err(map_serial_error)?;

        tracing::debug!(path = device.path(), baud = options.baud_rate, "serial port open");
        *slot = Some(port);
        Ok(())
    }

    fn close_device(&self, device: &SerialDevice) -> Result<(), TransportError> {
        if device.port.lock().take().is_some() {
            tracing::debug!(path = device.path(), "serial port closed");
        }
        Ok(())
    }

    fn is_readable_writable(&self, device: &SerialDevice) -> bool {
        device.port.lock().is_some()
    }

    fn set_control_lines(&self, device: &SerialDevice, lines: ControlLines) -> Result<(), TransportError> {
        let mut slot = device.port.lock();
        let port = slot.as_mut().ok_or(TransportError::NotOpen)?;
        if let Some(dtr) = lines.dtr {
            port.write_data_terminal_ready(dtr).map_err(map_serial_error)?;
        }
        if let Some(rts) = lines.rts {
            port.write_request_to_send(rts).map_err(map_serial_error)?;
        }
        Ok(())
    }

    fn read_chunk(
        &self,
        device: &SerialDevice,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let mut slot = device.port.lock();
        let port = slot.as_mut().ok_or(TransportError::NotOpen)?;
        port.set_timeout(timeout).map_err(map_serial_error)?;

        let mut buf = vec![0u8; max_len];
        match port.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(Vec::new()),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn write_chunk(&self, device: &SerialDevice, bytes: &[u8]) -> Result<(), TransportError> {
        let mut slot = device.port.lock();
        let port = slot.as_mut().ok_or(TransportError::NotOpen)?;
        port.write_all(bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_path_is_acquired_without_opening() {
        let transport = SerialPortTransport::with_path("/dev/serbridge-does-not-exist");
        let device = transport.acquire_device().unwrap();
        assert_eq!(device.path(), "/dev/serbridge-does-not-exist");
        assert!(!transport.is_readable_writable(&device));
    }

    #[test]
    fn test_open_missing_port_fails() {
        let transport = SerialPortTransport::with_path("/dev/serbridge-does-not-exist");
        let device = transport.acquire_device().unwrap();
        assert!(transport
            .open_device(&device, &PortOptions::new(115_200))
            .is_err());
        assert!(!transport.is_readable_writable(&device));
    }

    #[test]
    fn test_io_on_closed_port() {
        let transport = SerialPortTransport::with_path("/dev/serbridge-does-not-exist");
        let device = transport.acquire_device().unwrap();

        assert!(matches!(
            transport.read_chunk(&device, 8, Duration::ZERO),
            Err(TransportError::NotOpen)
        ));
        assert!(matches!(
            transport.write_chunk(&device, b"x"),
            Err(TransportError::NotOpen)
        ));
        assert!(matches!(
            transport.set_control_lines(&device, ControlLines::both(true)),
            Err(TransportError::NotOpen)
        ));
        transport.close_device(&device).unwrap();
    }

    #[test]
    fn test_error_mapping() {
        let e = serialport::Error::new(serialport::ErrorKind::NoDevice, "gone");
        assert!(matches!(map_serial_error(e), TransportError::NoDevice(msg) if msg == "gone"));

        let e = serialport::Error::new(serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied), "denied");
        match map_serial_error(e) {
            TransportError::Io(io) => assert_eq!(io.kind(), io::ErrorKind::PermissionDenied),
            other => panic!("unexpected: {other}"),
        }
    }
}

//! Scripted in-memory serial device.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serbridge::{ControlLines, HostTransport, PortOptions, TransportError};

/// Handle to a mock device. The number counts acquisitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MockDevice(pub u32);

/// A provider call as seen by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOp {
    Acquire,
    Open { baud_rate: u32 },
    Close,
    ControlLines(ControlLines),
    /// A read that returned this many bytes (empty reads are not recorded).
    Read(usize),
    Write(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub at: Instant,
    pub op: DeviceOp,
}

/// In-memory [`HostTransport`].
///
/// Clones share the same device, so a test can keep one clone for scripting
/// and hand another to the session.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<MockState>,
    readable: Condvar,
}

#[derive(Default)]
struct MockState {
    open: bool,
    baud_rate: Option<u32>,
    dtr: bool,
    rts: bool,
    loopback: bool,
    inbound: VecDeque<u8>,
    scheduled: Vec<(Instant, Vec<u8>)>,
    written: Vec<u8>,
    events: Vec<DeviceEvent>,
    acquisitions: u32,
    opens: usize,
    fail_acquire: Option<String>,
    fail_open: Option<usize>,
    fail_next_read: Option<String>,
    wedge_next_read: Option<Duration>,
}

impl MockState {
    fn record(&mut self, op: DeviceOp) {
        self.events.push(DeviceEvent {
            at: Instant::now(),
            op,
        });
    }

    /// Move scheduled bytes whose time has come into the inbound queue.
    fn release_due(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.scheduled.len() {
            if self.scheduled[i].0 <= now {
                let (_, bytes) = self.scheduled.remove(i);
                self.inbound.extend(bytes);
            } else {
                i += 1;
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.scheduled.iter().map(|(at, _)| *at).min()
    }
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("MockTransport")
            .field("open", &st.open)
            .field("baud_rate", &st.baud_rate)
            .field("loopback", &st.loopback)
            .field("inbound", &st.inbound.len())
            .finish()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device that echoes every write back as inbound data.
    pub fn loopback() -> Self {
        let mock = Self::new();
        mock.set_loopback(true);
        mock
    }

    pub fn set_loopback(&self, on: bool) {
        self.inner.state.lock().loopback = on;
    }

    /// Make `bytes` readable now.
    pub fn feed(&self, bytes: &[u8]) {
        self.inner.state.lock().inbound.extend(bytes);
        self.inner.readable.notify_all();
    }

    /// Make `bytes` readable after `delay`.
    pub fn feed_after(&self, delay: Duration, bytes: &[u8]) {
        let at = Instant::now() + delay;
        self.inner.state.lock().scheduled.push((at, bytes.to_vec()));
        self.inner.readable.notify_all();
    }

    /// Everything written to the device so far.
    pub fn written(&self) -> Vec<u8> {
        self.inner.state.lock().written.clone()
    }

    pub fn events(&self) -> Vec<DeviceEvent> {
        self.inner.state.lock().events.clone()
    }

    /// Recorded operations without timestamps.
    pub fn ops(&self) -> Vec<DeviceOp> {
        self.inner
            .state
            .lock()
            .events
            .iter()
            .map(|e| e.op.clone())
            .collect()
    }

    pub fn clear_events(&self) {
        self.inner.state.lock().events.clear();
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.lock().open
    }

    pub fn baud_rate(&self) -> Option<u32> {
        self.inner.state.lock().baud_rate
    }

    /// Current (DTR, RTS) levels.
    pub fn lines(&self) -> (bool, bool) {
        let st = self.inner.state.lock();
        (st.dtr, st.rts)
    }

    pub fn acquisitions(&self) -> u32 {
        self.inner.state.lock().acquisitions
    }

    /// Refuse the next acquisitions with `reason`, until cleared with `None`.
    pub fn fail_acquire(&self, reason: Option<&str>) {
        self.inner.state.lock().fail_acquire = reason.map(str::to_owned);
    }

    /// Fail the `n`-th open call from now (1 = the next one).
    pub fn fail_nth_open(&self, n: usize) {
        let mut st = self.inner.state.lock();
        st.fail_open = Some(st.opens + n);
    }

    /// Fail the next read with an I/O error.
    pub fn fail_next_read(&self, reason: &str) {
        self.inner.state.lock().fail_next_read = Some(reason.to_owned());
        self.inner.readable.notify_all();
    }

    /// Make the next read hang for `duration`, like a driver stuck inside a
    /// syscall.
    pub fn wedge_next_read(&self, duration: Duration) {
        self.inner.state.lock().wedge_next_read = Some(duration);
        self.inner.readable.notify_all();
    }

    /// Simulate the device disappearing underneath an open port.
    pub fn unplug(&self) {
        self.inner.state.lock().open = false;
        self.inner.readable.notify_all();
    }
}

impl HostTransport for MockTransport {
    type Device = MockDevice;

    fn acquire_device(&self) -> Result<MockDevice, TransportError> {
        let mut st = self.inner.state.lock();
        if let Some(reason) = &st.fail_acquire {
            return Err(TransportError::NoDevice(reason.clone()));
        }
        st.acquisitions += 1;
        st.record(DeviceOp::Acquire);
        Ok(MockDevice(st.acquisitions))
    }

    fn open_device(&self, _device: &MockDevice, options: &PortOptions) -> Result<(), TransportError> {
        let mut st = self.inner.state.lock();
        st.opens += 1;
        if st.fail_open == Some(st.opens) {
            st.fail_open = None;
            return Err(TransportError::Open(format!(
                "device refused {} baud",
                options.baud_rate
            )));
        }
        st.open = true;
        st.baud_rate = Some(options.baud_rate);
        st.record(DeviceOp::Open {
            baud_rate: options.baud_rate,
        });
        Ok(())
    }

    fn close_device(&self, _device: &MockDevice) -> Result<(), TransportError> {
        let mut st = self.inner.state.lock();
        st.open = false;
        st.record(DeviceOp::Close);
        drop(st);
        self.inner.readable.notify_all();
        Ok(())
    }

    fn is_readable_writable(&self, _device: &MockDevice) -> bool {
        self.inner.state.lock().open
    }

    fn set_control_lines(&self, _device: &MockDevice, lines: ControlLines) -> Result<(), TransportError> {
        let mut st = self.inner.state.lock();
        if !st.open {
            return Err(TransportError::NotOpen);
        }
        if let Some(dtr) = lines.dtr {
            st.dtr = dtr;
        }
        if let Some(rts) = lines.rts {
            st.rts = rts;
        }
        st.record(DeviceOp::ControlLines(lines));
        Ok(())
    }

    fn read_chunk(
        &self,
        _device: &MockDevice,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let wedge = self.inner.state.lock().wedge_next_read.take();
        if let Some(duration) = wedge {
            std::thread::sleep(duration);
        }

        let deadline = Instant::now() + timeout;
        let mut st = self.inner.state.lock();

        loop {
            if let Some(reason) = st.fail_next_read.take() {
                return Err(TransportError::Io(io::Error::other(reason)));
            }
            if !st.open {
                return Err(TransportError::NotOpen);
            }

            let now = Instant::now();
            st.release_due(now);
            if !st.inbound.is_empty() {
                let n = st.inbound.len().min(max_len);
                let chunk: Vec<u8> = st.inbound.drain(..n).collect();
                st.record(DeviceOp::Read(n));
                return Ok(chunk);
            }
            if now >= deadline {
                return Ok(Vec::new());
            }

            let wake = st.next_due().map_or(deadline, |due| due.min(deadline));
            self.inner.readable.wait_until(&mut st, wake);
        }
    }

    fn write_chunk(&self, _device: &MockDevice, bytes: &[u8]) -> Result<(), TransportError> {
        let mut st = self.inner.state.lock();
        if !st.open {
            return Err(TransportError::NotOpen);
        }
        st.written.extend_from_slice(bytes);
        if st.loopback {
            st.inbound.extend(bytes);
        }
        st.record(DeviceOp::Write(bytes.len()));
        drop(st);
        self.inner.readable.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_echoes_writes() {
        let mock = MockTransport::loopback();
        let dev = mock.acquire_device().unwrap();
        mock.open_device(&dev, &PortOptions::new(9600)).unwrap();

        mock.write_chunk(&dev, b"ping").unwrap();
        let got = mock.read_chunk(&dev, 16, Duration::from_millis(10)).unwrap();
        assert_eq!(got, b"ping");
        assert_eq!(mock.written(), b"ping");
    }

    #[test]
    fn test_read_times_out_empty() {
        let mock = MockTransport::new();
        let dev = mock.acquire_device().unwrap();
        mock.open_device(&dev, &PortOptions::new(9600)).unwrap();

        let start = Instant::now();
        let got = mock.read_chunk(&dev, 16, Duration::from_millis(20)).unwrap();
        assert!(got.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_feed_after_wakes_reader() {
        let mock = MockTransport::new();
        let dev = mock.acquire_device().unwrap();
        mock.open_device(&dev, &PortOptions::new(9600)).unwrap();

        mock.feed_after(Duration::from_millis(15), b"late");
        assert!(mock.read_chunk(&dev, 16, Duration::ZERO).unwrap().is_empty());
        let got = mock.read_chunk(&dev, 16, Duration::from_secs(1)).unwrap();
        assert_eq!(got, b"late");
    }

    #[test]
    fn test_read_respects_max_len() {
        let mock = MockTransport::new();
        let dev = mock.acquire_device().unwrap();
        mock.open_device(&dev, &PortOptions::new(9600)).unwrap();

        mock.feed(b"abcdef");
        assert_eq!(mock.read_chunk(&dev, 4, Duration::ZERO).unwrap(), b"abcd");
        assert_eq!(mock.read_chunk(&dev, 4, Duration::ZERO).unwrap(), b"ef");
    }

    #[test]
    fn test_fail_nth_open() {
        let mock = MockTransport::new();
        let dev = mock.acquire_device().unwrap();
        mock.fail_nth_open(2);

        mock.open_device(&dev, &PortOptions::new(9600)).unwrap();
        assert!(matches!(
            mock.open_device(&dev, &PortOptions::new(9600)),
            Err(TransportError::Open(_))
        ));
        mock.open_device(&dev, &PortOptions::new(9600)).unwrap();
    }

    #[test]
    fn test_closed_device_rejects_io() {
        let mock = MockTransport::new();
        let dev = mock.acquire_device().unwrap();
        assert!(matches!(mock.write_chunk(&dev, b"x"), Err(TransportError::NotOpen)));
        assert!(matches!(
            mock.set_control_lines(&dev, ControlLines::both(true)),
            Err(TransportError::NotOpen)
        ));
    }

    #[test]
    fn test_wedged_read_ignores_timeout() {
        let mock = MockTransport::new();
        let dev = mock.acquire_device().unwrap();
        mock.open_device(&dev, &PortOptions::new(9600)).unwrap();

        mock.wedge_next_read(Duration::from_millis(40));
        let start = Instant::now();
        assert!(mock.read_chunk(&dev, 16, Duration::ZERO).unwrap().is_empty());
        assert!(start.elapsed() >= Duration::from_millis(40));

        // Only one read hangs.
        let start = Instant::now();
        mock.read_chunk(&dev, 16, Duration::ZERO).unwrap();
        assert!(start.elapsed() < Duration::from_millis(40));
    }
}

//! Receive Engine: timeout-bounded, length-bounded reads from the inbound
//! channel.

use std::io::ErrorKind;
use std::time::Duration;

use tokio::time::Instant;

use crate::doorbell::Doorbell;
use crate::error::{SessionError, SessionResult};
use crate::ring::RingReader;
use crate::spillover::SpilloverBuffer;

#[derive(Debug)]
pub(crate) struct ReceiveEngine {
    reader: RingReader,
    spillover: SpilloverBuffer,
    /// Rung by the worker after each inbound push.
    data_bell: Doorbell,
}

impl ReceiveEngine {
    pub(crate) fn new(reader: RingReader, data_bell: Doorbell) -> Self {
        Self {
            reader,
            spillover: SpilloverBuffer::new(),
            data_bell,
        }
    }

    /// Fill `buf` from the spillover and the inbound channel, waiting at most
    /// `timeout` for the rest.
    ///
    /// Returns the number of bytes written to `buf` (short on timeout), or
    /// [`SessionError::NoData`] if nothing arrived at all. Bytes drained past
    /// `buf.len()` are kept for the next call.
    pub(crate) async fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> SessionResult<usize> {
        let wanted = buf.len();
        if wanted == 0 {
            return Ok(0);
        }

        if let Some(bytes) = self.spillover.take_exact(wanted) {
            buf.copy_from_slice(&bytes);
            return Ok(wanted);
        }

        let mut collected = self.spillover.take_all();
        let deadline = Instant::now() + timeout;
        let mut worker_gone = false;

        loop {
            self.reader.drain_into(&mut collected, usize::MAX);
            if collected.len() >= wanted || worker_gone {
                break;
            }

            match tokio::time::timeout_at(deadline, self.data_bell.wait()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.kind() == ErrorKind::BrokenPipe => worker_gone = true,
                Ok(Err(e)) => {
                    self.spillover.extend(&collected);
                    return Err(SessionError::Doorbell(e));
                }
                Err(_) => {
                    // Last look: bytes may have landed just before the deadline.
                    self.reader.drain_into(&mut collected, usize::MAX);
                    break;
                }
            }
        }

        let n = collected.len().min(wanted);
        buf[..n].copy_from_slice(&collected[..n]);
        if collected.len() > n {
            self.spillover.extend(&collected[n..]);
        }
        tracing::trace!(requested = wanted, received = n, held = self.spillover.len(), "recv");

        match n {
            0 if worker_gone => Err(SessionError::WorkerGone),
            0 => Err(SessionError::NoData),
            n => Ok(n),
        }
    }

    /// Forget the spillover and everything unread in the channel.
    /// Returns how many bytes were discarded.
    pub(crate) fn discard(&mut self) -> usize {
        let held = self.spillover.len();
        self.spillover.clear();
        // A hung-up bell surfaces on the next recv.
        let _ = self.data_bell.drain();
        held + self.reader.skip_to_producer()
    }

    pub(crate) fn held(&self) -> usize {
        self.spillover.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doorbell::DoorbellRinger;
    use crate::ring::{RingChannel, RingConfig, RingWriter};

    fn engine() -> (ReceiveEngine, RingWriter, DoorbellRinger) {
        let (writer, reader) = RingChannel::pair(RingConfig::new(64, 3)).unwrap();
        let (bell, ringer) = Doorbell::create_pair().unwrap();
        (ReceiveEngine::new(reader, bell), writer, ringer)
    }

    #[tokio::test]
    async fn test_exact_read() {
        let (mut rx, mut tx, ring) = engine();
        tx.push(b"abcd").unwrap();
        ring.signal();

        let mut buf = [0u8; 4];
        assert_eq!(rx.recv(&mut buf, Duration::from_millis(50)).await.unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(rx.held(), 0);
    }

    #[tokio::test]
    async fn test_over_read_goes_to_spillover() {
        let (mut rx, mut tx, ring) = engine();
        tx.push(b"0123456789").unwrap();
        ring.signal();

        let mut buf = [0u8; 3];
        assert_eq!(rx.recv(&mut buf, Duration::from_millis(50)).await.unwrap(), 3);
        assert_eq!(&buf, b"012");
        assert_eq!(rx.held(), 7);

        // Served from the spillover without touching the channel.
        let mut buf = [0u8; 7];
        assert_eq!(rx.recv(&mut buf, Duration::ZERO).await.unwrap(), 7);
        assert_eq!(&buf, b"3456789");
    }

    #[tokio::test]
    async fn test_spillover_prefix_then_channel() {
        let (mut rx, mut tx, ring) = engine();
        tx.push(b"abcdef").unwrap();
        ring.signal();

        let mut small = [0u8; 2];
        rx.recv(&mut small, Duration::from_millis(50)).await.unwrap();
        assert_eq!(rx.held(), 4);

        tx.push(b"gh").unwrap();
        ring.signal();
        let mut buf = [0u8; 6];
        assert_eq!(rx.recv(&mut buf, Duration::from_millis(50)).await.unwrap(), 6);
        assert_eq!(&buf, b"cdefgh");
    }

    #[tokio::test]
    async fn test_short_read_on_timeout() {
        let (mut rx, mut tx, ring) = engine();
        tx.push(b"xyz").unwrap();
        ring.signal();

        let mut buf = [0u8; 10];
        let start = Instant::now();
        assert_eq!(rx.recv(&mut buf, Duration::from_millis(40)).await.unwrap(), 3);
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(&buf[..3], b"xyz");
    }

    #[tokio::test]
    async fn test_no_data() {
        let (mut rx, _tx, _ring) = engine();
        let mut buf = [0u8; 4];
        let err = rx.recv(&mut buf, Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, SessionError::NoData));
    }

    #[tokio::test]
    async fn test_zero_length_is_immediate() {
        let (mut rx, _tx, _ring) = engine();
        assert_eq!(rx.recv(&mut [], Duration::from_secs(10)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_wakes_on_late_bytes() {
        let (mut rx, mut tx, ring) = engine();

        let producer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            tx.push(b"late").unwrap();
            ring.signal();
            (tx, ring)
        });

        let mut buf = [0u8; 4];
        let start = Instant::now();
        assert_eq!(rx.recv(&mut buf, Duration::from_secs(2)).await.unwrap(), 4);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(&buf, b"late");
        drop(producer.join().unwrap());
    }

    #[tokio::test]
    async fn test_worker_gone_without_data() {
        let (mut rx, tx, ring) = engine();
        drop(ring);
        drop(tx);

        let mut buf = [0u8; 4];
        let err = rx.recv(&mut buf, Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, SessionError::WorkerGone));
    }

    #[tokio::test]
    async fn test_discard() {
        let (mut rx, mut tx, ring) = engine();
        tx.push(b"stale bytes").unwrap();
        ring.signal();

        let mut buf = [0u8; 1];
        rx.recv(&mut buf, Duration::from_millis(50)).await.unwrap();
        assert_eq!(rx.discard(), 10);
        assert_eq!(rx.held(), 0);

        tx.push(b"fresh").unwrap();
        ring.signal();
        let mut buf = [0u8; 5];
        assert_eq!(rx.recv(&mut buf, Duration::from_millis(50)).await.unwrap(), 5);
        assert_eq!(&buf, b"fresh");
    }
}

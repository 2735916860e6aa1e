//! Transmit Engine: writes into the outbound channel.

use std::io::{self, ErrorKind};
use std::time::Duration;

use tokio::time::Instant;

use crate::doorbell::Doorbell;
use crate::error::{SessionError, SessionResult};
use crate::ring::{RingError, RingWriter};

#[derive(Debug)]
pub(crate) struct TransmitEngine {
    writer: RingWriter,
    /// Rung by the worker after each outbound drain.
    space_bell: Doorbell,
    write_timeout: Duration,
}

impl TransmitEngine {
    pub(crate) fn new(writer: RingWriter, space_bell: Doorbell, write_timeout: Duration) -> Self {
        Self {
            writer,
            space_bell,
            write_timeout,
        }
    }

    /// Queue `bytes` for the worker.
    ///
    /// Writes larger than the free space are split; the call waits for the
    /// worker to make room, up to the write timeout. On timeout the bytes
    /// already queued stay queued and the error reports the unsent remainder.
    pub(crate) async fn send(&mut self, bytes: &[u8]) -> SessionResult<()> {
        let deadline = Instant::now() + self.write_timeout;
        let mut rest = bytes;

        // The worker drops its ringer when it detaches from a lost device.
        self.space_bell.drain().map_err(bell_error)?;

        while !rest.is_empty() {
            let free = self.writer.free_space();
            if free == 0 {
                match tokio::time::timeout_at(deadline, self.space_bell.wait()).await {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => return Err(bell_error(e)),
                    Err(_) => {
                        tracing::warn!(unsent = rest.len(), "outbound channel full");
                        return Err(RingError::Overflow {
                            requested: rest.len(),
                            free: self.writer.free_space(),
                        }
                        .into());
                    }
                }
            }

            let n = free.min(rest.len());
            self.writer.push(&rest[..n])?;
            rest = &rest[n..];
        }

        tracing::trace!(bytes = bytes.len(), "queued for device");
        Ok(())
    }
}

fn bell_error(e: io::Error) -> SessionError {
    if e.kind() == ErrorKind::BrokenPipe {
        SessionError::WorkerGone
    } else {
        SessionError::Doorbell(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::{RingChannel, RingConfig};

    #[tokio::test]
    async fn test_small_write_is_immediate() {
        let (writer, mut reader) = RingChannel::pair(RingConfig::new(32, 3)).unwrap();
        let (bell, _ringer) = Doorbell::create_pair().unwrap();
        let mut tx = TransmitEngine::new(writer, bell, Duration::from_millis(10));

        tx.send(b"hello").await.unwrap();
        assert_eq!(reader.drain(usize::MAX), b"hello");
    }

    #[tokio::test]
    async fn test_large_write_waits_for_consumer() {
        let (writer, mut reader) = RingChannel::pair(RingConfig::new(16, 3)).unwrap();
        let (bell, ringer) = Doorbell::create_pair().unwrap();
        let mut tx = TransmitEngine::new(writer, bell, Duration::from_secs(2));

        let payload: Vec<u8> = (0..100u8).collect();
        let consumer = std::thread::spawn(move || {
            let mut out = Vec::new();
            while out.len() < 100 {
                if reader.drain_into(&mut out, 5) > 0 {
                    ringer.signal();
                } else {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            out
        });

        tx.send(&payload).await.unwrap();
        assert_eq!(consumer.join().unwrap(), payload);
    }

    #[tokio::test]
    async fn test_overflow_when_nobody_drains() {
        let (writer, _reader) = RingChannel::pair(RingConfig::new(16, 3)).unwrap();
        let (bell, _ringer) = Doorbell::create_pair().unwrap();
        let mut tx = TransmitEngine::new(writer, bell, Duration::from_millis(20));

        let err = tx.send(&[0; 20]).await.unwrap_err();
        match err {
            SessionError::Overflow(RingError::Overflow { requested, free }) => {
                assert_eq!(requested, 8);
                assert_eq!(free, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_detached_worker_rejects_writes() {
        let (writer, reader) = RingChannel::pair(RingConfig::new(32, 3)).unwrap();
        let (bell, ringer) = Doorbell::create_pair().unwrap();
        let mut tx = TransmitEngine::new(writer, bell, Duration::from_millis(20));
        drop(ringer);

        assert!(matches!(tx.send(b"lost").await, Err(SessionError::WorkerGone)));
        assert_eq!(reader.available(), 0);
    }
}

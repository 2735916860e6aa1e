//! The worker execution context.
//!
//! One OS thread per session owns all device I/O. It idles on the control
//! queue until `Init` arrives, then alternates between applying control
//! requests, moving outbound bytes to the device, and moving device bytes into
//! the inbound channel.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, error::TryRecvError};

use crate::config::BridgeConfig;
use crate::error::{SessionError, SessionResult};
use crate::protocol::{ChannelHandles, ControlReply, ControlRequest, Envelope};
use crate::transport::{HostTransport, TransportError};

/// Back-to-back I/O failures after which the device is treated as gone.
const MAX_CONSECUTIVE_IO_ERRORS: u32 = 8;

/// Counters updated by the worker thread.
#[derive(Debug, Default)]
pub struct WorkerStats {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    dropped: AtomicU64,
    io_errors: AtomicU64,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Bytes read from the device and pushed into the inbound channel.
    pub bytes_in: u64,
    /// Bytes written to the device.
    pub bytes_out: u64,
    /// Inbound bytes discarded because the inbound channel was full.
    pub dropped: u64,
    pub io_errors: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            io_errors: self.io_errors.load(Ordering::Relaxed),
        }
    }
}

/// Foreground handle to a running worker thread.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    control: mpsc::UnboundedSender<Envelope>,
    thread: Option<JoinHandle<()>>,
    stats: Arc<WorkerStats>,
}

impl WorkerHandle {
    /// Start a worker for `device`. It does nothing until `Init`.
    pub(crate) fn spawn<P: HostTransport>(
        provider: Arc<P>,
        device: P::Device,
        config: &BridgeConfig,
    ) -> io::Result<Self> {
        let (control, queue) = mpsc::unbounded_channel();
        let stats = Arc::new(WorkerStats::default());

        let worker = Worker {
            provider,
            device,
            poll_interval: config.poll_interval,
            io_chunk: config.io_chunk,
            stats: stats.clone(),
            channels: None,
            opened: false,
            pending_error: None,
            error_streak: 0,
            scratch: Vec::with_capacity(config.io_chunk),
        };

        let thread = std::thread::Builder::new()
            .name("serbridge-worker".into())
            .spawn(move || worker.run(queue))?;

        Ok(Self {
            control,
            thread: Some(thread),
            stats,
        })
    }

    pub(crate) fn stats(&self) -> &Arc<WorkerStats> {
        &self.stats
    }

    /// Send one control request and await its reply.
    pub(crate) async fn request(
        &self,
        request: ControlRequest,
        timeout: Duration,
    ) -> SessionResult<ControlReply> {
        let kind = request.kind();
        let (envelope, reply) = Envelope::new(request);
        self.control
            .send(envelope)
            .map_err(|_| SessionError::WorkerGone)?;

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(ControlReply::Error(message))) => Err(SessionError::Worker {
                request: kind,
                message,
            }),
            Ok(Ok(reply)) => {
                tracing::debug!(request = kind, ?reply, "worker acknowledged");
                Ok(reply)
            }
            Ok(Err(_)) => Err(SessionError::WorkerGone),
            Err(_) => Err(SessionError::AckTimeout {
                request: kind,
                timeout,
            }),
        }
    }

    /// Stop the worker and wait for its thread to finish.
    pub(crate) async fn join(mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        drop(self);

        match tokio::task::spawn_blocking(move || thread.join()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => tracing::warn!("worker thread panicked"),
            Err(e) => tracing::warn!("failed to join worker thread: {}", e),
        }
    }

    /// Stop the worker without waiting for it. Used when the worker may be
    /// wedged inside a provider call.
    pub(crate) fn abandon(mut self) {
        if let Some(thread) = self.thread.take() {
            tracing::debug!(thread = ?thread.thread().id(), "abandoning worker thread");
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

struct Worker<P: HostTransport> {
    provider: Arc<P>,
    device: P::Device,
    poll_interval: Duration,
    io_chunk: usize,
    stats: Arc<WorkerStats>,
    channels: Option<ChannelHandles>,
    opened: bool,
    /// First I/O failure since the last control request.
    pending_error: Option<String>,
    /// I/O failures since the last successful device call.
    error_streak: u32,
    scratch: Vec<u8>,
}

impl<P: HostTransport> Worker<P> {
    fn run(mut self, mut queue: mpsc::UnboundedReceiver<Envelope>) {
        tracing::debug!(device = ?self.device, "worker started");

        loop {
            let envelope = if self.channels.is_some() {
                match queue.try_recv() {
                    Ok(envelope) => Some(envelope),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => break,
                }
            } else {
                match queue.blocking_recv() {
                    Some(envelope) => Some(envelope),
                    None => break,
                }
            };

            match envelope {
                Some(envelope) => {
                    if let Flow::Stop = self.handle(envelope) {
                        tracing::debug!("worker stopped");
                        return;
                    }
                }
                None => {
                    self.pump_outbound();
                    self.pump_inbound(self.poll_interval);
                }
            }
        }

        // Foreground went away without a close.
        if self.opened {
            if let Err(e) = self.provider.close_device(&self.device) {
                tracing::warn!("worker: close on shutdown failed: {}", e);
            }
        }
        tracing::debug!("worker detached");
    }

    fn handle(&mut self, envelope: Envelope) -> Flow {
        let (request, replier) = envelope.into_parts();
        tracing::debug!(request = replier.kind(), "worker: control request");

        let (reply, flow) = match request {
            ControlRequest::Init { options, channels } => {
                match self.provider.open_device(&self.device, &options) {
                    Ok(()) => {
                        self.opened = true;
                        self.channels = Some(channels);
                        tracing::debug!(baud = options.baud_rate, "worker: device open");
                        (ControlReply::Ready, Flow::Continue)
                    }
                    Err(e) => (ControlReply::Error(e.to_string()), Flow::Continue),
                }
            }
            ControlRequest::ClearReadBuffer { timeout } => {
                if self.channels.is_some() {
                    self.settle(timeout);
                    (ControlReply::Cleared, Flow::Continue)
                } else {
                    (
                        ControlReply::Error("worker is not attached to a device".into()),
                        Flow::Continue,
                    )
                }
            }
            ControlRequest::Close => {
                self.channels = None;
                let reply = if std::mem::take(&mut self.opened) {
                    match self.provider.close_device(&self.device) {
                        Ok(()) => ControlReply::Closed,
                        Err(e) => ControlReply::Error(e.to_string()),
                    }
                } else {
                    ControlReply::Closed
                };
                (reply, Flow::Stop)
            }
        };

        // A failed pump surfaces on the next request, except a close: the
        // device is being released anyway.
        let reply = match (reply, self.pending_error.take()) {
            (ControlReply::Closed, Some(pending)) => {
                tracing::debug!("worker: discarding error at close: {}", pending);
                ControlReply::Closed
            }
            (_, Some(pending)) => ControlReply::Error(pending),
            (reply, None) => reply,
        };
        replier.send(reply);
        flow
    }

    /// Keep both directions moving until one inbound chunk lands or `timeout`
    /// elapses.
    fn settle(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            self.pump_outbound();
            let remaining = deadline.saturating_duration_since(Instant::now());
            if self.pump_inbound(remaining.min(self.poll_interval)) > 0
                || remaining.is_zero()
                || self.channels.is_none()
            {
                break;
            }
        }
    }

    /// Write everything currently queued in the outbound channel.
    fn pump_outbound(&mut self) {
        loop {
            let Some(channels) = self.channels.as_mut() else {
                return;
            };
            if channels.outbound.available() == 0 {
                return;
            }

            self.scratch.clear();
            let n = channels.outbound.drain_into(&mut self.scratch, self.io_chunk);
            channels.space_bell.signal();

            match self.provider.write_chunk(&self.device, &self.scratch) {
                Ok(()) => {
                    self.error_streak = 0;
                    self.stats.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
                    tracing::trace!(bytes = n, "worker: wrote to device");
                }
                Err(e) => {
                    self.record_error("write", e);
                    return;
                }
            }
        }
    }

    /// One read from the device into the inbound channel. Returns the number
    /// of bytes the device produced.
    fn pump_inbound(&mut self, timeout: Duration) -> usize {
        if self.channels.is_none() {
            return 0;
        }

        let bytes = match self.provider.read_chunk(&self.device, self.io_chunk, timeout) {
            Ok(bytes) => {
                self.error_streak = 0;
                bytes
            }
            Err(e) => {
                self.record_error("read", e);
                if self.channels.is_some() {
                    std::thread::sleep(self.poll_interval);
                }
                return 0;
            }
        };
        if bytes.is_empty() {
            return 0;
        }

        let Some(channels) = self.channels.as_mut() else {
            return 0;
        };
        let keep = bytes.len().min(channels.inbound.free_space());
        if keep > 0 {
            if let Err(e) = channels.inbound.push(&bytes[..keep]) {
                tracing::warn!("worker: inbound push failed: {}", e);
            } else {
                self.stats.bytes_in.fetch_add(keep as u64, Ordering::Relaxed);
            }
            channels.data_bell.signal();
        }

        let dropped = bytes.len() - keep;
        if dropped > 0 {
            self.stats.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
            tracing::warn!(dropped, "inbound channel full, dropping bytes");
        }
        tracing::trace!(bytes = keep, "worker: read from device");
        bytes.len()
    }

    /// Count a failed device call. A closed device, or a long enough run of
    /// failures, detaches the worker from its channels: the dropped ringers
    /// hang up both doorbells and the foreground sees the worker as gone.
    fn record_error(&mut self, op: &'static str, error: TransportError) {
        self.stats.io_errors.fetch_add(1, Ordering::Relaxed);
        self.error_streak += 1;
        if self.error_streak == 1 {
            tracing::warn!(op, "worker I/O error: {}", error);
        } else {
            tracing::debug!(op, streak = self.error_streak, "worker I/O error: {}", error);
        }

        let lost = matches!(error, TransportError::NotOpen);
        if self.pending_error.is_none() {
            self.pending_error = Some(format!("device {} failed: {}", op, error));
        }

        if self.channels.is_some() && (lost || self.error_streak >= MAX_CONSECUTIVE_IO_ERRORS) {
            tracing::warn!(op, errors = self.error_streak, "device lost, detaching from session");
            self.channels = None;
        }
    }
}

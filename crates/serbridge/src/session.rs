//! Port Session Manager.
//!
//! A [`PortSession`] is the caller-owned handle to one logical connection.
//! It drives the open/reset/close handshake with the worker and routes reads
//! and writes through the receive and transmit engines.
//!
//! ```text
//!  Closed ──open──► Opening ─► Resetting ─► Opening ──ack──► Open
//!    ▲                                                        │
//!    └──────────────── Closing ◄────────close─────────────────┘
//! ```
//!
//! Any fatal worker error drops the session straight back to `Closed`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{BridgeConfig, ConfigError, WorkerErrorPolicy};
use crate::doorbell::Doorbell;
use crate::error::{SessionError, SessionResult};
use crate::protocol::{ChannelHandles, ControlRequest};
use crate::receive::ReceiveEngine;
use crate::ring::RingChannel;
use crate::transmit::TransmitEngine;
use crate::transport::{ControlLines, HostTransport, PortOptions};
use crate::worker::{StatsSnapshot, WorkerHandle, WorkerStats};

/// Lifecycle state of a [`PortSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opening,
    /// Reset pulse in progress (sub-phase of opening).
    Resetting,
    Open,
    Closing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Closed => "closed",
            SessionState::Opening => "opening",
            SessionState::Resetting => "resetting",
            SessionState::Open => "open",
            SessionState::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// Everything that exists only while the session is open.
struct ActiveLink {
    worker: WorkerHandle,
    rx: ReceiveEngine,
    tx: TransmitEngine,
}

/// One serial connection bridged through a worker thread.
///
/// Operations take `&mut self`; a session serves one caller at a time.
pub struct PortSession<P: HostTransport> {
    provider: Arc<P>,
    config: BridgeConfig,
    /// Granted device. Released by [`close`](Self::close); a failed open keeps
    /// it so the next attempt reuses it.
    device: Option<P::Device>,
    state: SessionState,
    baud_rate: Option<u32>,
    link: Option<ActiveLink>,
    stats: Arc<WorkerStats>,
}

impl<P: HostTransport> fmt::Debug for PortSession<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortSession")
            .field("state", &self.state)
            .field("device", &self.device)
            .field("baud_rate", &self.baud_rate)
            .finish_non_exhaustive()
    }
}

impl<P: HostTransport> PortSession<P> {
    pub fn new(provider: P, config: BridgeConfig) -> Result<Self, ConfigError> {
        Self::with_shared(Arc::new(provider), config)
    }

    /// Build a session around a provider that is also used elsewhere.
    pub fn with_shared(provider: Arc<P>, config: BridgeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            provider,
            config,
            device: None,
            state: SessionState::Closed,
            baud_rate: None,
            link: None,
            stats: Arc::new(WorkerStats::default()),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    /// Baud rate of the current session, if open.
    pub fn baud_rate(&self) -> Option<u32> {
        self.baud_rate
    }

    /// Counters of the current (or most recent) worker.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Bytes received but not yet returned by [`recv`](Self::recv).
    pub fn buffered(&self) -> usize {
        self.link.as_ref().map_or(0, |link| link.rx.held())
    }

    /// Open the device at `baud_rate`.
    ///
    /// Always runs the reset pulse first. An open session is closed and
    /// reopened.
    pub async fn open(&mut self, baud_rate: u32) -> SessionResult<()> {
        if self.link.is_some() {
            tracing::debug!("open on an open session, closing first");
            self.close().await?;
        }

        self.set_state(SessionState::Opening);
        match self.establish(baud_rate).await {
            Ok(link) => {
                self.stats = link.worker.stats().clone();
                self.link = Some(link);
                self.baud_rate = Some(baud_rate);
                self.set_state(SessionState::Open);
                tracing::info!(baud = baud_rate, "port session open");
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn establish(&mut self, baud_rate: u32) -> SessionResult<ActiveLink> {
        let options = PortOptions::new(baud_rate).with_buffer_size(self.config.port_buffer_size);
        let device = self.attach_device(&options)?;

        self.set_state(SessionState::Resetting);
        self.reset_pulse(&device).await?;
        self.set_state(SessionState::Opening);

        // Fresh channels for every session: both cursors start at header_size.
        let (out_writer, out_reader) = RingChannel::pair(self.config.ring)?;
        let (in_writer, in_reader) = RingChannel::pair(self.config.ring)?;
        let (data_bell, data_ringer) = Doorbell::create_pair().map_err(SessionError::Doorbell)?;
        let (space_bell, space_ringer) = Doorbell::create_pair().map_err(SessionError::Doorbell)?;

        let worker = WorkerHandle::spawn(self.provider.clone(), device.clone(), &self.config)
            .map_err(SessionError::WorkerSpawn)?;

        let init = ControlRequest::Init {
            options,
            channels: ChannelHandles {
                outbound: out_reader,
                inbound: in_writer,
                data_bell: data_ringer,
                space_bell: space_ringer,
            },
        };
        if let Err(e) = worker.request(init, self.config.ack_timeout).await {
            worker.abandon();
            return Err(e);
        }

        if !self.provider.is_readable_writable(&device) {
            tracing::debug!(baud = baud_rate, "device not ready after init, reopening");
            if let Err(e) = self.provider.open_device(&device, &options) {
                self.shutdown_worker(worker).await;
                return Err(e.into());
            }
        }

        Ok(ActiveLink {
            worker,
            rx: ReceiveEngine::new(in_reader, data_bell),
            tx: TransmitEngine::new(out_writer, space_bell, self.config.write_timeout),
        })
    }

    /// Acquire a device, or reuse the one already granted.
    fn attach_device(&mut self, options: &PortOptions) -> SessionResult<P::Device> {
        if let Some(device) = &self.device {
            if !self.provider.is_readable_writable(device) {
                self.provider.open_device(device, options)?;
            }
            return Ok(device.clone());
        }

        let device = self
            .provider
            .acquire_device()
            .map_err(SessionError::DeviceAcquisition)?;
        tracing::debug!(?device, "device acquired");
        self.provider.open_device(&device, options)?;
        self.device = Some(device.clone());
        Ok(device)
    }

    /// close → open at the reset baud → DTR low → settle → DTR high → close.
    async fn reset_pulse(&self, device: &P::Device) -> SessionResult<()> {
        let provider = &self.provider;
        let reset = PortOptions::new(self.config.reset_baud_rate)
            .with_buffer_size(self.config.port_buffer_size);

        provider.close_device(device)?;
        provider.open_device(device, &reset)?;
        provider.set_control_lines(device, ControlLines::dtr(false))?;
        tokio::time::sleep(self.config.reset_settle).await;
        provider.set_control_lines(device, ControlLines::dtr(true))?;
        provider.close_device(device)?;

        tracing::debug!(settle = ?self.config.reset_settle, "reset pulse done");
        Ok(())
    }

    /// Close the session and release the device grant. Closing a closed
    /// session is a no-op.
    pub async fn close(&mut self) -> SessionResult<()> {
        let Some(link) = self.link.take() else {
            self.device = None;
            self.set_state(SessionState::Closed);
            return Ok(());
        };

        self.set_state(SessionState::Closing);
        let ActiveLink { worker, .. } = link;
        let result = worker.request(ControlRequest::Close, self.config.ack_timeout).await;
        match result {
            Ok(_) => worker.join().await,
            Err(_) => worker.abandon(),
        }

        self.device = None;
        self.baud_rate = None;
        self.set_state(SessionState::Closed);
        match result {
            Ok(_) => {
                tracing::info!("port session closed");
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Whether the device reports itself both readable and writable.
    pub fn is_open(&self) -> bool {
        self.device
            .as_ref()
            .is_some_and(|device| self.provider.is_readable_writable(device))
    }

    /// Drive DTR and RTS to `assert`.
    pub fn set_control_lines(&self, assert: bool) -> SessionResult<()> {
        let device = match (&self.link, &self.device) {
            (Some(_), Some(device)) => device,
            _ => return Err(SessionError::NotOpen),
        };
        self.provider
            .set_control_lines(device, ControlLines::both(assert))?;
        Ok(())
    }

    /// Discard stale inbound data.
    ///
    /// Lets the worker settle for up to `timeout`, then drops the spillover
    /// and everything unread in the inbound channel.
    pub async fn drain(&mut self, timeout: Duration) -> SessionResult<()> {
        let ack_timeout = self.config.ack_timeout;
        let link = self.link.as_mut().ok_or(SessionError::NotOpen)?;

        let result = link
            .worker
            .request(ControlRequest::ClearReadBuffer { timeout }, timeout + ack_timeout)
            .await;
        if let Err(e) = result {
            return Err(self.fail(e));
        }

        let discarded = link.rx.discard();
        tracing::debug!(discarded, "drained inbound");
        Ok(())
    }

    /// Queue `bytes` for the device. Returns once queued, not once written.
    pub async fn write(&mut self, bytes: &[u8]) -> SessionResult<()> {
        let link = self.link.as_mut().ok_or(SessionError::NotOpen)?;
        let result = link.tx.send(bytes).await;
        match result {
            Err(e) if e.is_fatal() => Err(self.fail(e)),
            other => other,
        }
    }

    /// Read up to `buf.len()` bytes, waiting at most `timeout`.
    ///
    /// Returns the number of bytes read, which is short if the timeout passed
    /// first. [`SessionError::NoData`] means nothing arrived.
    pub async fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> SessionResult<usize> {
        let link = self.link.as_mut().ok_or(SessionError::NotOpen)?;
        let result = link.rx.recv(buf, timeout).await;
        match result {
            Err(e) if e.is_fatal() => Err(self.fail(e)),
            other => other,
        }
    }

    async fn shutdown_worker(&self, worker: WorkerHandle) {
        match worker.request(ControlRequest::Close, self.config.ack_timeout).await {
            Ok(_) => worker.join().await,
            Err(e) => {
                tracing::warn!("worker shutdown failed: {}", e);
                worker.abandon();
            }
        }
    }

    /// Tear down after an error and apply the worker error policy.
    fn fail(&mut self, error: SessionError) -> SessionError {
        if let Some(link) = self.link.take() {
            link.worker.abandon();
        }
        self.baud_rate = None;
        self.set_state(SessionState::Closed);

        if error.is_fatal() {
            tracing::error!("port session failed: {}", error);
            if let WorkerErrorPolicy::Exit(code) = self.config.worker_error_policy {
                std::process::exit(code);
            }
        } else {
            tracing::debug!("port session operation failed: {}", error);
        }
        error
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state != next {
            tracing::debug!(from = %self.state, to = %next, "session state");
            self.state = next;
        }
    }
}

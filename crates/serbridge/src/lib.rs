//! serbridge: blocking-style serial I/O over a worker thread.
//!
//! The caller talks to a [`PortSession`] from async code; a dedicated worker
//! thread alone performs device I/O through a [`HostTransport`]. Data moves
//! through two lock-free SPSC byte rings, control through a request/ack
//! queue.
//!
//! # Architecture
//!
//! ```text
//!   foreground (tokio task)                       worker thread
//! ┌────────────────────────┐                 ┌──────────────────────┐
//! │ PortSession            │  outbound ring  │                      │
//! │   TransmitEngine ──────┼────────────────►│ write_chunk ──► dev  │
//! │                 ◄──────┼── space bell ───│                      │
//! │   ReceiveEngine ◄──────┼─ inbound ring ──│ read_chunk  ◄── dev  │
//! │     + spillover ◄──────┼── data bell ────│                      │
//! │                        │                 │                      │
//! │   control ─────────────┼─ init/close/ ──►│                      │
//! │           ◄────────────┼─ clear + acks ──│                      │
//! └────────────────────────┘                 └──────────────────────┘
//! ```
//!
//! Each ring has exactly one writer and one reader for its whole life; the
//! producer cursor lives in the ring header and is published with
//! release/acquire ordering. Doorbells replace polling: the worker rings one
//! after every push or drain and the foreground awaits it with a deadline.

pub mod config;
pub mod doorbell;
mod error;
pub mod protocol;
mod receive;
pub mod ring;
mod session;
pub mod spillover;
mod transmit;
pub mod transport;
mod worker;

pub use config::{BridgeConfig, ConfigError, WorkerErrorPolicy};
pub use error::{SessionError, SessionResult};
pub use ring::{
    LayoutError, RingChannel, RingConfig, RingError, RingReader, RingWriter, DEFAULT_CAPACITY,
    DEFAULT_HEADER_SIZE, MAX_CAPACITY,
};
pub use session::{PortSession, SessionState};
pub use spillover::SpilloverBuffer;
pub use transport::{ControlLines, HostTransport, PortOptions, TransportError};
pub use worker::{StatsSnapshot, WorkerStats};

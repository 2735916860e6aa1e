//! Foreground ↔ worker control messages.
//!
//! Every request travels with its own oneshot reply sender, so each one is
//! answered exactly once by either an acknowledgement or an error.

use std::fmt;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::doorbell::DoorbellRinger;
use crate::ring::{RingReader, RingWriter};
use crate::transport::PortOptions;

/// The worker's ends of both channels.
pub struct ChannelHandles {
    /// Bytes the foreground wants written to the device.
    pub outbound: RingReader,
    /// Bytes read from the device for the foreground.
    pub inbound: RingWriter,
    /// Rung after pushing into `inbound`.
    pub data_bell: DoorbellRinger,
    /// Rung after draining `outbound`.
    pub space_bell: DoorbellRinger,
}

impl fmt::Debug for ChannelHandles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandles")
            .field("outbound_cursor", &self.outbound.cursor())
            .field("inbound_cursor", &self.inbound.cursor())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum ControlRequest {
    /// Open the device and start servicing the channels.
    Init {
        options: PortOptions,
        channels: ChannelHandles,
    },
    /// Close the device and stop the worker.
    Close,
    /// Wait up to `timeout` for in-flight inbound bytes to land.
    ClearReadBuffer { timeout: Duration },
}

impl ControlRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlRequest::Init { .. } => "init",
            ControlRequest::Close => "close",
            ControlRequest::ClearReadBuffer { .. } => "clear-read-buffer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlReply {
    Ready,
    Closed,
    Cleared,
    Error(String),
}

/// A request paired with the sender for its reply.
#[derive(Debug)]
pub struct Envelope {
    pub request: ControlRequest,
    pub reply: oneshot::Sender<ControlReply>,
}

impl Envelope {
    pub fn new(request: ControlRequest) -> (Self, oneshot::Receiver<ControlReply>) {
        let (reply, rx) = oneshot::channel();
        (Self { request, reply }, rx)
    }

    /// Split into the request and the handle used to answer it.
    pub fn into_parts(self) -> (ControlRequest, Replier) {
        let replier = Replier {
            kind: self.request.kind(),
            sender: self.reply,
        };
        (self.request, replier)
    }
}

/// Answers one control request.
#[derive(Debug)]
pub struct Replier {
    kind: &'static str,
    sender: oneshot::Sender<ControlReply>,
}

impl Replier {
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Send `reply`, ignoring a requester that stopped listening.
    pub fn send(self, reply: ControlReply) {
        if self.sender.send(reply).is_err() {
            tracing::debug!(request = self.kind, "control reply dropped: requester gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_kinds() {
        assert_eq!(ControlRequest::Close.kind(), "close");
        assert_eq!(
            ControlRequest::ClearReadBuffer {
                timeout: Duration::from_millis(5)
            }
            .kind(),
            "clear-read-buffer"
        );
    }

    #[test]
    fn test_replier_delivers_once() {
        let (env, mut rx) = Envelope::new(ControlRequest::Close);
        let (request, replier) = env.into_parts();
        assert!(matches!(request, ControlRequest::Close));
        assert_eq!(replier.kind(), "close");

        replier.send(ControlReply::Closed);
        assert_eq!(rx.try_recv(), Ok(ControlReply::Closed));
    }

    #[test]
    fn test_replier_tolerates_dropped_requester() {
        let (env, rx) = Envelope::new(ControlRequest::Close);
        drop(rx);
        let (_, replier) = env.into_parts();
        replier.send(ControlReply::Closed);
    }
}

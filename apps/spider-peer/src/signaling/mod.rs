//! Relay channel plumbing: the ordered message channel, the bounded outbound
//! queue that serialises every producer onto it, and the keepalive ticker.

use async_trait::async_trait;
use spider_proto::{DecodeError, Envelope};
use thiserror::Error;

pub mod keepalive;
pub mod memory;
pub mod queue;
pub mod websocket;

pub use keepalive::Keepalive;
pub use queue::{OutboundQueue, QueueError};

/// One inbound frame. A frame that is not a valid envelope is surfaced to the
/// caller rather than failing the channel.
pub type Frame = Result<Envelope, DecodeError>;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid relay url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("tls setup failed: {0}")]
    Tls(#[from] native_tls::Error),
    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("channel closed")]
    Closed,
}

/// Sending half of the relay channel. Owned by the outbound queue's single
/// consumer.
#[async_trait]
pub trait ChannelWriter: Send {
    async fn send(&mut self, envelope: &Envelope) -> Result<(), ChannelError>;

    /// Idempotent.
    async fn close(&mut self) -> Result<(), ChannelError>;
}

/// Receiving half of the relay channel. Frames arrive whole and in order;
/// `Err(ChannelError::Closed)` once the peer or relay has gone away.
#[async_trait]
pub trait ChannelReader: Send {
    async fn receive(&mut self) -> Result<Frame, ChannelError>;
}

//! Peer transport lifecycle contract.
//!
//! The negotiator never touches the peer connection's callbacks directly.
//! Implementations push [`PeerEvent`]s into an unbounded channel from
//! whatever context the underlying library fires them on, and the session
//! loop drains that channel as its single consumer.

use std::fmt;

use async_trait::async_trait;
use spider_proto::CandidateInit;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mock;
pub mod webrtc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE connectivity as reported by the transport. Observed, never set, by the
/// session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectivityState {
    /// States that end the session.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ConnectivityState::Disconnected | ConnectivityState::Failed
        )
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectivityState::New => "new",
            ConnectivityState::Checking => "checking",
            ConnectivityState::Connected => "connected",
            ConnectivityState::Completed => "completed",
            ConnectivityState::Disconnected => "disconnected",
            ConnectivityState::Failed => "failed",
            ConnectivityState::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub kind: MediaKind,
    pub id: String,
    pub stream_id: String,
    pub codec: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    ConnectivityChanged(ConnectivityState),
    /// `None` marks end-of-candidates.
    LocalCandidate(Option<CandidateInit>),
    TrackOpened(TrackInfo),
    DataChannelOpened { label: String },
}

/// Cloneable producer half handed to transport callbacks. Sending never
/// blocks the callback.
#[derive(Debug, Clone)]
pub struct PeerEventSender {
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSender {
    pub fn emit(&self, event: PeerEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!(target = "transport", "peer event dropped; session loop gone");
        }
    }
}

pub type PeerEventReceiver = mpsc::UnboundedReceiver<PeerEvent>;

pub fn event_channel() -> (PeerEventSender, PeerEventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PeerEventSender { tx }, rx)
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("create {kind:?} failed: {reason}")]
    CreateDescription { kind: SdpKind, reason: String },
    #[error("set local description failed: {0}")]
    SetLocal(String),
    #[error("set remote description failed: {0}")]
    SetRemote(String),
    #[error("rollback of local offer failed: {0}")]
    Rollback(String),
    #[error("add remote candidate failed: {0}")]
    AddCandidate(String),
    #[error("transport closed")]
    Closed,
}

/// Operations the negotiator drives on the peer connection.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Builds an answer against the currently applied remote offer.
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// Discards a pending local offer so a remote offer can be applied.
    async fn rollback_local_offer(&self) -> Result<(), PeerError>;

    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), PeerError>;

    async fn close(&self) -> Result<(), PeerError>;
}

use std::fmt;
use std::sync::Arc;

use spider_proto::{CandidateInit, DecodeError, Signal, SignalKind};
use thiserror::Error;
use tokio::sync::watch;

use super::shutdown::{CloseReason, Shutdown};
use crate::signaling::{ChannelError, Frame, OutboundQueue, QueueError};
use crate::transport::{
    ConnectivityState, PeerError, PeerEvent, PeerTransport, SdpKind, SessionDescription,
};

/// Which side creates the first offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Role {
    Initiator,
    Responder,
}

/// Wire form used for locally discovered candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CandidateEncoding {
    /// `candidate2` carrying a JSON candidate record.
    #[default]
    Structured,
    /// `candidate` carrying the bare candidate line.
    Legacy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    AwaitingLocalDescription,
    LocalDescriptionSet,
    AwaitingRemoteAnswer,
    AwaitingRemoteOffer,
    Negotiated,
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::AwaitingLocalDescription => "awaiting-local-description",
            NegotiationState::LocalDescriptionSet => "local-description-set",
            NegotiationState::AwaitingRemoteAnswer => "awaiting-remote-answer",
            NegotiationState::AwaitingRemoteOffer => "awaiting-remote-offer",
            NegotiationState::Negotiated => "negotiated",
            NegotiationState::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("inbound message rejected: {0}")]
    Decode(#[from] DecodeError),
    #[error("unexpected {kind} while {state}")]
    Unexpected {
        kind: SignalKind,
        state: NegotiationState,
    },
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl SessionError {
    /// Malformed or out-of-place messages are dropped; everything else ends
    /// the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SessionError::Decode(_) | SessionError::Unexpected { .. }
        )
    }
}

/// Offer/answer state machine for one session.
///
/// Owns the description slots and candidate bookkeeping; nothing else
/// mutates them. Inbound frames and transport events are fed in by the
/// session loop one at a time.
pub struct Negotiator<T: PeerTransport + ?Sized> {
    role: Role,
    transport: Arc<T>,
    queue: OutboundQueue,
    encoding: CandidateEncoding,
    shutdown: Shutdown,
    state: watch::Sender<NegotiationState>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    pending_remote: Vec<CandidateInit>,
    applied_remote: Vec<CandidateInit>,
    sent_local: usize,
    local_gathering_done: bool,
    connectivity: ConnectivityState,
    reached_negotiated: bool,
}

impl<T: PeerTransport + ?Sized> Negotiator<T> {
    pub fn new(
        role: Role,
        transport: Arc<T>,
        queue: OutboundQueue,
        encoding: CandidateEncoding,
        shutdown: Shutdown,
    ) -> Self {
        let (state, _) = watch::channel(NegotiationState::Idle);
        Self {
            role,
            transport,
            queue,
            encoding,
            shutdown,
            state,
            local: None,
            remote: None,
            pending_remote: Vec::new(),
            applied_remote: Vec::new(),
            sent_local: 0,
            local_gathering_done: false,
            connectivity: ConnectivityState::New,
            reached_negotiated: false,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<NegotiationState> {
        self.state.subscribe()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote.as_ref()
    }

    /// Remote candidates handed to the transport, in the order applied.
    pub fn applied_candidates(&self) -> &[CandidateInit] {
        &self.applied_remote
    }

    /// Remote candidates held until a remote description exists.
    pub fn pending_candidates(&self) -> &[CandidateInit] {
        &self.pending_remote
    }

    pub fn sent_candidates(&self) -> usize {
        self.sent_local
    }

    pub fn local_gathering_done(&self) -> bool {
        self.local_gathering_done
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.connectivity
    }

    pub fn reached_negotiated(&self) -> bool {
        self.reached_negotiated
    }

    fn transition(&mut self, next: NegotiationState) {
        let current = self.state();
        if current == next || current == NegotiationState::Closed {
            return;
        }
        tracing::debug!(target = "signaling", from = %current, to = %next, "negotiation state");
        if next == NegotiationState::Negotiated {
            self.reached_negotiated = true;
            tracing::info!(target = "signaling", role = ?self.role, "negotiated");
        }
        self.state.send_replace(next);
    }

    /// Kicks off the role's opening move: the initiator offers, the responder
    /// waits.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        match self.role {
            Role::Initiator => self.send_offer().await,
            Role::Responder => {
                self.transition(NegotiationState::AwaitingRemoteOffer);
                Ok(())
            }
        }
    }

    async fn send_offer(&mut self) -> Result<(), SessionError> {
        self.transition(NegotiationState::AwaitingLocalDescription);
        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(offer.clone()).await?;
        let sdp = offer.sdp.clone();
        self.local = Some(offer);
        self.transition(NegotiationState::LocalDescriptionSet);
        self.queue.enqueue(Signal::Offer(sdp)).await?;
        self.transition(NegotiationState::AwaitingRemoteAnswer);
        Ok(())
    }

    pub async fn handle_frame(&mut self, frame: Frame) -> Result<(), SessionError> {
        let signal = Signal::decode(&frame?)?;
        self.handle_signal(signal).await
    }

    pub async fn handle_signal(&mut self, signal: Signal) -> Result<(), SessionError> {
        let state = self.state();
        if state == NegotiationState::Closed {
            tracing::trace!(target = "signaling", kind = %signal.kind(), "ignoring message after close");
            return Ok(());
        }
        tracing::debug!(target = "signaling", kind = %signal.kind(), %state, "received");
        match signal {
            Signal::Offer(sdp) => self.accept_offer(sdp).await,
            Signal::Answer(sdp) => self.accept_answer(sdp).await,
            Signal::LegacyCandidate(line) => {
                self.accept_candidate(CandidateInit::from_line(line)).await
            }
            Signal::Candidate(init) => self.accept_candidate(init).await,
            Signal::Ping(_) => {
                tracing::trace!(target = "signaling", "relay ping");
                Ok(())
            }
            Signal::Joins(who) => {
                tracing::info!(target = "signaling", joined = %who, "peer joined channel");
                Ok(())
            }
        }
    }

    async fn accept_offer(&mut self, sdp: String) -> Result<(), SessionError> {
        let pending_local_offer = matches!(
            self.local,
            Some(SessionDescription {
                kind: SdpKind::Offer,
                ..
            })
        ) && matches!(
            self.state(),
            NegotiationState::LocalDescriptionSet | NegotiationState::AwaitingRemoteAnswer
        );
        if pending_local_offer {
            tracing::warn!(target = "signaling", "offer glare; rolling back local offer and answering");
            self.transport.rollback_local_offer().await?;
            self.local = None;
        } else if self.state() == NegotiationState::Negotiated {
            tracing::info!(target = "signaling", "remote renegotiation offer");
        }

        let offer = SessionDescription::offer(sdp);
        self.transport.set_remote_description(offer.clone()).await?;
        self.remote = Some(offer);
        self.flush_pending_candidates().await?;

        self.transition(NegotiationState::AwaitingLocalDescription);
        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;
        let reply = answer.sdp.clone();
        self.local = Some(answer);
        self.transition(NegotiationState::LocalDescriptionSet);
        self.queue.enqueue(Signal::Answer(reply)).await?;
        self.transition(NegotiationState::Negotiated);
        Ok(())
    }

    async fn accept_answer(&mut self, sdp: String) -> Result<(), SessionError> {
        let state = self.state();
        if state != NegotiationState::AwaitingRemoteAnswer {
            return Err(SessionError::Unexpected {
                kind: SignalKind::Answer,
                state,
            });
        }
        let answer = SessionDescription::answer(sdp);
        self.transport.set_remote_description(answer.clone()).await?;
        self.remote = Some(answer);
        self.flush_pending_candidates().await?;
        self.transition(NegotiationState::Negotiated);
        Ok(())
    }

    async fn accept_candidate(&mut self, candidate: CandidateInit) -> Result<(), SessionError> {
        if self.remote.is_none() {
            tracing::debug!(
                target = "signaling",
                held = self.pending_remote.len() + 1,
                "holding remote candidate until remote description is set"
            );
            self.pending_remote.push(candidate);
            return Ok(());
        }
        self.apply_candidate(candidate).await
    }

    async fn apply_candidate(&mut self, candidate: CandidateInit) -> Result<(), SessionError> {
        self.transport.add_remote_candidate(candidate.clone()).await?;
        tracing::trace!(target = "signaling", candidate = %candidate.candidate, "remote candidate applied");
        self.applied_remote.push(candidate);
        Ok(())
    }

    async fn flush_pending_candidates(&mut self) -> Result<(), SessionError> {
        if self.pending_remote.is_empty() {
            return Ok(());
        }
        let held = std::mem::take(&mut self.pending_remote);
        tracing::debug!(target = "signaling", count = held.len(), "applying held remote candidates");
        let mut held = held.into_iter();
        while let Some(candidate) = held.next() {
            if let Err(err) = self.apply_candidate(candidate).await {
                self.pending_remote.extend(held);
                return Err(err);
            }
        }
        Ok(())
    }

    pub async fn handle_peer_event(&mut self, event: PeerEvent) -> Result<(), SessionError> {
        match event {
            PeerEvent::ConnectivityChanged(state) => {
                self.connectivity = state;
                tracing::info!(target = "transport", %state, "connectivity changed");
                if state.is_fatal() {
                    self.close(CloseReason::TransportState(state));
                }
                Ok(())
            }
            PeerEvent::LocalCandidate(Some(candidate)) => {
                if self.state() == NegotiationState::Closed {
                    return Ok(());
                }
                let signal = match self.encoding {
                    CandidateEncoding::Structured => Signal::Candidate(candidate),
                    CandidateEncoding::Legacy => Signal::LegacyCandidate(candidate.candidate),
                };
                self.queue.enqueue(signal).await?;
                self.sent_local += 1;
                Ok(())
            }
            PeerEvent::LocalCandidate(None) => {
                self.local_gathering_done = true;
                tracing::debug!(target = "transport", sent = self.sent_local, "local candidate gathering complete");
                Ok(())
            }
            PeerEvent::TrackOpened(track) => {
                tracing::info!(
                    target = "media",
                    kind = ?track.kind,
                    id = %track.id,
                    stream = %track.stream_id,
                    codec = %track.codec,
                    "remote track opened"
                );
                Ok(())
            }
            PeerEvent::DataChannelOpened { label } => {
                tracing::info!(target = "transport", %label, "data channel opened");
                Ok(())
            }
        }
    }

    /// Enters `Closed` and fires the session's shutdown trigger. Repeat
    /// calls are no-ops.
    pub fn close(&mut self, reason: CloseReason) {
        self.shutdown.trigger(reason);
        self.transition(NegotiationState::Closed);
    }

    /// Moves to `Closed` after someone else fired the trigger.
    pub(crate) fn mark_closed(&mut self) {
        self.transition(NegotiationState::Closed);
    }
}

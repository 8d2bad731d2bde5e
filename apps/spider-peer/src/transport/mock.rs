use async_trait::async_trait;
use parking_lot::Mutex;
use spider_proto::CandidateInit;
use std::sync::Arc;

use super::{
    PeerError, PeerEvent, PeerEventReceiver, PeerEventSender, PeerTransport, SdpKind,
    SessionDescription, event_channel,
};

/// Calls observed by [`MockTransport`], in invocation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    CreateOffer,
    CreateAnswer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    Rollback,
    AddCandidate(CandidateInit),
    Close,
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<MockCall>,
    generated: u32,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    have_local_offer: bool,
    fail_remote: bool,
    fail_candidates: bool,
    closed: bool,
}

/// Scripted peer transport. Descriptions are synthesised as
/// `<label>-offer-<n>` / `<label>-answer-<n>`; tests inject lifecycle events
/// through [`MockTransport::events`].
#[derive(Clone)]
pub struct MockTransport {
    label: String,
    state: Arc<Mutex<MockState>>,
    events: PeerEventSender,
}

impl MockTransport {
    pub fn new(label: impl Into<String>) -> (Self, PeerEventReceiver) {
        let (events, rx) = event_channel();
        let transport = Self {
            label: label.into(),
            state: Arc::new(Mutex::new(MockState::default())),
            events,
        };
        (transport, rx)
    }

    pub fn events(&self) -> PeerEventSender {
        self.events.clone()
    }

    pub fn emit(&self, event: PeerEvent) {
        self.events.emit(event);
    }

    pub fn fail_remote_descriptions(&self) {
        self.state.lock().fail_remote = true;
    }

    pub fn fail_candidates(&self) {
        self.state.lock().fail_candidates = true;
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    pub fn applied_candidates(&self) -> Vec<CandidateInit> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                MockCall::AddCandidate(candidate) => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn next_description(&self, kind: SdpKind) -> SessionDescription {
        let mut state = self.state.lock();
        state.generated += 1;
        let label = match kind {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        };
        SessionDescription {
            kind,
            sdp: format!("{}-{label}-{}", self.label, state.generated),
        }
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.state.lock().calls.push(MockCall::CreateOffer);
        Ok(self.next_description(SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        {
            let mut state = self.state.lock();
            state.calls.push(MockCall::CreateAnswer);
            let has_offer = matches!(
                state.remote,
                Some(SessionDescription {
                    kind: SdpKind::Offer,
                    ..
                })
            );
            if !has_offer {
                return Err(PeerError::CreateDescription {
                    kind: SdpKind::Answer,
                    reason: "no remote offer applied".into(),
                });
            }
        }
        Ok(self.next_description(SdpKind::Answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        state.calls.push(MockCall::SetLocal(desc.clone()));
        state.have_local_offer = desc.kind == SdpKind::Offer;
        state.local = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        state.calls.push(MockCall::SetRemote(desc.clone()));
        if state.fail_remote {
            return Err(PeerError::SetRemote("scripted failure".into()));
        }
        if desc.kind == SdpKind::Offer && state.have_local_offer {
            return Err(PeerError::SetRemote(
                "remote offer while local offer pending".into(),
            ));
        }
        if desc.kind == SdpKind::Answer {
            state.have_local_offer = false;
        }
        state.remote = Some(desc);
        Ok(())
    }

    async fn rollback_local_offer(&self) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        state.calls.push(MockCall::Rollback);
        if !state.have_local_offer {
            return Err(PeerError::Rollback("no pending local offer".into()));
        }
        state.local = None;
        state.have_local_offer = false;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        if state.fail_candidates {
            return Err(PeerError::AddCandidate("scripted failure".into()));
        }
        if state.remote.is_none() {
            return Err(PeerError::AddCandidate("remote description not set".into()));
        }
        state.calls.push(MockCall::AddCandidate(candidate));
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        state.calls.push(MockCall::Close);
        state.closed = true;
        Ok(())
    }
}

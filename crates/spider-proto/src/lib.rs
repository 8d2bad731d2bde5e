//! Wire definitions for the spider relay signaling channel.
//! Kept in a dedicated crate so publisher, viewer and relay tooling share a
//! single encoding of the `{type, data}` envelope without pulling in the
//! media runtime.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raw envelope as it travels over the relay channel.
///
/// `data` is always a string: SDP text for offers/answers, a serialized
/// [`CandidateInit`] for `candidate2`, or a bare candidate line for the
/// legacy `candidate` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: String,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data: data.into(),
        }
    }

    pub fn from_json(text: &str) -> Result<Self, DecodeError> {
        serde_json::from_str(text).map_err(DecodeError::MalformedEnvelope)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice(bytes).map_err(DecodeError::MalformedEnvelope)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Closed set of envelope tags understood by this build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Offer,
    Answer,
    /// Bare candidate line, emitted by older publisher builds.
    LegacyCandidate,
    /// JSON-encoded [`CandidateInit`].
    Candidate,
    Ping,
    Joins,
}

impl SignalKind {
    pub const ALL: [SignalKind; 6] = [
        SignalKind::Offer,
        SignalKind::Answer,
        SignalKind::LegacyCandidate,
        SignalKind::Candidate,
        SignalKind::Ping,
        SignalKind::Joins,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::LegacyCandidate => "candidate",
            SignalKind::Candidate => "candidate2",
            SignalKind::Ping => "ping",
            SignalKind::Joins => "joins",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured connectivity candidate, field-compatible with the browser
/// `RTCIceCandidateInit` dictionary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl CandidateInit {
    pub fn from_line(line: impl Into<String>) -> Self {
        Self {
            candidate: line.into(),
            ..Default::default()
        }
    }
}

/// Typed view of an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Offer(String),
    Answer(String),
    LegacyCandidate(String),
    Candidate(CandidateInit),
    Ping(String),
    Joins(String),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[source] serde_json::Error),
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("malformed {kind} payload: {source}")]
    MalformedData {
        kind: SignalKind,
        #[source]
        source: serde_json::Error,
    },
    #[error("empty {kind} payload")]
    EmptyPayload { kind: SignalKind },
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::Offer(_) => SignalKind::Offer,
            Signal::Answer(_) => SignalKind::Answer,
            Signal::LegacyCandidate(_) => SignalKind::LegacyCandidate,
            Signal::Candidate(_) => SignalKind::Candidate,
            Signal::Ping(_) => SignalKind::Ping,
            Signal::Joins(_) => SignalKind::Joins,
        }
    }

    pub fn keepalive() -> Self {
        Signal::Ping(String::new())
    }

    /// Lenient decode: the caller logs and drops on error, the receive loop
    /// keeps running.
    pub fn decode(envelope: &Envelope) -> Result<Self, DecodeError> {
        let kind = SignalKind::parse(&envelope.kind)
            .ok_or_else(|| DecodeError::UnknownType(envelope.kind.clone()))?;
        let data = &envelope.data;
        match kind {
            SignalKind::Offer | SignalKind::Answer | SignalKind::LegacyCandidate
                if data.trim().is_empty() =>
            {
                Err(DecodeError::EmptyPayload { kind })
            }
            SignalKind::Offer => Ok(Signal::Offer(data.clone())),
            SignalKind::Answer => Ok(Signal::Answer(data.clone())),
            SignalKind::LegacyCandidate => Ok(Signal::LegacyCandidate(data.clone())),
            SignalKind::Candidate => serde_json::from_str(data)
                .map(Signal::Candidate)
                .map_err(|source| DecodeError::MalformedData { kind, source }),
            SignalKind::Ping => Ok(Signal::Ping(data.clone())),
            SignalKind::Joins => Ok(Signal::Joins(data.clone())),
        }
    }

    pub fn encode(&self) -> Result<Envelope, serde_json::Error> {
        let data = match self {
            Signal::Offer(sdp) | Signal::Answer(sdp) => sdp.clone(),
            Signal::LegacyCandidate(line) => line.clone(),
            Signal::Candidate(init) => serde_json::to_string(init)?,
            Signal::Ping(text) | Signal::Joins(text) => text.clone(),
        };
        Ok(Envelope::new(self.kind().as_str(), data))
    }

    /// Candidate carried by either encoding, normalised to the structured form.
    pub fn candidate(&self) -> Option<CandidateInit> {
        match self {
            Signal::LegacyCandidate(line) => Some(CandidateInit::from_line(line.clone())),
            Signal::Candidate(init) => Some(init.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_keeps_sdp_verbatim() {
        let sdp = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\n";
        let envelope = Signal::Offer(sdp.to_string()).encode().unwrap();
        assert_eq!(envelope.kind, "offer");
        assert_eq!(envelope.data, sdp);
        let value: serde_json::Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(value, serde_json::json!({ "type": "offer", "data": sdp }));
    }

    #[test]
    fn structured_candidate_uses_browser_field_names() {
        let init = CandidateInit {
            candidate: "candidate:1 1 udp 2130706431 10.0.0.2 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: Some("abcd".into()),
        };
        let envelope = Signal::Candidate(init.clone()).encode().unwrap();
        assert_eq!(envelope.kind, "candidate2");
        let value: serde_json::Value = serde_json::from_str(&envelope.data).unwrap();
        assert_eq!(value["sdpMLineIndex"], 0);
        assert_eq!(value["sdpMid"], "0");
        assert_eq!(value["usernameFragment"], "abcd");
        assert_eq!(Signal::decode(&envelope).unwrap(), Signal::Candidate(init));
    }

    #[test]
    fn decodes_candidate_without_optional_fields() {
        let envelope = Envelope::new("candidate2", r#"{"candidate":"candidate:2 1 udp 1 1.2.3.4 9 typ srflx"}"#);
        match Signal::decode(&envelope).unwrap() {
            Signal::Candidate(init) => {
                assert_eq!(init.sdp_mid, None);
                assert_eq!(init.sdp_mline_index, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn legacy_candidate_normalises_to_structured() {
        let signal = Signal::decode(&Envelope::new("candidate", "candidate:3 1 tcp 5 1.1.1.1 80 typ host"))
            .unwrap();
        assert_eq!(signal.kind(), SignalKind::LegacyCandidate);
        assert_eq!(
            signal.candidate().unwrap().candidate,
            "candidate:3 1 tcp 5 1.1.1.1 80 typ host"
        );
    }

    #[test]
    fn malformed_structured_candidate_is_reported() {
        let err = Signal::decode(&Envelope::new("candidate2", "{not json")).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::MalformedData {
                kind: SignalKind::Candidate,
                ..
            }
        ));
    }

    #[test]
    fn unknown_type_is_reported_not_panicked() {
        let err = Signal::decode(&Envelope::new("bye", "")).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownType(tag) if tag == "bye"));
    }

    #[test]
    fn empty_answer_is_rejected() {
        let err = Signal::decode(&Envelope::new("answer", "  ")).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::EmptyPayload {
                kind: SignalKind::Answer
            }
        ));
    }

    #[test]
    fn envelope_without_data_defaults_to_empty() {
        let envelope = Envelope::from_json(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(Signal::decode(&envelope).unwrap(), Signal::Ping(String::new()));
        assert!(matches!(
            Envelope::from_json("[1,2]"),
            Err(DecodeError::MalformedEnvelope(_))
        ));
    }
}

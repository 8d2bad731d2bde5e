//! [`PeerTransport`] over a webrtc-rs `RTCPeerConnection`.
//!
//! Every library callback is translated into a [`PeerEvent`] on the event
//! channel; media tasks (file feeds, recorders) hang off the same callbacks
//! and stop with the peer.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use spider_proto::CandidateInit;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use webrtc::api::{API, APIBuilder};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

pub mod config;

pub use config::{IcePolicy, PeerConfig, PeerConfigBuilder, TurnCredentials};

use super::{
    ConnectivityState, MediaKind, PeerError, PeerEvent, PeerEventReceiver, PeerEventSender,
    PeerTransport, SdpKind, SessionDescription, TrackInfo, event_channel,
};
use crate::media::sink::{self, TrackRecorder};
use crate::media::source::{self, LocalTrack};
use crate::media::{MediaPlan, PublishPlan, ReceivePlan};

const STREAM_ID: &str = "spider";
const RTCP_READ_BUFFER: usize = 1500;

/// One `RTCPeerConnection` and the token that stops everything hanging off
/// its callbacks.
#[derive(Clone)]
struct Link {
    peer_connection: Arc<RTCPeerConnection>,
    stop: CancellationToken,
}

/// What every peer connection built by an [`RtcPeer`] is wired with.
struct Wiring {
    api: API,
    config: PeerConfig,
    media: MediaPlan,
    events: PeerEventSender,
    connected: Arc<watch::Sender<bool>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

/// webrtc-rs cannot roll a local offer back, so glare swaps in a freshly
/// wired peer connection instead.
pub struct RtcPeer {
    wiring: Wiring,
    link: Mutex<Link>,
}

impl RtcPeer {
    pub async fn new(
        config: PeerConfig,
        media: MediaPlan,
    ) -> Result<(Self, PeerEventReceiver), PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PeerError::Setup(format!("register codecs: {e}")))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| PeerError::Setup(format!("register interceptors: {e}")))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let (events, rx) = event_channel();
        let (connected, _) = watch::channel(false);
        let wiring = Wiring {
            api,
            config,
            media,
            events,
            connected: Arc::new(connected),
            tasks: Arc::new(Mutex::new(Vec::new())),
        };
        let link = wiring.open().await?;
        Ok((
            Self {
                wiring,
                link: Mutex::new(link),
            },
            rx,
        ))
    }

    fn peer_connection(&self) -> Arc<RTCPeerConnection> {
        Arc::clone(&self.link.lock().peer_connection)
    }
}

impl Wiring {
    async fn open(&self) -> Result<Link, PeerError> {
        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(self.config.rtc_configuration())
                .await
                .map_err(|e| PeerError::Setup(format!("create peer connection: {e}")))?,
        );
        tracing::debug!(
            target = "transport",
            ice_servers = self.config.ice_servers.len(),
            policy = ?self.config.ice_policy,
            "peer connection created"
        );
        let link = Link {
            peer_connection,
            stop: CancellationToken::new(),
        };

        self.watch_connectivity(&link);
        self.forward_candidates(&link);
        self.watch_data_channels(&link);
        match &self.media {
            MediaPlan::Publish(plan) => self.attach_local_tracks(&link, plan).await?,
            MediaPlan::Receive(plan) => self.attach_receivers(&link, plan).await?,
        }
        Ok(link)
    }

    fn watch_connectivity(&self, link: &Link) {
        let events = self.events.clone();
        let connected = Arc::clone(&self.connected);
        let stop = link.stop.clone();
        link.peer_connection
            .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                if !stop.is_cancelled() {
                    if let Some(mapped) = connectivity_from_ice(state) {
                        if matches!(
                            mapped,
                            ConnectivityState::Connected | ConnectivityState::Completed
                        ) {
                            connected.send_replace(true);
                        }
                        events.emit(PeerEvent::ConnectivityChanged(mapped));
                    }
                }
                Box::pin(async {})
            }));
    }

    fn forward_candidates(&self, link: &Link) {
        let events = self.events.clone();
        let stop = link.stop.clone();
        link.peer_connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                // a replaced connection may still finish gathering
                if !stop.is_cancelled() {
                    match candidate.map(|candidate| candidate.to_json()) {
                        None => events.emit(PeerEvent::LocalCandidate(None)),
                        Some(Ok(init)) => {
                            events.emit(PeerEvent::LocalCandidate(Some(from_rtc_candidate(init))))
                        }
                        Some(Err(err)) => {
                            tracing::warn!(target = "transport", error = %err, "cannot serialise local candidate")
                        }
                    }
                }
                Box::pin(async {})
            }));
    }

    fn watch_data_channels(&self, link: &Link) {
        let events = self.events.clone();
        link.peer_connection
            .on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                let events = events.clone();
                Box::pin(async move {
                    let label = channel.label().to_string();
                    let open_label = label.clone();
                    channel.on_open(Box::new(move || {
                        events.emit(PeerEvent::DataChannelOpened { label: open_label });
                        Box::pin(async {})
                    }));
                    channel.on_message(Box::new(move |message: DataChannelMessage| {
                        tracing::debug!(
                            target = "transport",
                            label = %label,
                            bytes = message.data.len(),
                            text = message.is_string,
                            "data channel message"
                        );
                        Box::pin(async {})
                    }));
                })
            }));
    }

    async fn attach_local_tracks(&self, link: &Link, plan: &PublishPlan) -> Result<(), PeerError> {
        for LocalTrack { kind, track, feed } in source::local_tracks(plan, STREAM_ID) {
            let transceiver = link
                .peer_connection
                .add_transceiver_from_track(
                    Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Sendonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(|e| PeerError::Setup(format!("add {kind:?} track: {e}")))?;
            tracing::info!(target = "media", kind = ?kind, track = %track.id(), "local track attached");

            let sender = transceiver.sender().await;
            let stop = link.stop.clone();
            self.track_task(tokio::spawn(async move {
                let mut buf = vec![0u8; RTCP_READ_BUFFER];
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        read = sender.read(&mut buf) => if read.is_err() { break },
                    }
                }
            }));

            if let Some(path) = feed {
                self.track_task(source::spawn_feed(
                    track,
                    path,
                    plan.frame_interval,
                    self.connected.subscribe(),
                    link.stop.clone(),
                ));
            }
        }
        Ok(())
    }

    async fn attach_receivers(&self, link: &Link, plan: &ReceivePlan) -> Result<(), PeerError> {
        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            link.peer_connection
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(|e| PeerError::Setup(format!("add {kind:?} receiver: {e}")))?;
        }

        let events = self.events.clone();
        let stop = link.stop.clone();
        let tasks = Arc::clone(&self.tasks);
        let record_dir = plan.record_dir.clone();
        link.peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let codec = track.codec();
                let kind = match track.kind() {
                    RTPCodecType::Audio => MediaKind::Audio,
                    _ => MediaKind::Video,
                };
                let info = TrackInfo {
                    kind,
                    id: track.id(),
                    stream_id: track.stream_id(),
                    codec: codec.capability.mime_type.clone(),
                };
                let recorder = match record_dir.as_deref() {
                    Some(dir) => match TrackRecorder::create(dir, &info.id, &info.codec) {
                        Ok(recorder) => recorder,
                        Err(err) => {
                            tracing::warn!(target = "media", error = %err, "not recording track");
                            None
                        }
                    },
                    None => None,
                };
                events.emit(PeerEvent::TrackOpened(info));
                tasks.lock().push(sink::spawn_drain(track, recorder, stop.clone()));
                Box::pin(async {})
            },
        ));
        Ok(())
    }

    fn track_task(&self, task: JoinHandle<()>) {
        self.tasks.lock().push(task);
    }
}

fn connectivity_from_ice(state: RTCIceConnectionState) -> Option<ConnectivityState> {
    match state {
        RTCIceConnectionState::New => Some(ConnectivityState::New),
        RTCIceConnectionState::Checking => Some(ConnectivityState::Checking),
        RTCIceConnectionState::Connected => Some(ConnectivityState::Connected),
        RTCIceConnectionState::Completed => Some(ConnectivityState::Completed),
        RTCIceConnectionState::Disconnected => Some(ConnectivityState::Disconnected),
        RTCIceConnectionState::Failed => Some(ConnectivityState::Failed),
        RTCIceConnectionState::Closed => Some(ConnectivityState::Closed),
        _ => None,
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> CandidateInit {
    CandidateInit {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_rtc_candidate(init: CandidateInit) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, webrtc::Error> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    }
}

#[async_trait]
impl PeerTransport for RtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self
            .peer_connection()
            .create_offer(None)
            .await
            .map_err(|e| PeerError::CreateDescription {
                kind: SdpKind::Offer,
                reason: e.to_string(),
            })?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .peer_connection()
            .create_answer(None)
            .await
            .map_err(|e| PeerError::CreateDescription {
                kind: SdpKind::Answer,
                reason: e.to_string(),
            })?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let desc = to_rtc_description(desc).map_err(|e| PeerError::SetLocal(e.to_string()))?;
        self.peer_connection()
            .set_local_description(desc)
            .await
            .map_err(|e| PeerError::SetLocal(e.to_string()))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let desc = to_rtc_description(desc).map_err(|e| PeerError::SetRemote(e.to_string()))?;
        self.peer_connection()
            .set_remote_description(desc)
            .await
            .map_err(|e| PeerError::SetRemote(e.to_string()))
    }

    async fn rollback_local_offer(&self) -> Result<(), PeerError> {
        if self.peer_connection().pending_local_description().await.is_none() {
            return Err(PeerError::Rollback("no pending local offer".into()));
        }
        let fresh = self
            .wiring
            .open()
            .await
            .map_err(|e| PeerError::Rollback(e.to_string()))?;
        self.wiring.connected.send_replace(false);
        let replaced = std::mem::replace(&mut *self.link.lock(), fresh);
        replaced.stop.cancel();
        if let Err(err) = replaced.peer_connection.close().await {
            tracing::debug!(target = "transport", error = %err, "replaced peer connection close failed");
        }
        tracing::info!(target = "transport", "local offer discarded with its peer connection");
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), PeerError> {
        self.peer_connection()
            .add_ice_candidate(to_rtc_candidate(candidate))
            .await
            .map_err(|e| PeerError::AddCandidate(e.to_string()))
    }

    async fn close(&self) -> Result<(), PeerError> {
        let link = self.link.lock().clone();
        link.stop.cancel();
        let result = link
            .peer_connection
            .close()
            .await
            .map_err(|e| PeerError::Setup(format!("close: {e}")));
        let tasks = std::mem::take(&mut *self.wiring.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                tracing::debug!(target = "media", error = %err, "media task ended abnormally");
            }
        }
        tracing::debug!(target = "transport", "peer connection closed");
        result
    }
}

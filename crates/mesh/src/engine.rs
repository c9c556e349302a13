//! Peer-engine seam: the connection manager talks to the local media engine
//! through [`PeerEngine`] so tests can substitute a scripted implementation.
//! The production implementation wraps the `webrtc` crate.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

use crate::config::{IceServer, MeshConfig};
use crate::error::TransportError;

/// Opaque handle to locally captured media. The core never touches capture
/// APIs; the UI layer supplies the tracks.
#[derive(Clone, Default)]
pub struct MediaHandle {
    pub tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
}

impl MediaHandle {
    pub fn new(tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>) -> Self {
        Self { tracks }
    }
}

impl std::fmt::Debug for MediaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaHandle")
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

/// Connection-level signals surfaced by an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineSignal {
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events flowing out of an engine toward the connection manager.
#[derive(Debug)]
pub enum EngineEvent {
    StateChanged(EngineSignal),
    /// Locally gathered ICE candidate, ready to be sent to the remote peer.
    LocalCandidate(serde_json::Value),
}

/// Creation-time knobs. Relay-only is a creation parameter: the recovery
/// ladder recreates the engine rather than mutating a live one.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineOptions {
    pub relay_only: bool,
}

/// Serialized ICE candidate as carried in envelope payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidateBlob {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
}

/// Session-negotiation and candidate application surface of a single peer
/// connection. One engine per remote peer.
#[async_trait]
pub trait PeerEngine: Send + Sync {
    /// Produce a local offer; `ice_restart` requests fresh credentials while
    /// preserving connection identity.
    async fn create_offer(&self, ice_restart: bool) -> Result<serde_json::Value, TransportError>;

    /// Apply a remote offer and produce the local answer.
    async fn create_answer(
        &self,
        remote_offer: &serde_json::Value,
    ) -> Result<serde_json::Value, TransportError>;

    /// Apply a remote answer to an outstanding local offer.
    async fn apply_answer(&self, answer: &serde_json::Value) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: &serde_json::Value)
        -> Result<(), TransportError>;

    async fn attach_media(&self, media: &MediaHandle) -> Result<(), TransportError>;

    async fn close(&self);
}

/// Constructor-injected engine factory; the manager never news up engines
/// directly.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(
        &self,
        options: EngineOptions,
    ) -> Result<(Arc<dyn PeerEngine>, mpsc::UnboundedReceiver<EngineEvent>), TransportError>;
}

fn build_api() -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(TransportError::setup)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(TransportError::setup)?;

    Ok(APIBuilder::new()
        .with_setting_engine(SettingEngine::default())
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn to_rtc_ice_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone(),
            credential: server.credential.clone(),
            ..Default::default()
        })
        .collect()
}

/// Production engine backed by `webrtc::RTCPeerConnection`.
pub struct WebRtcEngine {
    connection: Arc<RTCPeerConnection>,
}

impl WebRtcEngine {
    pub async fn new(
        config: &MeshConfig,
        options: EngineOptions,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Self, TransportError> {
        let api = build_api()?;

        let rtc_config = RTCConfiguration {
            ice_servers: to_rtc_ice_servers(&config.ice_servers),
            ice_transport_policy: if options.relay_only {
                RTCIceTransportPolicy::Relay
            } else {
                RTCIceTransportPolicy::All
            },
            ..Default::default()
        };

        let connection = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(TransportError::setup)?,
        );

        let state_events = events.clone();
        connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let events = state_events.clone();
                Box::pin(async move {
                    tracing::debug!(target = "mesh", ?state, "peer connection state changed");
                    let signal = match state {
                        RTCPeerConnectionState::Connected => Some(EngineSignal::Connected),
                        RTCPeerConnectionState::Disconnected => Some(EngineSignal::Disconnected),
                        RTCPeerConnectionState::Failed => Some(EngineSignal::Failed),
                        RTCPeerConnectionState::Closed => Some(EngineSignal::Closed),
                        _ => None,
                    };
                    if let Some(signal) = signal {
                        let _ = events.send(EngineEvent::StateChanged(signal));
                    }
                })
            },
        ));

        let candidate_events = events;
        connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let blob = IceCandidateBlob {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        };
                        if let Ok(value) = serde_json::to_value(&blob) {
                            let _ = events.send(EngineEvent::LocalCandidate(value));
                        }
                    }
                    Err(err) => {
                        tracing::warn!(target = "mesh", %err, "failed to serialize ice candidate");
                    }
                }
            })
        }));

        Ok(Self { connection })
    }

    fn sdp_value(description: &RTCSessionDescription) -> serde_json::Value {
        serde_json::json!({ "sdp": description.sdp })
    }

    fn sdp_text(value: &serde_json::Value) -> Result<String, TransportError> {
        value
            .get("sdp")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| TransportError::Negotiation("payload missing sdp".into()))
    }
}

#[async_trait]
impl PeerEngine for WebRtcEngine {
    async fn create_offer(&self, ice_restart: bool) -> Result<serde_json::Value, TransportError> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self
            .connection
            .create_offer(Some(options))
            .await
            .map_err(TransportError::negotiation)?;
        self.connection
            .set_local_description(offer.clone())
            .await
            .map_err(TransportError::negotiation)?;
        Ok(Self::sdp_value(&offer))
    }

    async fn create_answer(
        &self,
        remote_offer: &serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        let offer = RTCSessionDescription::offer(Self::sdp_text(remote_offer)?)
            .map_err(TransportError::negotiation)?;
        self.connection
            .set_remote_description(offer)
            .await
            .map_err(TransportError::negotiation)?;
        let answer = self
            .connection
            .create_answer(None)
            .await
            .map_err(TransportError::negotiation)?;
        self.connection
            .set_local_description(answer.clone())
            .await
            .map_err(TransportError::negotiation)?;
        Ok(Self::sdp_value(&answer))
    }

    async fn apply_answer(&self, answer: &serde_json::Value) -> Result<(), TransportError> {
        let description = RTCSessionDescription::answer(Self::sdp_text(answer)?)
            .map_err(TransportError::negotiation)?;
        self.connection
            .set_remote_description(description)
            .await
            .map_err(TransportError::negotiation)
    }

    async fn add_ice_candidate(
        &self,
        candidate: &serde_json::Value,
    ) -> Result<(), TransportError> {
        let blob: IceCandidateBlob =
            serde_json::from_value(candidate.clone()).map_err(TransportError::negotiation)?;
        let init = RTCIceCandidateInit {
            candidate: blob.candidate,
            sdp_mid: blob.sdp_mid,
            sdp_mline_index: blob.sdp_mline_index,
            username_fragment: None,
        };
        self.connection
            .add_ice_candidate(init)
            .await
            .map_err(TransportError::negotiation)
    }

    async fn attach_media(&self, media: &MediaHandle) -> Result<(), TransportError> {
        for track in &media.tracks {
            self.connection
                .add_track(Arc::clone(track))
                .await
                .map_err(TransportError::setup)?;
        }
        Ok(())
    }

    async fn close(&self) {
        if let Err(err) = self.connection.close().await {
            tracing::debug!(target = "mesh", %err, "peer connection close");
        }
    }
}

/// Factory producing `webrtc`-backed engines from a shared config.
pub struct WebRtcEngineFactory {
    config: MeshConfig,
}

impl WebRtcEngineFactory {
    pub fn new(config: MeshConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl EngineFactory for WebRtcEngineFactory {
    async fn create(
        &self,
        options: EngineOptions,
    ) -> Result<(Arc<dyn PeerEngine>, mpsc::UnboundedReceiver<EngineEvent>), TransportError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let engine = WebRtcEngine::new(&self.config, options, events_tx).await?;
        Ok((Arc::new(engine), events_rx))
    }
}

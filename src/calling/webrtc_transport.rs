//! Media transport backed by the pure-Rust webrtc stack.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use crate::calling::envelope::{CallKind, CandidateInit};
use crate::calling::media::{
    MediaTransport, MediaTransportFactory, RemoteTrack, TrackKind, TransportEvent, TransportState,
};
use crate::config::CallConfig;
use crate::errors::MediaError;

fn negotiation_err(context: &str, err: webrtc::Error) -> MediaError {
    MediaError::Negotiation(format!("{context}: {err}"))
}

fn map_pc_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        _ => None,
    }
}

/// Builds [`WebRtcTransport`]s from the configured ICE servers.
pub struct WebRtcFactory {
    config: CallConfig,
}

impl WebRtcFactory {
    pub fn new(config: CallConfig) -> Self {
        Self { config }
    }

    fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut servers: Vec<RTCIceServer> = self
            .config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();
        for turn in &self.config.turn_servers {
            servers.push(RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }
        servers
    }
}

#[async_trait]
impl MediaTransportFactory for WebRtcFactory {
    async fn create(
        &self,
        kind: CallKind,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn MediaTransport>, MediaError> {
        let transport = WebRtcTransport::new(kind, self.ice_servers(), events).await?;
        Ok(Arc::new(transport))
    }
}

/// One peer connection with a local opus track and, for video calls, a
/// VP8 track whose source can be swapped between camera and screen.
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    audio_enabled: Arc<AtomicBool>,
    video_enabled: Arc<AtomicBool>,
    video: Option<VideoSender>,
}

struct VideoSender {
    sender: Arc<RTCRtpSender>,
    camera_track: Arc<TrackLocalStaticRTP>,
    screen_track: Mutex<Option<Arc<TrackLocalStaticRTP>>>,
}

impl WebRtcTransport {
    async fn new(
        kind: CallKind,
        ice_servers: Vec<RTCIceServer>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| negotiation_err("register codecs", e))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| negotiation_err("register interceptors", e))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .map_err(|e| negotiation_err("create peer connection", e))?,
        );

        let audio_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_string(),
            "microphone".to_string(),
        ));
        let audio_sender = pc
            .add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| negotiation_err("add audio track", e))?;
        spawn_rtcp_drain(audio_sender);

        let video = if kind == CallKind::Video {
            let camera_track = Arc::new(TrackLocalStaticRTP::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_string(),
                    clock_rate: 90000,
                    ..Default::default()
                },
                "video".to_string(),
                "camera".to_string(),
            ));
            let sender = pc
                .add_track(Arc::clone(&camera_track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| negotiation_err("add video track", e))?;
            spawn_rtcp_drain(Arc::clone(&sender));
            Some(VideoSender {
                sender,
                camera_track,
                screen_track: Mutex::new(None),
            })
        } else {
            None
        };

        wire_handlers(&pc, events);

        Ok(Self {
            pc,
            audio_enabled: Arc::new(AtomicBool::new(true)),
            video_enabled: Arc::new(AtomicBool::new(true)),
            video,
        })
    }

    /// Whether the RTP writer for this track kind should currently be
    /// pushing packets. Capture pipelines poll this between frames.
    pub fn is_track_enabled(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Audio => self.audio_enabled.load(Ordering::SeqCst),
            TrackKind::Video => self.video_enabled.load(Ordering::SeqCst),
        }
    }

    /// Whether the video sender currently carries the same track object
    /// the transport was created with.
    #[cfg(test)]
    async fn sends_camera_track(&self) -> bool {
        let Some(video) = self.video.as_ref() else {
            return false;
        };
        match video.sender.track().await {
            Some(track) => std::ptr::eq(
                Arc::as_ptr(&track) as *const (),
                Arc::as_ptr(&video.camera_track) as *const (),
            ),
            None => false,
        }
    }
}

/// Read loop required by webrtc-rs so interceptors see sender RTCP.
fn spawn_rtcp_drain(sender: Arc<RTCRtpSender>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while let Ok((_, _)) = sender.read(&mut buf).await {}
    });
}

fn wire_handlers(pc: &Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<TransportEvent>) {
    let candidate_events = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let candidate_events = candidate_events.clone();
        Box::pin(async move {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidate_events.send(TransportEvent::LocalCandidate(
                            CandidateInit {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            },
                        ));
                    }
                    Err(e) => warn!("failed to serialize local candidate: {e}"),
                }
            }
        })
    }));

    let state_events = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state| {
        debug!(?state, "peer connection state changed");
        let state_events = state_events.clone();
        Box::pin(async move {
            if let Some(mapped) = map_pc_state(state) {
                let _ = state_events.send(TransportEvent::ConnectionState(mapped));
            }
        })
    }));

    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let kind = if track.kind() == webrtc::rtp_transceiver::rtp_codec::RTPCodecType::Video {
            TrackKind::Video
        } else {
            TrackKind::Audio
        };
        let _ = events.send(TransportEvent::RemoteTrack(RemoteTrack {
            id: track.id(),
            kind,
        }));
        Box::pin(async {})
    }));
}

#[async_trait]
impl MediaTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<String, MediaError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| negotiation_err("create offer", e))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| negotiation_err("set local offer", e))?;
        Ok(offer.sdp)
    }

    async fn accept_offer(&self, offer: &str) -> Result<String, MediaError> {
        let remote = RTCSessionDescription::offer(offer.to_string())
            .map_err(|e| negotiation_err("parse remote offer", e))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| negotiation_err("set remote offer", e))?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| negotiation_err("create answer", e))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| negotiation_err("set local answer", e))?;
        Ok(answer.sdp)
    }

    async fn apply_remote_answer(&self, answer: &str) -> Result<(), MediaError> {
        let remote = RTCSessionDescription::answer(answer.to_string())
            .map_err(|e| negotiation_err("parse remote answer", e))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| negotiation_err("set remote answer", e))
    }

    async fn add_remote_candidate(&self, candidate: &CandidateInit) -> Result<(), MediaError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| negotiation_err("add remote candidate", e))
    }

    async fn start_screen_share(&self) -> Result<(), MediaError> {
        let video = self.video.as_ref().ok_or(MediaError::NoVideoTrack)?;
        let mut screen = video.screen_track.lock().await;
        if screen.is_some() {
            return Ok(());
        }
        // Same VP8 parameters as the camera track, so no renegotiation
        // is needed when swapping the sender's source.
        let track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
            "video".to_string(),
            "screen".to_string(),
        ));
        video
            .sender
            .replace_track(Some(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(|e| negotiation_err("replace track with screen", e))?;
        *screen = Some(track);
        Ok(())
    }

    async fn stop_screen_share(&self) -> Result<(), MediaError> {
        let video = self.video.as_ref().ok_or(MediaError::NoVideoTrack)?;
        let mut screen = video.screen_track.lock().await;
        if screen.take().is_none() {
            return Ok(());
        }
        video
            .sender
            .replace_track(Some(
                Arc::clone(&video.camera_track) as Arc<dyn TrackLocal + Send + Sync>
            ))
            .await
            .map_err(|e| negotiation_err("restore camera track", e))
    }

    async fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> Result<(), MediaError> {
        match kind {
            TrackKind::Audio => self.audio_enabled.store(enabled, Ordering::SeqCst),
            TrackKind::Video => {
                if self.video.is_none() {
                    return Err(MediaError::NoVideoTrack);
                }
                self.video_enabled.store(enabled, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.pc
            .close()
            .await
            .map_err(|e| negotiation_err("close peer connection", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CallConfig;

    fn local_factory() -> WebRtcFactory {
        // No STUN servers so tests never touch the network.
        WebRtcFactory::new(CallConfig {
            stun_servers: Vec::new(),
            ..CallConfig::default()
        })
    }

    #[tokio::test]
    async fn offer_answer_exchange_without_network() {
        let factory = local_factory();
        let (caller_tx, _caller_rx) = mpsc::unbounded_channel();
        let (callee_tx, _callee_rx) = mpsc::unbounded_channel();
        let caller = factory.create(CallKind::Audio, caller_tx).await.unwrap();
        let callee = factory.create(CallKind::Audio, callee_tx).await.unwrap();

        let offer = caller.create_offer().await.unwrap();
        assert!(offer.contains("v=0"));
        let answer = callee.accept_offer(&offer).await.unwrap();
        assert!(answer.contains("v=0"));
        caller.apply_remote_answer(&answer).await.unwrap();

        caller.close().await.unwrap();
        callee.close().await.unwrap();
    }

    #[tokio::test]
    async fn video_call_supports_share_and_pause() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = WebRtcTransport::new(CallKind::Video, Vec::new(), tx)
            .await
            .unwrap();

        assert!(transport.sends_camera_track().await);
        transport.start_screen_share().await.unwrap();
        // Starting twice is a no-op rather than an error.
        transport.start_screen_share().await.unwrap();
        assert!(!transport.sends_camera_track().await);

        transport.stop_screen_share().await.unwrap();
        transport.stop_screen_share().await.unwrap();
        // The sender holds the original camera track object again, so
        // no renegotiation happened on the way back.
        assert!(transport.sends_camera_track().await);

        transport
            .set_track_enabled(TrackKind::Video, false)
            .await
            .unwrap();
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn audio_call_rejects_video_operations() {
        let factory = local_factory();
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = factory.create(CallKind::Audio, tx).await.unwrap();

        assert!(matches!(
            transport.start_screen_share().await,
            Err(MediaError::NoVideoTrack)
        ));
        assert!(matches!(
            transport.set_track_enabled(TrackKind::Video, false).await,
            Err(MediaError::NoVideoTrack)
        ));
        transport.close().await.unwrap();
    }
}

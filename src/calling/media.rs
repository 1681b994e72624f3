use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::calling::envelope::{CallKind, CandidateInit};
use crate::errors::MediaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Connection state reported by the media layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// A track the peer started sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Asynchronous notifications from a transport to its owner.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A local ICE candidate was gathered and must be relayed.
    LocalCandidate(CandidateInit),
    ConnectionState(TransportState),
    RemoteTrack(RemoteTrack),
    /// Screen capture ended outside our control (source closed).
    ScreenShareStopped,
}

/// The negotiation surface of one peer connection. Implemented for
/// real WebRTC and for the in-memory test transport.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Produce the local offer SDP and set it as local description.
    async fn create_offer(&self) -> Result<String, MediaError>;

    /// Apply the remote offer and produce the local answer SDP.
    async fn accept_offer(&self, offer: &str) -> Result<String, MediaError>;

    /// Apply the remote answer to our outstanding offer.
    async fn apply_remote_answer(&self, answer: &str) -> Result<(), MediaError>;

    /// Add one remote ICE candidate. Callers must only invoke this
    /// after a remote description has been applied.
    async fn add_remote_candidate(&self, candidate: &CandidateInit) -> Result<(), MediaError>;

    /// Swap the outgoing video source to screen capture.
    async fn start_screen_share(&self) -> Result<(), MediaError>;

    /// Restore the camera as the outgoing video source.
    async fn stop_screen_share(&self) -> Result<(), MediaError>;

    /// Pause or resume an outgoing track without renegotiating.
    async fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> Result<(), MediaError>;

    /// Tear down the connection and release capture devices.
    async fn close(&self) -> Result<(), MediaError>;
}

/// Builds transports on demand. Device acquisition happens here, so a
/// missing microphone or camera fails the call before any signaling.
#[async_trait]
pub trait MediaTransportFactory: Send + Sync {
    async fn create(
        &self,
        kind: CallKind,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn MediaTransport>, MediaError>;
}

#[derive(Default)]
struct NegotiationState {
    remote_described: bool,
    pending: Vec<CandidateInit>,
}

/// Wraps a transport with the bookkeeping negotiation needs: remote
/// candidates arriving before the remote description are buffered and
/// flushed in arrival order, and close happens exactly once.
pub struct MediaSession {
    transport: Arc<dyn MediaTransport>,
    kind: CallKind,
    negotiation: Mutex<NegotiationState>,
    sharing_screen: AtomicBool,
    closed: AtomicBool,
}

impl MediaSession {
    pub fn new(transport: Arc<dyn MediaTransport>, kind: CallKind) -> Self {
        Self {
            transport,
            kind,
            negotiation: Mutex::new(NegotiationState::default()),
            sharing_screen: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    pub fn is_sharing_screen(&self) -> bool {
        self.sharing_screen.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), MediaError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(MediaError::Closed)
        } else {
            Ok(())
        }
    }

    pub async fn create_offer(&self) -> Result<String, MediaError> {
        self.ensure_open()?;
        self.transport.create_offer().await
    }

    /// Apply the remote offer, then flush any candidates that raced
    /// ahead of it.
    pub async fn accept_offer(&self, offer: &str) -> Result<String, MediaError> {
        self.ensure_open()?;
        let answer = self.transport.accept_offer(offer).await?;
        self.mark_remote_described().await?;
        Ok(answer)
    }

    pub async fn apply_remote_answer(&self, answer: &str) -> Result<(), MediaError> {
        self.ensure_open()?;
        self.transport.apply_remote_answer(answer).await?;
        self.mark_remote_described().await?;
        Ok(())
    }

    /// Candidates arriving before the remote description are held back
    /// so the transport never sees a candidate it cannot apply.
    pub async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), MediaError> {
        self.ensure_open()?;
        let mut negotiation = self.negotiation.lock().await;
        if negotiation.remote_described {
            drop(negotiation);
            self.transport.add_remote_candidate(&candidate).await
        } else {
            debug!("buffering candidate until remote description is set");
            negotiation.pending.push(candidate);
            Ok(())
        }
    }

    async fn mark_remote_described(&self) -> Result<(), MediaError> {
        let pending = {
            let mut negotiation = self.negotiation.lock().await;
            negotiation.remote_described = true;
            std::mem::take(&mut negotiation.pending)
        };
        for candidate in pending {
            self.transport.add_remote_candidate(&candidate).await?;
        }
        Ok(())
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), MediaError> {
        self.ensure_open()?;
        self.transport
            .set_track_enabled(TrackKind::Audio, !muted)
            .await
    }

    pub async fn set_camera_enabled(&self, enabled: bool) -> Result<(), MediaError> {
        self.ensure_open()?;
        if self.kind != CallKind::Video {
            return Err(MediaError::NoVideoTrack);
        }
        self.transport
            .set_track_enabled(TrackKind::Video, enabled)
            .await
    }

    /// Toggle screen capture. Returns whether the screen is now being
    /// shared.
    pub async fn toggle_screen_share(&self) -> Result<bool, MediaError> {
        self.ensure_open()?;
        if self.kind != CallKind::Video {
            return Err(MediaError::NoVideoTrack);
        }
        if self.sharing_screen.load(Ordering::SeqCst) {
            self.transport.stop_screen_share().await?;
            self.sharing_screen.store(false, Ordering::SeqCst);
            Ok(false)
        } else {
            self.transport.start_screen_share().await?;
            self.sharing_screen.store(true, Ordering::SeqCst);
            Ok(true)
        }
    }

    /// The capture source vanished underneath us; fall back to the
    /// camera without treating it as a user toggle.
    pub async fn handle_share_stopped(&self) -> Result<(), MediaError> {
        if self.sharing_screen.swap(false, Ordering::SeqCst) {
            self.transport.stop_screen_share().await?;
        }
        Ok(())
    }

    /// Idempotent: only the first call reaches the transport.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.transport.close().await {
            warn!("error closing media transport: {e}");
        }
    }
}

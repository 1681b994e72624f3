//! Two-party audio/video calling: signaling relay, per-call state
//! machine, and the media transport glue between them.

pub mod envelope;
pub mod manager;
pub mod media;
pub mod registry;
pub mod relay;
pub mod session;
#[cfg(test)]
pub mod testkit;
pub mod webrtc_transport;

pub use envelope::{CallKind, CandidateInit, PeerSignal, RejectReason, RoomId};
pub use manager::{CallManager, CallUpdate};
pub use media::{MediaSession, MediaTransport, MediaTransportFactory, RemoteTrack, TrackKind};
pub use relay::SignalingRelay;
pub use session::{CallEndReason, CallSession, CallState};
pub use webrtc_transport::WebRtcFactory;

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch, for timestamps on rooms and sessions.
pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by the signaling relay while admitting or routing
/// call-setup messages. These travel back to the caller as the ack of
/// `initiate_call`, so they are serializable like the rest of the wire
/// contract.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalingError {
    #[error("user is not registered")]
    NotRegistered,

    #[error("callee is offline")]
    UserOffline,

    #[error("a call between these users is already in progress")]
    CallExists,

    #[error("cannot place a call to yourself")]
    SelfCall,

    #[error("signaling connection closed")]
    ConnectionClosed,
}

/// Errors from the media transport adapter boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("media device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("session has no outbound video track")]
    NoVideoTrack,

    #[error("media session is closed")]
    Closed,
}

/// Session-level call failures surfaced to the caller of the public
/// call API. All of these terminate at most the one call session they
/// belong to; the manager returns to idle afterwards.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("callee is offline")]
    UserOffline,

    #[error("busy with another call")]
    Busy,

    #[error("call was not answered")]
    NoAnswer,

    #[error("media device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("call negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("peer disconnected")]
    PeerDisconnected,

    #[error("operation not valid in the current call state: {0}")]
    InvalidState(&'static str),

    #[error("signaling error: {0}")]
    Signaling(SignalingError),

    #[error("media error: {0}")]
    Media(MediaError),
}

impl From<SignalingError> for CallError {
    fn from(err: SignalingError) -> Self {
        match err {
            SignalingError::UserOffline => CallError::UserOffline,
            // A second initiate for a pair that already has a live call
            // is a busy condition from the caller's point of view.
            SignalingError::CallExists => CallError::Busy,
            other => CallError::Signaling(other),
        }
    }
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::DeviceUnavailable(msg) => CallError::DeviceUnavailable(msg),
            MediaError::Negotiation(msg) => CallError::NegotiationFailed(msg),
            other => CallError::Media(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signaling_errors_map_into_call_errors() {
        assert_eq!(
            CallError::from(SignalingError::UserOffline),
            CallError::UserOffline
        );
        assert_eq!(CallError::from(SignalingError::CallExists), CallError::Busy);
        assert_eq!(
            CallError::from(SignalingError::ConnectionClosed),
            CallError::Signaling(SignalingError::ConnectionClosed)
        );
    }

    #[test]
    fn media_errors_map_into_call_errors() {
        assert_eq!(
            CallError::from(MediaError::DeviceUnavailable("denied".into())),
            CallError::DeviceUnavailable("denied".into())
        );
        assert_eq!(
            CallError::from(MediaError::Negotiation("bad sdp".into())),
            CallError::NegotiationFailed("bad sdp".into())
        );
    }
}

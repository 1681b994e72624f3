use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::oneshot;

use crate::errors::SignalingError;

/// Kind of call being placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Audio,
    Video,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallKind::Audio => write!(f, "audio"),
            CallKind::Video => write!(f, "video"),
        }
    }
}

/// Relay-level routing key for the two-party channel of one call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId(String);

impl RoomId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the room key for a participant pair and call kind.
///
/// The pair is ordered lexicographically first, so both users calling
/// each other at the same time contend on the same key instead of
/// creating two rooms for one conversation.
pub fn room_key(a: &str, b: &str, kind: CallKind) -> RoomId {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    RoomId(format!("call_{lo}_{hi}_{kind}"))
}

/// An ICE candidate as carried over signaling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateInit {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

/// Payload of a `webrtc_signal` envelope, forwarded verbatim by the
/// relay. The relay never interprets these beyond routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerSignal {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate(CandidateInit),
}

/// Why a call was answered with `accept = false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The callee declined the call.
    Declined,
    /// The callee is already in a call; rejected without prompting.
    Busy,
}

/// Requests a registered client sends to the relay. One request channel
/// per connection; the relay drains it in order, which gives per-room
/// FIFO delivery.
#[derive(Debug)]
pub enum ClientRequest {
    /// `initiate_call`: acked with the room key or a signaling error.
    Initiate {
        callee: String,
        kind: CallKind,
        reply: oneshot::Sender<Result<RoomId, SignalingError>>,
    },
    /// `answer_call`: accept or reject an incoming call.
    Answer {
        room: RoomId,
        accept: bool,
        reason: Option<RejectReason>,
    },
    /// `webrtc_signal`: relay the payload to the other participant.
    Signal { room: RoomId, signal: PeerSignal },
    /// `end_call`.
    End { room: RoomId },
}

/// Events the relay delivers to a registered client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    /// `incoming_call`
    IncomingCall {
        caller: String,
        kind: CallKind,
        room: RoomId,
    },
    /// `call_accepted`
    CallAccepted { room: RoomId },
    /// `call_rejected`
    CallRejected {
        room: RoomId,
        reason: Option<RejectReason>,
    },
    /// `webrtc_signal`, forwarded unchanged.
    Signal { room: RoomId, signal: PeerSignal },
    /// `call_ended`
    CallEnded { room: RoomId },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn room_key_is_order_independent() {
        assert_eq!(
            room_key("alice", "bob", CallKind::Video),
            room_key("bob", "alice", CallKind::Video)
        );
        assert_eq!(
            room_key("alice", "bob", CallKind::Video).as_str(),
            "call_alice_bob_video"
        );
    }

    #[test]
    fn room_key_distinguishes_kind() {
        assert_ne!(
            room_key("alice", "bob", CallKind::Audio),
            room_key("alice", "bob", CallKind::Video)
        );
    }

    #[test]
    fn server_events_round_trip_as_json() {
        let event = ServerEvent::IncomingCall {
            caller: "alice".to_string(),
            kind: CallKind::Video,
            room: room_key("alice", "bob", CallKind::Video),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"incoming_call\""));
        assert!(json.contains("\"kind\":\"video\""));
        let back: ServerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn signals_tag_their_type() {
        let signal = PeerSignal::Candidate(CandidateInit {
            candidate: "candidate:0 1 UDP 2122252543 192.0.2.1 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        });
        let json = serde_json::to_string(&signal).unwrap();
        assert!(json.contains("\"type\":\"candidate\""));
    }
}

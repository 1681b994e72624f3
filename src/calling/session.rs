use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::calling::envelope::{CallKind, CandidateInit, PeerSignal, RejectReason, RoomId};
use crate::calling::now_secs;

/// Lifecycle state of one call session, as seen from one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// We initiated and are waiting for the callee's answer.
    OutgoingRinging,
    /// We were notified of an incoming call and have not decided yet.
    IncomingRinging,
    /// Answer accepted; SDP/ICE exchange in progress.
    Connecting,
    /// Media is flowing.
    Active,
    /// Terminal.
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Why a session reached `Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallEndReason {
    /// We hung up.
    HungUp,
    /// The peer hung up or cancelled.
    PeerHungUp,
    /// We declined the incoming call.
    Declined,
    /// The peer declined our call.
    Rejected,
    /// The peer was already in a call.
    RemoteBusy,
    /// Our outgoing call rang out.
    NoAnswer,
    /// The incoming call rang out before we answered.
    Missed,
    /// SDP/ICE negotiation failed or timed out.
    ConnectionFailed,
    /// The media transport reported disconnection or failure.
    PeerDisconnected,
}

/// Inputs to the state machine: every signaling envelope, transport
/// notification, UI intent and timer is mapped to exactly one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// `call_accepted` arrived.
    AcceptedByPeer,
    /// `call_rejected` arrived.
    RejectedByPeer(Option<RejectReason>),
    /// A relayed `webrtc_signal` payload arrived.
    Signal(PeerSignal),
    /// `call_ended` arrived.
    PeerEnded,
    /// Local user accepted the incoming call.
    LocalAccept,
    /// Local user declined the incoming call.
    LocalReject,
    /// Local user hung up.
    LocalHangUp,
    /// The ringing timeout elapsed.
    RingTimeout,
    /// The connecting timeout elapsed.
    ConnectTimeout,
    /// Transport reported the media path is up.
    TransportConnected,
    /// Transport reported disconnection or failure.
    TransportDisconnected,
    /// A media operation failed while negotiating.
    NegotiationError,
}

/// Effects the orchestrator must carry out after a transition. The
/// machine itself never touches the network or devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEffect {
    /// Send `answer_call { accept, reason }`.
    SendAnswer {
        accept: bool,
        reason: Option<RejectReason>,
    },
    /// Create a local offer and relay it.
    CreateOffer,
    /// Apply the remote offer, produce an answer and relay it.
    AcceptOffer { sdp: String },
    /// Apply the remote answer.
    ApplyAnswer { sdp: String },
    /// Hand a remote candidate to the media session.
    ApplyCandidate(CandidateInit),
    /// Send `end_call`.
    SendEnd,
    /// Release the media session (safe when none was acquired yet).
    CloseMedia,
    /// Arm the connecting timeout.
    ArmConnectTimer,
    /// The session reached its terminal state; emitted exactly once.
    Terminated(CallEndReason),
}

/// One call attempt, driven as a pure function of (state, event).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSession {
    pub room: RoomId,
    pub peer: String,
    pub kind: CallKind,
    pub direction: CallDirection,
    pub state: CallState,
    pub created_at: u64,
    pub accepted_at: Option<u64>,
}

impl CallSession {
    pub fn outgoing(room: RoomId, callee: &str, kind: CallKind) -> Self {
        Self {
            room,
            peer: callee.to_string(),
            kind,
            direction: CallDirection::Outgoing,
            state: CallState::OutgoingRinging,
            created_at: now_secs(),
            accepted_at: None,
        }
    }

    pub fn incoming(room: RoomId, caller: &str, kind: CallKind) -> Self {
        Self {
            room,
            peer: caller.to_string(),
            kind,
            direction: CallDirection::Incoming,
            state: CallState::IncomingRinging,
            created_at: now_secs(),
            accepted_at: None,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.state == CallState::Ended
    }

    /// Apply one event and return the effects to execute. Events that
    /// are invalid for the current state are dropped without effects:
    /// they are benign races with a call that just moved on, not
    /// protocol errors.
    pub fn apply(&mut self, event: SessionEvent) -> Vec<SessionEffect> {
        use CallState::*;
        use SessionEvent::*;

        match (self.state, event) {
            // --- outgoing ringing -------------------------------------
            (OutgoingRinging, AcceptedByPeer) => {
                self.state = Connecting;
                self.accepted_at = Some(now_secs());
                vec![SessionEffect::CreateOffer, SessionEffect::ArmConnectTimer]
            }
            (OutgoingRinging, RejectedByPeer(reason)) => {
                let reason = match reason {
                    Some(RejectReason::Busy) => CallEndReason::RemoteBusy,
                    _ => CallEndReason::Rejected,
                };
                self.terminate(reason, false)
            }
            (OutgoingRinging, RingTimeout) => self.terminate(CallEndReason::NoAnswer, true),

            // --- incoming ringing -------------------------------------
            (IncomingRinging, LocalAccept) => {
                self.state = Connecting;
                self.accepted_at = Some(now_secs());
                vec![
                    SessionEffect::SendAnswer {
                        accept: true,
                        reason: None,
                    },
                    SessionEffect::ArmConnectTimer,
                ]
            }
            (IncomingRinging, LocalReject) | (IncomingRinging, LocalHangUp) => {
                let mut effects = vec![SessionEffect::SendAnswer {
                    accept: false,
                    reason: Some(RejectReason::Declined),
                }];
                effects.extend(self.terminate(CallEndReason::Declined, false));
                effects
            }
            (IncomingRinging, RingTimeout) => self.terminate(CallEndReason::Missed, false),

            // --- negotiation ------------------------------------------
            (Connecting, Signal(PeerSignal::Offer { sdp }))
                if self.direction == CallDirection::Incoming =>
            {
                vec![SessionEffect::AcceptOffer { sdp }]
            }
            (Connecting, Signal(PeerSignal::Answer { sdp }))
                if self.direction == CallDirection::Outgoing =>
            {
                vec![SessionEffect::ApplyAnswer { sdp }]
            }
            (Connecting, Signal(PeerSignal::Candidate(candidate)))
            | (Active, Signal(PeerSignal::Candidate(candidate))) => {
                vec![SessionEffect::ApplyCandidate(candidate)]
            }
            (Connecting, TransportConnected) => {
                self.state = Active;
                Vec::new()
            }
            (Connecting, ConnectTimeout) => self.terminate(CallEndReason::ConnectionFailed, true),
            (Connecting, NegotiationError) | (Active, NegotiationError) => {
                self.terminate(CallEndReason::ConnectionFailed, true)
            }
            (Connecting, RejectedByPeer(_)) => self.terminate(CallEndReason::Rejected, false),

            // --- established ------------------------------------------
            (Connecting, TransportDisconnected) | (Active, TransportDisconnected) => {
                self.terminate(CallEndReason::PeerDisconnected, true)
            }

            // --- termination from any live state ----------------------
            (OutgoingRinging, LocalHangUp)
            | (Connecting, LocalHangUp)
            | (Active, LocalHangUp) => self.terminate(CallEndReason::HungUp, true),
            (OutgoingRinging, PeerEnded)
            | (IncomingRinging, PeerEnded)
            | (Connecting, PeerEnded)
            | (Active, PeerEnded) => self.terminate(CallEndReason::PeerHungUp, false),

            // Re-entrant end on an ended session, late envelopes, and
            // anything out of window: drop.
            (state, event) => {
                debug!(room = %self.room, ?state, ?event, "dropping out-of-window event");
                Vec::new()
            }
        }
    }

    fn terminate(&mut self, reason: CallEndReason, notify_peer: bool) -> Vec<SessionEffect> {
        self.state = CallState::Ended;
        let mut effects = Vec::new();
        if notify_peer {
            effects.push(SessionEffect::SendEnd);
        }
        effects.push(SessionEffect::CloseMedia);
        effects.push(SessionEffect::Terminated(reason));
        effects
    }
}

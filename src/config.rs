use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the calling stack: signaling timeouts, relay
/// housekeeping, and ICE servers handed to the media transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// How long an unanswered call may ring before it is ended as
    /// "no answer" on the caller side (and missed on the callee side).
    pub ring_timeout: Duration,
    /// How long SDP/ICE negotiation may take before the session is
    /// ended with a connection failure.
    pub connect_timeout: Duration,
    /// Grace period an ended room lingers in the relay so late
    /// envelopes hit a tombstone instead of an unknown room.
    pub evict_after: Duration,
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
}

/// TURN server credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            evict_after: Duration::from_secs(10),
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            turn_servers: Vec::new(),
        }
    }
}

//! ringline: call signaling and media session core for two-party
//! audio/video calls.
//!
//! The crate is split into a transport-agnostic signaling relay
//! ([`calling::SignalingRelay`]), a per-call state machine
//! ([`calling::CallSession`]), and a per-user orchestrator
//! ([`calling::CallManager`]) that wires the two to a pluggable media
//! layer. The default media layer ([`calling::WebRtcFactory`]) sits on
//! the pure-Rust webrtc stack.

pub mod calling;
pub mod config;
pub mod errors;
pub mod logging;

pub use calling::{CallKind, CallManager, CallUpdate, SignalingRelay, WebRtcFactory};
pub use config::CallConfig;
pub use errors::{CallError, MediaError, SignalingError};

//! Orchestrates one user's calls: drives the session state machine,
//! executes its effects against the relay and the media layer, and
//! surfaces progress to the application as [`CallUpdate`]s.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::calling::envelope::{
    CallKind, ClientRequest, PeerSignal, RejectReason, RoomId, ServerEvent,
};
use crate::calling::media::{
    MediaSession, MediaTransportFactory, RemoteTrack, TransportEvent, TransportState,
};
use crate::calling::relay::SignalingRelay;
use crate::calling::session::{
    CallEndReason, CallSession, CallState, SessionEffect, SessionEvent,
};
use crate::config::CallConfig;
use crate::errors::{CallError, MediaError};

/// Progress notifications for the application layer.
#[derive(Debug, Clone)]
pub enum CallUpdate {
    IncomingCall {
        room: RoomId,
        caller: String,
        kind: CallKind,
    },
    StateChanged {
        room: RoomId,
        state: CallState,
    },
    RemoteTrack {
        room: RoomId,
        track: RemoteTrack,
    },
    Ended {
        room: RoomId,
        reason: CallEndReason,
    },
}

struct ActiveCall {
    session: CallSession,
    media: Option<Arc<MediaSession>>,
    /// Distinguishes this call attempt from earlier ones in the same
    /// room, so stale timers and transport events cannot touch it.
    epoch: u64,
}

#[derive(Default)]
struct Inner {
    active: Option<ActiveCall>,
    next_epoch: u64,
}

impl Inner {
    fn matching(&mut self, room: &RoomId, epoch: u64) -> Option<&mut ActiveCall> {
        self.active
            .as_mut()
            .filter(|call| call.session.room == *room && call.epoch == epoch)
    }
}

/// One user's call endpoint. At most one call is active at a time;
/// further incoming calls are auto-rejected as busy.
pub struct CallManager {
    username: String,
    requests: mpsc::UnboundedSender<ClientRequest>,
    inner: Mutex<Inner>,
    factory: Arc<dyn MediaTransportFactory>,
    updates: mpsc::UnboundedSender<CallUpdate>,
    config: CallConfig,
}

impl CallManager {
    pub async fn new(
        username: &str,
        relay: &Arc<SignalingRelay>,
        factory: Arc<dyn MediaTransportFactory>,
        config: CallConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<CallUpdate>) {
        let (requests, server_events) = relay.connect(username).await;
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            username: username.to_string(),
            requests,
            inner: Mutex::new(Inner::default()),
            factory,
            updates: updates_tx,
            config,
        });
        manager.clone().spawn_server_pump(server_events);
        (manager, updates_rx)
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Snapshot of the current call, if any.
    pub async fn current_call(&self) -> Option<CallSession> {
        self.inner
            .lock()
            .await
            .active
            .as_ref()
            .map(|call| call.session.clone())
    }

    /// Start a call. Capture devices are acquired before any signaling
    /// so an unavailable device never disturbs the callee.
    pub async fn initiate_call(
        self: &Arc<Self>,
        callee: &str,
        kind: CallKind,
    ) -> Result<RoomId, CallError> {
        let mut inner = self.inner.lock().await;
        if inner.active.is_some() {
            return Err(CallError::Busy);
        }

        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let transport = self.factory.create(kind, transport_tx).await?;
        let media = Arc::new(MediaSession::new(transport, kind));

        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self.requests.send(ClientRequest::Initiate {
            callee: callee.to_string(),
            kind,
            reply: reply_tx,
        });
        let room = match sent {
            Ok(()) => match reply_rx.await {
                Ok(Ok(room)) => room,
                Ok(Err(e)) => {
                    media.close().await;
                    return Err(e.into());
                }
                Err(_) => {
                    media.close().await;
                    return Err(crate::errors::SignalingError::ConnectionClosed.into());
                }
            },
            Err(_) => {
                media.close().await;
                return Err(crate::errors::SignalingError::ConnectionClosed.into());
            }
        };

        let epoch = inner.next_epoch;
        inner.next_epoch += 1;
        inner.active = Some(ActiveCall {
            session: CallSession::outgoing(room.clone(), callee, kind),
            media: Some(media.clone()),
            epoch,
        });
        drop(inner);

        info!(user = %self.username, %room, "outgoing call started");
        self.clone()
            .spawn_transport_pump(room.clone(), epoch, media, transport_rx);
        self.clone()
            .spawn_ring_timer(room.clone(), epoch);
        Ok(room)
    }

    /// Accept the ringing incoming call. Devices are acquired first;
    /// if that fails the call is declined so the caller is not left
    /// ringing forever.
    pub async fn accept_incoming(self: &Arc<Self>) -> Result<(), CallError> {
        let (room, epoch, kind) = {
            let inner = self.inner.lock().await;
            let call = inner
                .active
                .as_ref()
                .ok_or(CallError::InvalidState("no incoming call"))?;
            if call.session.state != CallState::IncomingRinging {
                return Err(CallError::InvalidState("call is not ringing"));
            }
            (call.session.room.clone(), call.epoch, call.session.kind)
        };

        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let transport = match self.factory.create(kind, transport_tx).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!(user = %self.username, %room, "device acquisition failed: {e}");
                self.dispatch(&room, epoch, SessionEvent::LocalReject).await;
                return Err(e.into());
            }
        };
        let media = Arc::new(MediaSession::new(transport, kind));

        {
            let mut inner = self.inner.lock().await;
            match inner.matching(&room, epoch) {
                Some(call) => call.media = Some(media.clone()),
                // The call ended while we were opening devices.
                None => {
                    media.close().await;
                    return Err(CallError::InvalidState("call already ended"));
                }
            }
        }

        self.clone()
            .spawn_transport_pump(room.clone(), epoch, media, transport_rx);
        self.dispatch(&room, epoch, SessionEvent::LocalAccept).await;
        Ok(())
    }

    /// Decline the ringing incoming call.
    pub async fn reject_incoming(self: &Arc<Self>) -> Result<(), CallError> {
        let (room, epoch) = {
            let inner = self.inner.lock().await;
            let call = inner
                .active
                .as_ref()
                .ok_or(CallError::InvalidState("no incoming call"))?;
            if call.session.state != CallState::IncomingRinging {
                return Err(CallError::InvalidState("call is not ringing"));
            }
            (call.session.room.clone(), call.epoch)
        };
        self.dispatch(&room, epoch, SessionEvent::LocalReject).await;
        Ok(())
    }

    /// End the current call. A no-op when nothing is active.
    pub async fn hang_up(self: &Arc<Self>) {
        let target = {
            let inner = self.inner.lock().await;
            inner
                .active
                .as_ref()
                .map(|call| (call.session.room.clone(), call.epoch))
        };
        if let Some((room, epoch)) = target {
            self.dispatch(&room, epoch, SessionEvent::LocalHangUp).await;
        }
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        self.with_media(|media| async move { media.set_muted(muted).await })
            .await
    }

    pub async fn set_camera_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.with_media(|media| async move { media.set_camera_enabled(enabled).await })
            .await
    }

    /// Returns whether the screen is now being shared.
    pub async fn toggle_screen_share(&self) -> Result<bool, CallError> {
        let media = self.active_media().await?;
        Ok(media.toggle_screen_share().await?)
    }

    async fn with_media<F, Fut>(&self, f: F) -> Result<(), CallError>
    where
        F: FnOnce(Arc<MediaSession>) -> Fut,
        Fut: std::future::Future<Output = Result<(), MediaError>>,
    {
        let media = self.active_media().await?;
        f(media).await?;
        Ok(())
    }

    async fn active_media(&self) -> Result<Arc<MediaSession>, CallError> {
        let inner = self.inner.lock().await;
        inner
            .active
            .as_ref()
            .and_then(|call| call.media.clone())
            .ok_or(CallError::InvalidState("no media session"))
    }

    // --- event plumbing ---------------------------------------------

    fn spawn_server_pump(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ServerEvent>) {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.handle_server_event(event).await;
            }
            debug!(user = %self.username, "signaling connection closed");
        });
    }

    async fn handle_server_event(self: &Arc<Self>, event: ServerEvent) {
        match event {
            ServerEvent::IncomingCall { caller, kind, room } => {
                let mut inner = self.inner.lock().await;
                if inner.active.is_some() {
                    // Busy: decline without bothering the local user.
                    info!(user = %self.username, %room, "auto-rejecting call while busy");
                    let _ = self.requests.send(ClientRequest::Answer {
                        room,
                        accept: false,
                        reason: Some(RejectReason::Busy),
                    });
                    return;
                }
                let epoch = inner.next_epoch;
                inner.next_epoch += 1;
                inner.active = Some(ActiveCall {
                    session: CallSession::incoming(room.clone(), &caller, kind),
                    media: None,
                    epoch,
                });
                drop(inner);

                self.clone().spawn_ring_timer(room.clone(), epoch);
                let _ = self.updates.send(CallUpdate::IncomingCall { room, caller, kind });
            }
            ServerEvent::CallAccepted { room } => {
                self.dispatch_current(&room, SessionEvent::AcceptedByPeer)
                    .await;
            }
            ServerEvent::CallRejected { room, reason } => {
                self.dispatch_current(&room, SessionEvent::RejectedByPeer(reason))
                    .await;
            }
            ServerEvent::Signal { room, signal } => {
                self.dispatch_current(&room, SessionEvent::Signal(signal))
                    .await;
            }
            ServerEvent::CallEnded { room } => {
                self.dispatch_current(&room, SessionEvent::PeerEnded).await;
            }
        }
    }

    fn spawn_transport_pump(
        self: Arc<Self>,
        room: RoomId,
        epoch: u64,
        media: Arc<MediaSession>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::LocalCandidate(candidate) => {
                        let _ = self.requests.send(ClientRequest::Signal {
                            room: room.clone(),
                            signal: PeerSignal::Candidate(candidate),
                        });
                    }
                    TransportEvent::ConnectionState(state) => match state {
                        TransportState::Connected => {
                            self.dispatch(&room, epoch, SessionEvent::TransportConnected)
                                .await;
                        }
                        TransportState::Disconnected | TransportState::Failed => {
                            self.dispatch(&room, epoch, SessionEvent::TransportDisconnected)
                                .await;
                        }
                        TransportState::Connecting | TransportState::Closed => {}
                    },
                    TransportEvent::RemoteTrack(track) => {
                        let _ = self.updates.send(CallUpdate::RemoteTrack {
                            room: room.clone(),
                            track,
                        });
                    }
                    TransportEvent::ScreenShareStopped => {
                        if let Err(e) = media.handle_share_stopped().await {
                            warn!(%room, "failed to restore camera: {e}");
                        }
                    }
                }
            }
        });
    }

    fn spawn_ring_timer(self: Arc<Self>, room: RoomId, epoch: u64) {
        let timeout = self.config.ring_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            self.dispatch(&room, epoch, SessionEvent::RingTimeout).await;
        });
    }

    fn spawn_connect_timer(self: Arc<Self>, room: RoomId, epoch: u64) {
        let timeout = self.config.connect_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            self.dispatch(&room, epoch, SessionEvent::ConnectTimeout)
                .await;
        });
    }

    /// Route a relay event to the current call in `room`, whatever its
    /// epoch. Stale rooms are dropped here.
    async fn dispatch_current(self: &Arc<Self>, room: &RoomId, event: SessionEvent) {
        let epoch = {
            let inner = self.inner.lock().await;
            match inner.active.as_ref() {
                Some(call) if call.session.room == *room => call.epoch,
                _ => {
                    debug!(%room, "dropping event for inactive room");
                    return;
                }
            }
        };
        self.dispatch(room, epoch, event).await;
    }

    /// Apply one event to the session and execute the resulting
    /// effects. The lock is never held across effect execution, so
    /// effects may safely feed follow-up events back in.
    async fn dispatch(self: &Arc<Self>, room: &RoomId, epoch: u64, event: SessionEvent) {
        let mut next = Some(event);
        while let Some(event) = next.take() {
            let (effects, media) = {
                let mut inner = self.inner.lock().await;
                let Some(call) = inner.matching(room, epoch) else {
                    return;
                };
                let before = call.session.state;
                let effects = call.session.apply(event);
                let after = call.session.state;
                let media = call.media.clone();
                if after != before && after != CallState::Ended {
                    let _ = self.updates.send(CallUpdate::StateChanged {
                        room: room.clone(),
                        state: after,
                    });
                }
                (effects, media)
            };
            next = self.run_effects(room, epoch, effects, media).await;
        }
    }

    /// Execute effects in order. A media failure turns into a
    /// follow-up `NegotiationError` for the state machine.
    async fn run_effects(
        self: &Arc<Self>,
        room: &RoomId,
        epoch: u64,
        effects: Vec<SessionEffect>,
        media: Option<Arc<MediaSession>>,
    ) -> Option<SessionEvent> {
        for effect in effects {
            match effect {
                SessionEffect::SendAnswer { accept, reason } => {
                    let _ = self.requests.send(ClientRequest::Answer {
                        room: room.clone(),
                        accept,
                        reason,
                    });
                }
                SessionEffect::CreateOffer => {
                    let Some(media) = media.as_ref() else { continue };
                    match media.create_offer().await {
                        Ok(sdp) => {
                            let _ = self.requests.send(ClientRequest::Signal {
                                room: room.clone(),
                                signal: PeerSignal::Offer { sdp },
                            });
                        }
                        Err(e) => {
                            warn!(%room, "offer creation failed: {e}");
                            return Some(SessionEvent::NegotiationError);
                        }
                    }
                }
                SessionEffect::AcceptOffer { sdp } => {
                    let Some(media) = media.as_ref() else { continue };
                    match media.accept_offer(&sdp).await {
                        Ok(answer) => {
                            let _ = self.requests.send(ClientRequest::Signal {
                                room: room.clone(),
                                signal: PeerSignal::Answer { sdp: answer },
                            });
                        }
                        Err(e) => {
                            warn!(%room, "offer handling failed: {e}");
                            return Some(SessionEvent::NegotiationError);
                        }
                    }
                }
                SessionEffect::ApplyAnswer { sdp } => {
                    let Some(media) = media.as_ref() else { continue };
                    if let Err(e) = media.apply_remote_answer(&sdp).await {
                        warn!(%room, "answer handling failed: {e}");
                        return Some(SessionEvent::NegotiationError);
                    }
                }
                SessionEffect::ApplyCandidate(candidate) => {
                    let Some(media) = media.as_ref() else { continue };
                    if let Err(e) = media.add_remote_candidate(candidate).await {
                        // A bad candidate is not fatal; others may
                        // still complete the path.
                        warn!(%room, "candidate rejected: {e}");
                    }
                }
                SessionEffect::SendEnd => {
                    let _ = self
                        .requests
                        .send(ClientRequest::End { room: room.clone() });
                }
                SessionEffect::CloseMedia => {
                    if let Some(media) = media.as_ref() {
                        media.close().await;
                    }
                }
                SessionEffect::ArmConnectTimer => {
                    self.clone().spawn_connect_timer(room.clone(), epoch);
                }
                SessionEffect::Terminated(reason) => {
                    let mut inner = self.inner.lock().await;
                    if inner.matching(room, epoch).is_some() {
                        inner.active = None;
                    }
                    drop(inner);
                    info!(user = %self.username, %room, ?reason, "call ended");
                    let _ = self.updates.send(CallUpdate::Ended {
                        room: room.clone(),
                        reason,
                    });
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::envelope::room_key;
    use crate::calling::testkit::MockFactory;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_config() -> CallConfig {
        CallConfig {
            ring_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            evict_after: Duration::from_millis(50),
            stun_servers: Vec::new(),
            turn_servers: Vec::new(),
        }
    }

    async fn endpoint(
        relay: &Arc<SignalingRelay>,
        name: &str,
        config: CallConfig,
    ) -> (
        Arc<CallManager>,
        mpsc::UnboundedReceiver<CallUpdate>,
        Arc<MockFactory>,
    ) {
        let factory = Arc::new(MockFactory::new());
        let (manager, updates) = CallManager::new(name, relay, factory.clone(), config).await;
        (manager, updates, factory)
    }

    async fn next_update(rx: &mut mpsc::UnboundedReceiver<CallUpdate>) -> CallUpdate {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for update")
            .expect("update channel closed")
    }

    async fn expect_state(rx: &mut mpsc::UnboundedReceiver<CallUpdate>, expected: CallState) {
        match next_update(rx).await {
            CallUpdate::StateChanged { state, .. } => assert_eq!(state, expected),
            other => panic!("expected state change, got {other:?}"),
        }
    }

    async fn expect_ended(
        rx: &mut mpsc::UnboundedReceiver<CallUpdate>,
        expected: CallEndReason,
    ) {
        match next_update(rx).await {
            CallUpdate::Ended { reason, .. } => assert_eq!(reason, expected),
            other => panic!("expected ended, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn full_call_flow_reaches_active_and_hangs_up() {
        let relay = SignalingRelay::new(test_config());
        let (alice, mut alice_rx, alice_factory) =
            endpoint(&relay, "alice", test_config()).await;
        let (bob, mut bob_rx, bob_factory) = endpoint(&relay, "bob", test_config()).await;

        let room = alice.initiate_call("bob", CallKind::Video).await.unwrap();
        assert_eq!(room, room_key("alice", "bob", CallKind::Video));

        match next_update(&mut bob_rx).await {
            CallUpdate::IncomingCall { caller, kind, .. } => {
                assert_eq!(caller, "alice");
                assert_eq!(kind, CallKind::Video);
            }
            other => panic!("expected incoming call, got {other:?}"),
        }

        bob.accept_incoming().await.unwrap();
        expect_state(&mut bob_rx, CallState::Connecting).await;
        expect_state(&mut alice_rx, CallState::Connecting).await;

        // Let offer/answer travel through the relay.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let alice_transport = alice_factory.last().unwrap();
        let bob_transport = bob_factory.last().unwrap();
        assert!(alice_transport
            .calls()
            .contains(&"create_offer".to_string()));
        assert!(bob_transport.calls().contains(&"accept_offer".to_string()));
        assert!(alice_transport
            .calls()
            .contains(&"apply_remote_answer".to_string()));

        alice_transport.emit(TransportEvent::ConnectionState(TransportState::Connected));
        bob_transport.emit(TransportEvent::ConnectionState(TransportState::Connected));
        expect_state(&mut alice_rx, CallState::Active).await;
        expect_state(&mut bob_rx, CallState::Active).await;

        alice.hang_up().await;
        expect_ended(&mut alice_rx, CallEndReason::HungUp).await;
        expect_ended(&mut bob_rx, CallEndReason::PeerHungUp).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(alice_transport.close_count(), 1);
        assert_eq!(bob_transport.close_count(), 1);
        assert!(alice.current_call().await.is_none());
        assert!(bob.current_call().await.is_none());
    }

    #[tokio::test]
    async fn calling_an_offline_user_fails_fast() {
        let relay = SignalingRelay::new(test_config());
        let (alice, _alice_rx, alice_factory) =
            endpoint(&relay, "alice", test_config()).await;

        let err = alice
            .initiate_call("nobody", CallKind::Audio)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::UserOffline));
        assert!(alice.current_call().await.is_none());
        // The transport acquired up front is released again.
        assert_eq!(alice_factory.last().unwrap().close_count(), 1);
    }

    #[tokio::test]
    async fn transport_failure_ends_call_on_both_sides() {
        let relay = SignalingRelay::new(test_config());
        let (alice, mut alice_rx, alice_factory) =
            endpoint(&relay, "alice", test_config()).await;
        let (bob, mut bob_rx, _bob_factory) = endpoint(&relay, "bob", test_config()).await;

        alice.initiate_call("bob", CallKind::Audio).await.unwrap();
        next_update(&mut bob_rx).await;
        bob.accept_incoming().await.unwrap();
        expect_state(&mut bob_rx, CallState::Connecting).await;
        expect_state(&mut alice_rx, CallState::Connecting).await;

        let alice_transport = alice_factory.last().unwrap();
        alice_transport.emit(TransportEvent::ConnectionState(TransportState::Connected));
        expect_state(&mut alice_rx, CallState::Active).await;

        alice_transport.emit(TransportEvent::ConnectionState(TransportState::Failed));
        expect_ended(&mut alice_rx, CallEndReason::PeerDisconnected).await;

        // Bob is told via signaling, whatever his transport saw.
        loop {
            match next_update(&mut bob_rx).await {
                CallUpdate::Ended { reason, .. } => {
                    assert_eq!(reason, CallEndReason::PeerHungUp);
                    break;
                }
                _ => continue,
            }
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(alice_transport.close_count(), 1);
    }

    #[tokio::test]
    async fn second_incoming_call_is_auto_rejected_as_busy() {
        let relay = SignalingRelay::new(test_config());
        let (alice, mut alice_rx, _f1) = endpoint(&relay, "alice", test_config()).await;
        let (bob, mut bob_rx, _f2) = endpoint(&relay, "bob", test_config()).await;
        let (carol, mut carol_rx, _f3) = endpoint(&relay, "carol", test_config()).await;

        alice.initiate_call("bob", CallKind::Audio).await.unwrap();
        next_update(&mut bob_rx).await;
        bob.accept_incoming().await.unwrap();

        // Carol's call to the busy Bob bounces with a busy reason and
        // Bob never hears about it.
        carol.initiate_call("bob", CallKind::Audio).await.unwrap();
        expect_ended(&mut carol_rx, CallEndReason::RemoteBusy).await;
        assert!(carol.current_call().await.is_none());

        // The original call is unaffected.
        expect_state(&mut bob_rx, CallState::Connecting).await;
        expect_state(&mut alice_rx, CallState::Connecting).await;
        let current = bob.current_call().await.unwrap();
        assert_eq!(current.peer, "alice");
    }

    #[tokio::test]
    async fn initiating_while_busy_is_rejected_locally() {
        let relay = SignalingRelay::new(test_config());
        let (alice, _alice_rx, _f1) = endpoint(&relay, "alice", test_config()).await;
        let (_bob, mut bob_rx, _f2) = endpoint(&relay, "bob", test_config()).await;
        let (_carol, _carol_rx, _f3) = endpoint(&relay, "carol", test_config()).await;

        alice.initiate_call("bob", CallKind::Audio).await.unwrap();
        next_update(&mut bob_rx).await;

        let err = alice
            .initiate_call("carol", CallKind::Audio)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Busy));
    }

    #[tokio::test]
    async fn device_failure_on_accept_declines_without_signaling_media() {
        let relay = SignalingRelay::new(test_config());
        let (alice, mut alice_rx, alice_factory) =
            endpoint(&relay, "alice", test_config()).await;
        let (bob, mut bob_rx, bob_factory) = endpoint(&relay, "bob", test_config()).await;
        bob_factory.fail_device();

        alice.initiate_call("bob", CallKind::Video).await.unwrap();
        next_update(&mut bob_rx).await;

        let err = bob.accept_incoming().await.unwrap_err();
        assert!(matches!(err, CallError::DeviceUnavailable(_)));
        expect_ended(&mut bob_rx, CallEndReason::Declined).await;
        expect_ended(&mut alice_rx, CallEndReason::Rejected).await;

        // No SDP was ever produced on the caller side.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let calls = alice_factory.last().unwrap().calls();
        assert!(!calls.contains(&"create_offer".to_string()));
    }

    #[tokio::test]
    async fn hang_up_is_idempotent() {
        let relay = SignalingRelay::new(test_config());
        let (alice, mut alice_rx, _f1) = endpoint(&relay, "alice", test_config()).await;
        let (_bob, mut bob_rx, _f2) = endpoint(&relay, "bob", test_config()).await;

        alice.initiate_call("bob", CallKind::Audio).await.unwrap();
        next_update(&mut bob_rx).await;

        alice.hang_up().await;
        expect_ended(&mut alice_rx, CallEndReason::HungUp).await;
        // Further hang-ups are no-ops.
        alice.hang_up().await;
        alice.hang_up().await;
        assert!(timeout(Duration::from_millis(50), alice_rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn unanswered_call_rings_out_on_both_sides() {
        let relay = SignalingRelay::new(test_config());
        let caller_config = CallConfig {
            ring_timeout: Duration::from_millis(120),
            ..test_config()
        };
        let callee_config = CallConfig {
            ring_timeout: Duration::from_millis(60),
            ..test_config()
        };
        let (alice, mut alice_rx, _f1) = endpoint(&relay, "alice", caller_config).await;
        let (_bob, mut bob_rx, _f2) = endpoint(&relay, "bob", callee_config).await;

        alice.initiate_call("bob", CallKind::Audio).await.unwrap();
        next_update(&mut bob_rx).await;

        // The callee's shorter ring timer fires first and is recorded
        // as missed, silently.
        expect_ended(&mut bob_rx, CallEndReason::Missed).await;
        expect_ended(&mut alice_rx, CallEndReason::NoAnswer).await;
    }

    #[tokio::test]
    async fn negotiation_failure_tears_the_call_down() {
        let relay = SignalingRelay::new(test_config());
        let (alice, mut alice_rx, alice_factory) =
            endpoint(&relay, "alice", test_config()).await;
        let (bob, mut bob_rx, _f2) = endpoint(&relay, "bob", test_config()).await;

        alice.initiate_call("bob", CallKind::Audio).await.unwrap();
        // Break the caller's transport before the answer arrives.
        alice_factory.last().unwrap().fail_negotiation();

        next_update(&mut bob_rx).await;
        bob.accept_incoming().await.unwrap();

        expect_state(&mut alice_rx, CallState::Connecting).await;
        expect_ended(&mut alice_rx, CallEndReason::ConnectionFailed).await;
    }

    #[tokio::test]
    async fn mute_and_camera_toggles_reach_the_transport() {
        use crate::calling::media::TrackKind;

        let relay = SignalingRelay::new(test_config());
        let (alice, _alice_rx, alice_factory) =
            endpoint(&relay, "alice", test_config()).await;
        let (_bob, mut bob_rx, _f2) = endpoint(&relay, "bob", test_config()).await;

        alice.initiate_call("bob", CallKind::Video).await.unwrap();
        next_update(&mut bob_rx).await;

        alice.set_muted(true).await.unwrap();
        alice.set_camera_enabled(false).await.unwrap();
        assert!(alice.toggle_screen_share().await.unwrap());
        assert!(!alice.toggle_screen_share().await.unwrap());

        let transport = alice_factory.last().unwrap();
        assert!(!transport.track_enabled(TrackKind::Audio));
        assert!(!transport.track_enabled(TrackKind::Video));
    }
}

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::calling::envelope::{
    room_key, CallKind, ClientRequest, PeerSignal, RejectReason, RoomId, ServerEvent,
};
use crate::calling::now_secs;
use crate::calling::registry::SessionRegistry;
use crate::config::CallConfig;
use crate::errors::SignalingError;

/// Relay-side view of one call's routing channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomState {
    /// Created by `initiate_call`, callee not yet answered.
    Ringing,
    /// Callee accepted; SDP/ICE traffic may flow.
    Live,
    /// Terminal. The entry lingers as a tombstone for the grace period
    /// so late envelopes are dropped silently instead of looking like
    /// unknown rooms.
    Ended,
}

struct Room {
    caller: String,
    callee: String,
    kind: CallKind,
    state: RoomState,
    generation: u64,
    created_at: u64,
}

impl Room {
    fn involves(&self, user: &str) -> bool {
        self.caller == user || self.callee == user
    }

    fn peer_of(&self, user: &str) -> Option<&str> {
        if self.caller == user {
            Some(&self.callee)
        } else if self.callee == user {
            Some(&self.caller)
        } else {
            None
        }
    }

    fn pair_matches(&self, a: &str, b: &str) -> bool {
        (self.caller == a && self.callee == b) || (self.caller == b && self.callee == a)
    }
}

/// Snapshot of a live room, for observability and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub room: RoomId,
    pub caller: String,
    pub callee: String,
    pub kind: CallKind,
    pub state: RoomState,
    pub created_at: u64,
}

/// Message router for call signaling. Routes envelopes between the two
/// registry entries participating in a room without interpreting the
/// payload; rooms are fully independent of each other.
pub struct SignalingRelay {
    registry: SessionRegistry,
    rooms: Arc<RwLock<HashMap<RoomId, Room>>>,
    generation: AtomicU64,
    config: CallConfig,
}

impl SignalingRelay {
    pub fn new(config: CallConfig) -> Arc<Self> {
        Arc::new(Self {
            registry: SessionRegistry::new(),
            rooms: Arc::new(RwLock::new(HashMap::new())),
            generation: AtomicU64::new(0),
            config,
        })
    }

    /// Register a user and open their signaling connection. Requests
    /// sent on the returned sender are processed in order by one task
    /// per connection; events arrive on the returned receiver. Dropping
    /// the sender disconnects the user.
    pub async fn connect(
        self: &Arc<Self>,
        username: &str,
    ) -> (
        mpsc::UnboundedSender<ClientRequest>,
        mpsc::UnboundedReceiver<ServerEvent>,
    ) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<ClientRequest>();
        self.registry.register(username, event_tx).await;

        let relay = Arc::clone(self);
        let user = username.to_string();
        tokio::spawn(async move {
            while let Some(request) = request_rx.recv().await {
                match request {
                    ClientRequest::Initiate {
                        callee,
                        kind,
                        reply,
                    } => {
                        let result = relay.handle_initiate(&user, &callee, kind).await;
                        let _ = reply.send(result);
                    }
                    ClientRequest::Answer {
                        room,
                        accept,
                        reason,
                    } => relay.handle_answer(&user, &room, accept, reason).await,
                    ClientRequest::Signal { room, signal } => {
                        relay.handle_signal(&user, &room, signal).await
                    }
                    ClientRequest::End { room } => relay.handle_end(&user, &room).await,
                }
            }
            relay.handle_disconnect(&user).await;
        });

        (request_tx, event_rx)
    }

    /// Snapshot of every room not yet ended.
    pub async fn active_rooms(&self) -> Vec<RoomInfo> {
        let rooms = self.rooms.read().await;
        rooms
            .iter()
            .filter(|(_, room)| room.state != RoomState::Ended)
            .map(|(id, room)| RoomInfo {
                room: id.clone(),
                caller: room.caller.clone(),
                callee: room.callee.clone(),
                kind: room.kind,
                state: room.state,
                created_at: room.created_at,
            })
            .collect()
    }

    async fn handle_initiate(
        self: &Arc<Self>,
        caller: &str,
        callee: &str,
        kind: CallKind,
    ) -> Result<RoomId, SignalingError> {
        if caller == callee {
            return Err(SignalingError::SelfCall);
        }
        if !self.registry.is_present(caller).await {
            return Err(SignalingError::NotRegistered);
        }
        if !self.registry.is_present(callee).await {
            return Err(SignalingError::UserOffline);
        }

        let room_id = room_key(caller, callee, kind);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut rooms = self.rooms.write().await;
            // At most one non-ended room per participant pair, across
            // both call kinds. A concurrent second initiate is rejected,
            // never queued.
            let pair_busy = rooms
                .values()
                .any(|room| room.state != RoomState::Ended && room.pair_matches(caller, callee));
            if pair_busy {
                return Err(SignalingError::CallExists);
            }
            rooms.insert(
                room_id.clone(),
                Room {
                    caller: caller.to_string(),
                    callee: callee.to_string(),
                    kind,
                    state: RoomState::Ringing,
                    generation,
                    created_at: now_secs(),
                },
            );
        }

        let delivered = self
            .registry
            .deliver(
                callee,
                ServerEvent::IncomingCall {
                    caller: caller.to_string(),
                    kind,
                    room: room_id.clone(),
                },
            )
            .await;
        if !delivered {
            // Callee vanished between the presence check and delivery.
            self.rooms.write().await.remove(&room_id);
            return Err(SignalingError::UserOffline);
        }

        info!(%room_id, caller, callee, %kind, "call initiated");
        Ok(room_id)
    }

    async fn handle_answer(
        self: &Arc<Self>,
        user: &str,
        room_id: &RoomId,
        accept: bool,
        reason: Option<RejectReason>,
    ) {
        let caller = {
            let mut rooms = self.rooms.write().await;
            let Some(room) = rooms.get_mut(room_id) else {
                debug!(%room_id, user, "answer for unknown room dropped");
                return;
            };
            if room.state != RoomState::Ringing || room.callee != user {
                debug!(%room_id, user, state = ?room.state, "answer out of order dropped");
                return;
            }
            if accept {
                room.state = RoomState::Live;
            } else {
                room.state = RoomState::Ended;
                self.schedule_eviction(room_id.clone(), room.generation);
            }
            room.caller.clone()
        };

        let event = if accept {
            ServerEvent::CallAccepted {
                room: room_id.clone(),
            }
        } else {
            ServerEvent::CallRejected {
                room: room_id.clone(),
                reason,
            }
        };
        info!(%room_id, user, accept, "call answered");
        self.registry.deliver(&caller, event).await;
    }

    async fn handle_signal(self: &Arc<Self>, user: &str, room_id: &RoomId, signal: PeerSignal) {
        let peer = {
            let rooms = self.rooms.read().await;
            match rooms.get(room_id) {
                Some(room) if room.state != RoomState::Ended => {
                    match room.peer_of(user) {
                        Some(peer) => peer.to_string(),
                        None => {
                            warn!(%room_id, user, "signal from non-participant dropped");
                            return;
                        }
                    }
                }
                // Benign race with a just-ended call, not an error.
                _ => {
                    debug!(%room_id, user, "signal for unknown or ended room dropped");
                    return;
                }
            }
        };

        self.registry
            .deliver(
                &peer,
                ServerEvent::Signal {
                    room: room_id.clone(),
                    signal,
                },
            )
            .await;
    }

    async fn handle_end(self: &Arc<Self>, user: &str, room_id: &RoomId) {
        let peer = {
            let mut rooms = self.rooms.write().await;
            let Some(room) = rooms.get_mut(room_id) else {
                debug!(%room_id, user, "end for unknown room ignored");
                return;
            };
            // Re-entrant end is a no-op; the peer that raced us into
            // Ended has already been notified.
            if room.state == RoomState::Ended || !room.involves(user) {
                return;
            }
            room.state = RoomState::Ended;
            self.schedule_eviction(room_id.clone(), room.generation);
            room.peer_of(user).map(str::to_string)
        };

        info!(%room_id, user, "call ended");
        if let Some(peer) = peer {
            self.registry
                .deliver(
                    &peer,
                    ServerEvent::CallEnded {
                        room: room_id.clone(),
                    },
                )
                .await;
        }
    }

    /// Connection went away: drop presence and end every room the user
    /// was part of, notifying the surviving peer.
    async fn handle_disconnect(self: &Arc<Self>, user: &str) {
        self.registry.unregister(user).await;

        let orphaned: Vec<(RoomId, String)> = {
            let mut rooms = self.rooms.write().await;
            let mut orphaned = Vec::new();
            for (id, room) in rooms.iter_mut() {
                if room.state != RoomState::Ended && room.involves(user) {
                    room.state = RoomState::Ended;
                    self.schedule_eviction(id.clone(), room.generation);
                    if let Some(peer) = room.peer_of(user) {
                        orphaned.push((id.clone(), peer.to_string()));
                    }
                }
            }
            orphaned
        };

        for (room_id, peer) in orphaned {
            info!(%room_id, user, "ending room after disconnect");
            self.registry
                .deliver(&peer, ServerEvent::CallEnded { room: room_id })
                .await;
        }
    }

    /// Remove the tombstone after the grace period. The generation
    /// check keeps a later room under the same deterministic key alive.
    fn schedule_eviction(self: &Arc<Self>, room_id: RoomId, generation: u64) {
        let rooms = Arc::clone(&self.rooms);
        let grace = self.config.evict_after;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut rooms = rooms.write().await;
            if rooms.get(&room_id).is_some_and(|r| r.generation == generation) {
                rooms.remove(&room_id);
                debug!(%room_id, "evicted ended room");
            }
        });
    }
}

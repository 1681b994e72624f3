//! In-memory transport doubles for exercising call logic without
//! devices or a network.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::calling::envelope::{CallKind, CandidateInit};
use crate::calling::media::{MediaTransport, MediaTransportFactory, TrackKind, TransportEvent};
use crate::errors::MediaError;

struct MockState {
    calls: Vec<String>,
    applied_candidates: Vec<String>,
    /// Stand-ins for track objects: identity matters, not the label.
    camera_track: Arc<String>,
    active_track: Arc<String>,
    audio_enabled: bool,
    video_enabled: bool,
}

pub struct MockTransport {
    state: Mutex<MockState>,
    close_count: AtomicUsize,
    fail_negotiation: AtomicBool,
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        let camera = Arc::new("camera".to_string());
        Self {
            state: Mutex::new(MockState {
                calls: Vec::new(),
                applied_candidates: Vec::new(),
                camera_track: camera.clone(),
                active_track: camera,
                audio_enabled: true,
                video_enabled: true,
            }),
            close_count: AtomicUsize::new(0),
            fail_negotiation: AtomicBool::new(false),
            events: Mutex::new(None),
        }
    }

    pub fn with_events(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        let transport = Self::new();
        *transport.events.lock().unwrap() = Some(events);
        transport
    }

    pub fn fail_negotiation(&self) {
        self.fail_negotiation.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.state.lock().unwrap().applied_candidates.clone()
    }

    pub fn current_video_source(&self) -> String {
        (*self.state.lock().unwrap().active_track).clone()
    }

    /// True when the outgoing video source is the same track object the
    /// transport was created with, not merely one labelled "camera".
    pub fn sends_camera_track(&self) -> bool {
        let state = self.state.lock().unwrap();
        Arc::ptr_eq(&state.active_track, &state.camera_track)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn track_enabled(&self, kind: TrackKind) -> bool {
        let state = self.state.lock().unwrap();
        match kind {
            TrackKind::Audio => state.audio_enabled,
            TrackKind::Video => state.video_enabled,
        }
    }

    /// Push a transport event as if the network produced it.
    pub fn emit(&self, event: TransportEvent) {
        if let Some(sender) = self.events.lock().unwrap().as_ref() {
            let _ = sender.send(event);
        }
    }

    fn record(&self, call: &str) {
        self.state.lock().unwrap().calls.push(call.to_string());
    }

    fn negotiation_guard(&self) -> Result<(), MediaError> {
        if self.fail_negotiation.load(Ordering::SeqCst) {
            Err(MediaError::Negotiation("mock negotiation failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MediaTransport for MockTransport {
    async fn create_offer(&self) -> Result<String, MediaError> {
        self.negotiation_guard()?;
        self.record("create_offer");
        Ok("v=0 mock-offer".to_string())
    }

    async fn accept_offer(&self, offer: &str) -> Result<String, MediaError> {
        self.negotiation_guard()?;
        self.record("accept_offer");
        Ok(format!("v=0 mock-answer-to [{offer}]"))
    }

    async fn apply_remote_answer(&self, _answer: &str) -> Result<(), MediaError> {
        self.negotiation_guard()?;
        self.record("apply_remote_answer");
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &CandidateInit) -> Result<(), MediaError> {
        self.state
            .lock()
            .unwrap()
            .applied_candidates
            .push(candidate.candidate.clone());
        Ok(())
    }

    async fn start_screen_share(&self) -> Result<(), MediaError> {
        // A fresh track object each time, like a new capture source.
        self.state.lock().unwrap().active_track = Arc::new("screen".to_string());
        Ok(())
    }

    async fn stop_screen_share(&self) -> Result<(), MediaError> {
        let mut state = self.state.lock().unwrap();
        let camera = state.camera_track.clone();
        state.active_track = camera;
        Ok(())
    }

    async fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> Result<(), MediaError> {
        let mut state = self.state.lock().unwrap();
        match kind {
            TrackKind::Audio => state.audio_enabled = enabled,
            TrackKind::Video => state.video_enabled = enabled,
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory handing out [`MockTransport`]s and remembering them so a
/// test can poke at the transport behind a manager.
#[derive(Default)]
pub struct MockFactory {
    fail_device: AtomicBool,
    created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `create` fail as if no capture device existed.
    pub fn fail_device(&self) {
        self.fail_device.store(true, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<Arc<MockTransport>> {
        self.created.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<Arc<MockTransport>> {
        self.created.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl MediaTransportFactory for MockFactory {
    async fn create(
        &self,
        _kind: CallKind,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn MediaTransport>, MediaError> {
        if self.fail_device.load(Ordering::SeqCst) {
            return Err(MediaError::DeviceUnavailable("no capture device".into()));
        }
        let transport = Arc::new(MockTransport::with_events(events));
        self.created.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

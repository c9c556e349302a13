//! Scripted engine and signal-sink implementations used by tests. Kept as a
//! real module so downstream integration tests can drive the connection
//! lifecycle without touching the network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use lantern_proto::{ClientMessage, SignalingEnvelope};

use crate::engine::{
    EngineEvent, EngineFactory, EngineOptions, EngineSignal, MediaHandle, PeerEngine,
};
use crate::error::TransportError;
use crate::peer::SignalSink;

/// One recorded engine invocation, in call order.
#[derive(Debug, Clone)]
pub enum EngineCall {
    Offer { ice_restart: bool },
    Answer,
    ApplyAnswer,
    Candidate(serde_json::Value),
    AttachMedia { tracks: usize },
    Close,
}

pub struct MockEngine {
    pub options: EngineOptions,
    calls: Mutex<Vec<EngineCall>>,
    /// Candidates that apply cleanly, in application order.
    applied: Mutex<Vec<serde_json::Value>>,
    /// Pop-front script: `true` means the next candidate application fails.
    candidate_failures: Mutex<VecDeque<bool>>,
    fail_negotiations: AtomicU32,
    events: mpsc::UnboundedSender<EngineEvent>,
    offer_counter: AtomicU32,
}

impl MockEngine {
    fn new(options: EngineOptions, events: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self {
            options,
            calls: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
            candidate_failures: Mutex::new(VecDeque::new()),
            fail_negotiations: AtomicU32::new(0),
            events,
            offer_counter: AtomicU32::new(0),
        }
    }

    /// Push a connection-level signal as if the underlying engine raised it.
    pub fn emit(&self, signal: EngineSignal) {
        let _ = self.events.send(EngineEvent::StateChanged(signal));
    }

    /// Surface a locally gathered candidate.
    pub fn emit_local_candidate(&self, candidate: serde_json::Value) {
        let _ = self.events.send(EngineEvent::LocalCandidate(candidate));
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().clone()
    }

    pub fn applied_candidates(&self) -> Vec<serde_json::Value> {
        self.applied.lock().clone()
    }

    /// Script the next candidate application to fail (subsequent ones pass).
    pub fn fail_next_candidate(&self) {
        self.candidate_failures.lock().push_back(true);
    }

    /// Explicitly mark the next candidate application as passing, useful when
    /// interleaving failures mid-script.
    pub fn pass_next_candidate(&self) {
        self.candidate_failures.lock().push_back(false);
    }

    pub fn fail_next_negotiations(&self, count: u32) {
        self.fail_negotiations.store(count, Ordering::SeqCst);
    }

    fn negotiation_gate(&self) -> Result<(), TransportError> {
        let remaining = self.fail_negotiations.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_negotiations.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::Negotiation("scripted failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerEngine for MockEngine {
    async fn create_offer(&self, ice_restart: bool) -> Result<serde_json::Value, TransportError> {
        self.calls.lock().push(EngineCall::Offer { ice_restart });
        self.negotiation_gate()?;
        let n = self.offer_counter.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::json!({ "sdp": format!("mock-offer-{n}") }))
    }

    async fn create_answer(
        &self,
        _remote_offer: &serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        self.calls.lock().push(EngineCall::Answer);
        self.negotiation_gate()?;
        Ok(serde_json::json!({ "sdp": "mock-answer" }))
    }

    async fn apply_answer(&self, _answer: &serde_json::Value) -> Result<(), TransportError> {
        self.calls.lock().push(EngineCall::ApplyAnswer);
        self.negotiation_gate()
    }

    async fn add_ice_candidate(
        &self,
        candidate: &serde_json::Value,
    ) -> Result<(), TransportError> {
        self.calls
            .lock()
            .push(EngineCall::Candidate(candidate.clone()));
        let fail = self.candidate_failures.lock().pop_front().unwrap_or(false);
        if fail {
            return Err(TransportError::Negotiation("scripted candidate failure".into()));
        }
        self.applied.lock().push(candidate.clone());
        Ok(())
    }

    async fn attach_media(&self, media: &MediaHandle) -> Result<(), TransportError> {
        self.calls.lock().push(EngineCall::AttachMedia {
            tracks: media.tracks.len(),
        });
        Ok(())
    }

    async fn close(&self) {
        self.calls.lock().push(EngineCall::Close);
    }
}

/// Factory handing out [`MockEngine`]s and remembering every engine it built
/// so tests can inspect them after the fact.
#[derive(Default)]
pub struct MockEngineFactory {
    created: Mutex<Vec<Arc<MockEngine>>>,
}

impl MockEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engines(&self) -> Vec<Arc<MockEngine>> {
        self.created.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<MockEngine>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl EngineFactory for MockEngineFactory {
    async fn create(
        &self,
        options: EngineOptions,
    ) -> Result<(Arc<dyn PeerEngine>, mpsc::UnboundedReceiver<EngineEvent>), TransportError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(MockEngine::new(options, events_tx));
        self.created.lock().push(Arc::clone(&engine));
        Ok((engine, events_rx))
    }
}

/// Signal sink collecting everything the manager and monitor try to send.
#[derive(Default)]
pub struct MockSink {
    envelopes: Mutex<Vec<SignalingEnvelope>>,
    messages: Mutex<Vec<ClientMessage>>,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn envelopes(&self) -> Vec<SignalingEnvelope> {
        self.envelopes.lock().clone()
    }

    pub fn messages(&self) -> Vec<ClientMessage> {
        self.messages.lock().clone()
    }
}

impl SignalSink for MockSink {
    fn send_envelope(&self, envelope: SignalingEnvelope) {
        self.envelopes.lock().push(envelope);
    }

    fn send_message(&self, message: ClientMessage) {
        self.messages.lock().push(message);
    }
}

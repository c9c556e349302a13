//! Per-peer connection lifecycle: one state machine per remote peer, with
//! ordered ICE-candidate buffering and duplicate-join replacement. All
//! operations for a single peer are strictly sequential (the record lock is
//! held across engine calls); peers are mutually independent.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::Instant;

use lantern_proto::{PeerId, SignalFlags, SignalKind, SignalingEnvelope, UserId};

use crate::engine::{
    EngineEvent, EngineFactory, EngineOptions, EngineSignal, MediaHandle, PeerEngine,
};
use crate::error::TransportError;

/// Where the manager drops outbound signaling. Fire-and-forget by design:
/// the transport logs and swallows sends while disconnected.
pub trait SignalSink: Send + Sync {
    fn send_envelope(&self, envelope: SignalingEnvelope);
    fn send_message(&self, message: lantern_proto::ClientMessage);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Bounded history of entered states, newest last.
pub const STATE_HISTORY_LIMIT: usize = 5;

/// Recovery ladder steps, cheapest first. Order is load-bearing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStage {
    IceRestart,
    RelayOnly,
    TransportReconnect,
}

/// Tracks what has been tried since the peer last failed. Reset on the next
/// connected signal, so "once per failure episode" holds for relay-only.
#[derive(Debug, Clone, Default)]
pub struct RecoveryEpisode {
    pub stages: Vec<RecoveryStage>,
    pub attempts: u32,
}

impl RecoveryEpisode {
    pub fn tried(&self, stage: RecoveryStage) -> bool {
        self.stages.contains(&stage)
    }
}

pub struct PeerConnectionRecord {
    pub peer_id: PeerId,
    pub display_name: String,
    pub state: PeerState,
    /// Candidates awaiting a remote description, in arrival order.
    pub ice_buffer: VecDeque<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub last_offer_sent_at: Option<DateTime<Utc>>,
    pub last_answer_received_at: Option<DateTime<Utc>>,
    pub last_remote_description_at: Option<DateTime<Utc>>,
    pub consecutive_heartbeat_failures: u32,
    pub state_history: VecDeque<(PeerState, DateTime<Utc>)>,
    pub offer_outstanding: bool,
    /// Monotonic markers used by the health monitor's grace windows.
    pub disconnected_at: Option<Instant>,
    pub last_positive_signal: Option<Instant>,
    pub recovery: RecoveryEpisode,
}

impl PeerConnectionRecord {
    fn new(peer_id: PeerId, display_name: String) -> Self {
        Self {
            peer_id,
            display_name,
            state: PeerState::New,
            ice_buffer: VecDeque::new(),
            created_at: Utc::now(),
            last_offer_sent_at: None,
            last_answer_received_at: None,
            last_remote_description_at: None,
            consecutive_heartbeat_failures: 0,
            state_history: VecDeque::new(),
            offer_outstanding: false,
            disconnected_at: None,
            last_positive_signal: None,
            recovery: RecoveryEpisode::default(),
        }
    }
}

/// Read-only view of a record, taken under the lock, handed to the monitor.
#[derive(Debug, Clone)]
pub struct PeerRecordSnapshot {
    pub peer_id: PeerId,
    pub display_name: String,
    pub state: PeerState,
    pub consecutive_heartbeat_failures: u32,
    pub disconnected_at: Option<Instant>,
    pub last_positive_signal: Option<Instant>,
    pub recovery: RecoveryEpisode,
    pub buffered_candidates: usize,
}

#[derive(Debug, Clone)]
pub struct PeerStateChange {
    pub peer_id: PeerId,
    pub previous: PeerState,
    pub current: PeerState,
    pub at: DateTime<Utc>,
}

struct PeerHandle {
    record: Arc<AsyncMutex<PeerConnectionRecord>>,
    engine: Arc<Mutex<Arc<dyn PeerEngine>>>,
    event_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PeerHandle {
    fn engine(&self) -> Arc<dyn PeerEngine> {
        Arc::clone(&self.engine.lock())
    }
}

pub struct PeerConnectionManager {
    user_id: UserId,
    user_name: String,
    local_peer_id: Mutex<PeerId>,
    factory: Arc<dyn EngineFactory>,
    sink: Arc<dyn SignalSink>,
    peers: AsyncMutex<HashMap<PeerId, Arc<PeerHandle>>>,
    /// Side table for candidates that arrive before the peer's join is
    /// observed. Adopted into the record's buffer on connect.
    early_candidates: Mutex<HashMap<PeerId, Vec<serde_json::Value>>>,
    local_media: Mutex<Option<MediaHandle>>,
    observers: Mutex<Vec<mpsc::UnboundedSender<PeerStateChange>>>,
}

impl PeerConnectionManager {
    pub fn new(
        user_id: impl Into<UserId>,
        user_name: impl Into<String>,
        factory: Arc<dyn EngineFactory>,
        sink: Arc<dyn SignalSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            local_peer_id: Mutex::new(String::new()),
            factory,
            sink,
            peers: AsyncMutex::new(HashMap::new()),
            early_candidates: Mutex::new(HashMap::new()),
            local_media: Mutex::new(None),
            observers: Mutex::new(Vec::new()),
        })
    }

    /// Record the peer id the relay assigned to our socket; stamped into the
    /// `from` field of every outbound envelope.
    pub fn set_local_peer_id(&self, peer_id: impl Into<PeerId>) {
        *self.local_peer_id.lock() = peer_id.into();
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id.lock().clone()
    }

    pub fn set_local_media(&self, media: MediaHandle) {
        *self.local_media.lock() = Some(media);
    }

    /// Subscribe to state transitions. The UI maps these to visual status;
    /// the core only reports.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PeerStateChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.lock().push(tx);
        rx
    }

    pub async fn get_state(&self, peer_id: &str) -> Option<PeerState> {
        let handle = self.handle(peer_id).await?;
        let record = handle.record.lock().await;
        Some(record.state)
    }

    pub async fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.lock().await.keys().cloned().collect()
    }

    pub async fn snapshots(&self) -> Vec<PeerRecordSnapshot> {
        let handles: Vec<Arc<PeerHandle>> = self.peers.lock().await.values().cloned().collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            let record = handle.record.lock().await;
            out.push(PeerRecordSnapshot {
                peer_id: record.peer_id.clone(),
                display_name: record.display_name.clone(),
                state: record.state,
                consecutive_heartbeat_failures: record.consecutive_heartbeat_failures,
                disconnected_at: record.disconnected_at,
                last_positive_signal: record.last_positive_signal,
                recovery: record.recovery.clone(),
                buffered_candidates: record.ice_buffer.len(),
            });
        }
        out
    }

    async fn handle(&self, peer_id: &str) -> Option<Arc<PeerHandle>> {
        self.peers.lock().await.get(peer_id).cloned()
    }

    fn envelope(
        &self,
        to: &str,
        kind: SignalKind,
        payload: serde_json::Value,
        flags: SignalFlags,
    ) -> SignalingEnvelope {
        SignalingEnvelope {
            to: to.to_string(),
            from: self.local_peer_id(),
            kind,
            payload,
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            flags,
        }
    }

    fn set_state(&self, record: &mut PeerConnectionRecord, next: PeerState) {
        if record.state == next {
            return;
        }
        let previous = record.state;
        record.state = next;
        let at = Utc::now();
        record.state_history.push_back((next, at));
        while record.state_history.len() > STATE_HISTORY_LIMIT {
            record.state_history.pop_front();
        }
        tracing::debug!(
            target = "mesh",
            peer = %record.peer_id,
            ?previous,
            current = ?next,
            "peer state transition"
        );
        let change = PeerStateChange {
            peer_id: record.peer_id.clone(),
            previous,
            current: next,
            at,
        };
        self.observers
            .lock()
            .retain(|tx| tx.send(change.clone()).is_ok());
    }

    /// Create (or replace) the record for `peer_id` and, when initiating,
    /// produce and send the first offer. Duplicate joins replace rather than
    /// duplicate: at most one live connection per peer.
    pub async fn connect(
        self: &Arc<Self>,
        peer_id: &str,
        display_name: &str,
        media: MediaHandle,
        initiate: bool,
    ) -> Result<(), TransportError> {
        *self.local_media.lock() = Some(media.clone());
        self.teardown(peer_id, false).await;

        let (engine, events) = self.factory.create(EngineOptions::default()).await?;
        engine.attach_media(&media).await?;

        let mut record = PeerConnectionRecord::new(peer_id.to_string(), display_name.to_string());
        let adopted = self.early_candidates.lock().remove(peer_id);
        if let Some(candidates) = adopted {
            tracing::debug!(
                target = "mesh",
                peer = %peer_id,
                count = candidates.len(),
                "adopting early candidates"
            );
            record.ice_buffer.extend(candidates);
        }

        let handle = Arc::new(PeerHandle {
            record: Arc::new(AsyncMutex::new(record)),
            engine: Arc::new(Mutex::new(engine)),
            event_task: Mutex::new(None),
        });
        self.peers
            .lock()
            .await
            .insert(peer_id.to_string(), Arc::clone(&handle));

        let task = self.spawn_event_task(peer_id.to_string(), events);
        *handle.event_task.lock() = Some(task);

        let mut record = handle.record.lock().await;
        self.set_state(&mut record, PeerState::Connecting);

        if initiate {
            let engine = handle.engine();
            let offer = self.offer_with_retry(&engine, false).await?;
            record.last_offer_sent_at = Some(Utc::now());
            record.offer_outstanding = true;
            self.sink.send_envelope(self.envelope(
                peer_id,
                SignalKind::Offer,
                offer,
                SignalFlags::default(),
            ));
        }
        Ok(())
    }

    /// Connect reusing the stored local media handle; used when the join
    /// event (rather than the UI) drives the connect.
    pub async fn connect_with_known_media(
        self: &Arc<Self>,
        peer_id: &str,
        display_name: &str,
        initiate: bool,
    ) -> Result<(), TransportError> {
        let media = self.local_media.lock().clone().unwrap_or_default();
        self.connect(peer_id, display_name, media, initiate).await
    }

    /// Replace a peer's engine in place, restarting its event pump. The old
    /// engine is closed; the record (and its buffered candidates) survives.
    async fn swap_engine(
        self: &Arc<Self>,
        peer_id: &str,
        handle: &Arc<PeerHandle>,
        options: EngineOptions,
    ) -> Result<Arc<dyn PeerEngine>, TransportError> {
        let (engine, events) = self.factory.create(options).await?;
        let media = self.local_media.lock().clone().unwrap_or_default();
        engine.attach_media(&media).await?;

        let previous = {
            let mut slot = handle.engine.lock();
            std::mem::replace(&mut *slot, Arc::clone(&engine))
        };
        previous.close().await;
        if let Some(task) = handle.event_task.lock().take() {
            task.abort();
        }
        let task = self.spawn_event_task(peer_id.to_string(), events);
        *handle.event_task.lock() = Some(task);
        Ok(engine)
    }

    fn spawn_event_task(
        self: &Arc<Self>,
        peer_id: PeerId,
        mut events: mpsc::UnboundedReceiver<EngineEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    EngineEvent::LocalCandidate(candidate) => {
                        manager.sink.send_envelope(manager.envelope(
                            &peer_id,
                            SignalKind::Candidate,
                            candidate,
                            SignalFlags::default(),
                        ));
                    }
                    EngineEvent::StateChanged(signal) => {
                        manager.on_engine_signal(&peer_id, signal).await;
                    }
                }
            }
        })
    }

    async fn on_engine_signal(&self, peer_id: &str, signal: EngineSignal) {
        let Some(handle) = self.handle(peer_id).await else {
            return;
        };
        let mut record = handle.record.lock().await;
        match signal {
            EngineSignal::Connected => {
                record.consecutive_heartbeat_failures = 0;
                record.disconnected_at = None;
                record.last_positive_signal = Some(Instant::now());
                record.recovery = RecoveryEpisode::default();
                self.set_state(&mut record, PeerState::Connected);
            }
            EngineSignal::Disconnected => {
                if record.state == PeerState::Connected {
                    record.disconnected_at = Some(Instant::now());
                    self.set_state(&mut record, PeerState::Disconnected);
                }
            }
            EngineSignal::Failed => {
                self.set_state(&mut record, PeerState::Failed);
            }
            EngineSignal::Closed => {
                self.set_state(&mut record, PeerState::Closed);
            }
        }
    }

    /// Apply a remote offer: set remote description, answer, then flush the
    /// candidate buffer in arrival order. Creates the record on the fly when
    /// the offer beats the join event.
    pub async fn handle_remote_offer(
        self: &Arc<Self>,
        envelope: &SignalingEnvelope,
    ) -> Result<(), TransportError> {
        if self.handle(&envelope.from).await.is_none() {
            let media = self.local_media.lock().clone().unwrap_or_default();
            self.connect(&envelope.from, &envelope.user_name, media, false)
                .await?;
        }
        let handle = self
            .handle(&envelope.from)
            .await
            .ok_or_else(|| TransportError::UnknownPeer(envelope.from.clone()))?;
        // A relay-only re-offer means the remote rebuilt its engine; mirror
        // that locally so both ends negotiate over relay candidates.
        let engine = if envelope.flags.relay_only {
            self.swap_engine(
                &envelope.from,
                &handle,
                EngineOptions { relay_only: true },
            )
            .await?
        } else {
            handle.engine()
        };
        let mut record = handle.record.lock().await;
        if envelope.flags.relay_only {
            // Candidates gathered for the discarded engine no longer apply.
            record.ice_buffer.clear();
        }

        let answer = match engine.create_answer(&envelope.payload).await {
            Ok(answer) => answer,
            Err(err) => {
                // One same-step retry before escalating to the recovery ladder.
                tracing::warn!(
                    target = "mesh",
                    peer = %envelope.from,
                    %err,
                    "answer negotiation failed, retrying once"
                );
                match engine.create_answer(&envelope.payload).await {
                    Ok(answer) => answer,
                    Err(err) => {
                        self.set_state(&mut record, PeerState::Failed);
                        return Err(err);
                    }
                }
            }
        };

        record.last_remote_description_at = Some(Utc::now());
        record.last_positive_signal = Some(Instant::now());
        self.sink.send_envelope(self.envelope(
            &envelope.from,
            SignalKind::Answer,
            answer,
            SignalFlags::default(),
        ));
        Self::flush_candidates(&engine, &mut record).await;
        Ok(())
    }

    /// Apply a remote answer. Only valid while an offer is outstanding; a
    /// replayed or stray answer is dropped with a warning, never fatal.
    pub async fn handle_remote_answer(
        &self,
        envelope: &SignalingEnvelope,
    ) -> Result<(), TransportError> {
        let Some(handle) = self.handle(&envelope.from).await else {
            tracing::warn!(target = "mesh", peer = %envelope.from, "answer for unknown peer dropped");
            return Ok(());
        };
        let engine = handle.engine();
        let mut record = handle.record.lock().await;

        if !record.offer_outstanding {
            tracing::warn!(
                target = "mesh",
                peer = %envelope.from,
                "answer with no outstanding offer dropped"
            );
            return Ok(());
        }

        if let Err(err) = engine.apply_answer(&envelope.payload).await {
            tracing::warn!(
                target = "mesh",
                peer = %envelope.from,
                %err,
                "applying answer failed, retrying once"
            );
            if let Err(err) = engine.apply_answer(&envelope.payload).await {
                self.set_state(&mut record, PeerState::Failed);
                return Err(err);
            }
        }

        record.offer_outstanding = false;
        let now = Utc::now();
        record.last_answer_received_at = Some(now);
        record.last_remote_description_at = Some(now);
        record.last_positive_signal = Some(Instant::now());
        Self::flush_candidates(&engine, &mut record).await;
        Ok(())
    }

    /// Buffer or apply a remote candidate. Candidates are never discarded:
    /// with no record yet they land in the side table; with no remote
    /// description they wait in the record's buffer; otherwise the buffer is
    /// flushed through in arrival order.
    pub async fn handle_remote_candidate(&self, envelope: &SignalingEnvelope) {
        let Some(handle) = self.handle(&envelope.from).await else {
            tracing::debug!(
                target = "mesh",
                peer = %envelope.from,
                "candidate before join observed, buffering speculatively"
            );
            self.early_candidates
                .lock()
                .entry(envelope.from.clone())
                .or_default()
                .push(envelope.payload.clone());
            return;
        };
        let engine = handle.engine();
        let mut record = handle.record.lock().await;
        record.ice_buffer.push_back(envelope.payload.clone());
        if record.last_remote_description_at.is_some() {
            Self::flush_candidates(&engine, &mut record).await;
        }
    }

    /// Sequential flush: each candidate fully applied before the next; one
    /// candidate's failure does not abort the rest.
    async fn flush_candidates(engine: &Arc<dyn PeerEngine>, record: &mut PeerConnectionRecord) {
        while let Some(candidate) = record.ice_buffer.pop_front() {
            if let Err(err) = engine.add_ice_candidate(&candidate).await {
                tracing::warn!(
                    target = "mesh",
                    peer = %record.peer_id,
                    %err,
                    "ice candidate rejected, continuing with remaining"
                );
            }
        }
    }

    /// Close and delete the peer's record, cancelling its timers and tasks.
    pub async fn remove(&self, peer_id: &str) {
        self.teardown(peer_id, true).await;
        self.early_candidates.lock().remove(peer_id);
    }

    async fn teardown(&self, peer_id: &str, notify_closed: bool) {
        let removed = self.peers.lock().await.remove(peer_id);
        let Some(handle) = removed else { return };
        if let Some(task) = handle.event_task.lock().take() {
            task.abort();
        }
        let engine = handle.engine();
        engine.close().await;
        if notify_closed {
            let mut record = handle.record.lock().await;
            self.set_state(&mut record, PeerState::Closed);
        }
    }

    /// Transport teardown: close every peer.
    pub async fn shutdown(&self) {
        let ids: Vec<PeerId> = self.peers.lock().await.keys().cloned().collect();
        for id in ids {
            self.remove(&id).await;
        }
    }

    // ---- health/recovery hooks used by the connection monitor ----

    /// A heartbeat went unanswered; returns the new consecutive count.
    pub async fn note_heartbeat_miss(&self, peer_id: &str) -> Option<u32> {
        let handle = self.handle(peer_id).await?;
        let mut record = handle.record.lock().await;
        record.consecutive_heartbeat_failures += 1;
        Some(record.consecutive_heartbeat_failures)
    }

    /// Any successful signal resets the soft failure counter.
    pub async fn note_positive_signal(&self, peer_id: &str) {
        if let Some(handle) = self.handle(peer_id).await {
            let mut record = handle.record.lock().await;
            record.consecutive_heartbeat_failures = 0;
            record.last_positive_signal = Some(Instant::now());
        }
    }

    pub async fn mark_failed(&self, peer_id: &str) {
        if let Some(handle) = self.handle(peer_id).await {
            let mut record = handle.record.lock().await;
            self.set_state(&mut record, PeerState::Failed);
        }
    }

    async fn offer_with_retry(
        &self,
        engine: &Arc<dyn PeerEngine>,
        ice_restart: bool,
    ) -> Result<serde_json::Value, TransportError> {
        match engine.create_offer(ice_restart).await {
            Ok(offer) => Ok(offer),
            Err(err) => {
                tracing::warn!(target = "mesh", %err, "offer negotiation failed, retrying once");
                engine.create_offer(ice_restart).await
            }
        }
    }

    /// Recovery step 1: ICE restart, preserving connection identity.
    pub async fn restart_ice(&self, peer_id: &str) -> Result<(), TransportError> {
        let handle = self
            .handle(peer_id)
            .await
            .ok_or_else(|| TransportError::UnknownPeer(peer_id.to_string()))?;
        let engine = handle.engine();
        let mut record = handle.record.lock().await;
        let offer = self.offer_with_retry(&engine, true).await?;
        record.last_offer_sent_at = Some(Utc::now());
        record.offer_outstanding = true;
        record.recovery.stages.push(RecoveryStage::IceRestart);
        record.recovery.attempts += 1;
        self.sink.send_envelope(self.envelope(
            peer_id,
            SignalKind::Offer,
            offer,
            SignalFlags {
                ice_restart: true,
                ..Default::default()
            },
        ));
        tracing::info!(target = "mesh", peer = %peer_id, "recovery: ice restart offer sent");
        Ok(())
    }

    /// Recovery step 2: rebuild the engine restricted to relay candidates and
    /// re-offer. Attempted once per failure episode.
    pub async fn relay_only_reoffer(self: &Arc<Self>, peer_id: &str) -> Result<(), TransportError> {
        let handle = self
            .handle(peer_id)
            .await
            .ok_or_else(|| TransportError::UnknownPeer(peer_id.to_string()))?;

        let engine = self
            .swap_engine(peer_id, &handle, EngineOptions { relay_only: true })
            .await?;
        let mut record = handle.record.lock().await;

        // Fresh connection: the old remote description no longer applies.
        record.last_remote_description_at = None;
        let offer = self.offer_with_retry(&engine, false).await?;
        record.last_offer_sent_at = Some(Utc::now());
        record.offer_outstanding = true;
        record.recovery.stages.push(RecoveryStage::RelayOnly);
        record.recovery.attempts += 1;
        self.sink.send_envelope(self.envelope(
            peer_id,
            SignalKind::Offer,
            offer,
            SignalFlags {
                relay_only: true,
                ..Default::default()
            },
        ));
        tracing::info!(target = "mesh", peer = %peer_id, "recovery: relay-only re-offer sent");
        Ok(())
    }

    /// Recovery step 3 marker: the transport itself was reconnected on this
    /// peer's behalf.
    pub async fn note_transport_reconnect(&self, peer_id: &str) {
        if let Some(handle) = self.handle(peer_id).await {
            let mut record = handle.record.lock().await;
            record.recovery.stages.push(RecoveryStage::TransportReconnect);
            record.recovery.attempts += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{EngineCall, MockEngineFactory, MockSink};
    use lantern_proto::SignalKind;

    fn manager_with_mocks() -> (
        Arc<PeerConnectionManager>,
        Arc<MockEngineFactory>,
        Arc<MockSink>,
    ) {
        let factory = Arc::new(MockEngineFactory::new());
        let sink = Arc::new(MockSink::new());
        let manager = PeerConnectionManager::new(
            "user-a",
            "Ada",
            Arc::clone(&factory) as Arc<dyn EngineFactory>,
            Arc::clone(&sink) as Arc<dyn SignalSink>,
        );
        manager.set_local_peer_id("peer-a");
        (manager, factory, sink)
    }

    fn candidate(n: u32) -> serde_json::Value {
        serde_json::json!({ "candidate": format!("candidate:{n}"), "sdpMid": "0" })
    }

    fn envelope_from(peer: &str, kind: SignalKind, payload: serde_json::Value) -> SignalingEnvelope {
        SignalingEnvelope {
            to: "peer-a".into(),
            from: peer.into(),
            kind,
            payload,
            user_id: format!("user-{peer}"),
            user_name: peer.to_string(),
            flags: SignalFlags::default(),
        }
    }

    #[tokio::test]
    async fn initiating_connect_sends_offer() {
        let (manager, factory, sink) = manager_with_mocks();
        manager
            .connect("peer-b", "Bea", MediaHandle::default(), true)
            .await
            .unwrap();

        let envelopes = sink.envelopes();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].kind, SignalKind::Offer);
        assert_eq!(envelopes[0].to, "peer-b");
        assert_eq!(envelopes[0].from, "peer-a");
        assert_eq!(
            manager.get_state("peer-b").await,
            Some(PeerState::Connecting)
        );
        assert!(factory.last().is_some());
    }

    #[tokio::test]
    async fn duplicate_join_replaces_record() {
        let (manager, factory, _sink) = manager_with_mocks();
        manager
            .connect("peer-b", "Bea", MediaHandle::default(), false)
            .await
            .unwrap();
        manager
            .connect("peer-b", "Bea", MediaHandle::default(), false)
            .await
            .unwrap();

        assert_eq!(manager.peer_ids().await.len(), 1);
        // Two engines were created; the first was closed by the replacement.
        let engines = factory.engines();
        assert_eq!(engines.len(), 2);
        assert!(engines[0]
            .calls()
            .iter()
            .any(|call| matches!(call, EngineCall::Close)));
    }

    #[tokio::test]
    async fn candidates_buffer_until_remote_description_then_apply_in_order() {
        let (manager, factory, _sink) = manager_with_mocks();
        manager
            .connect("peer-b", "Bea", MediaHandle::default(), false)
            .await
            .unwrap();

        for n in 0..3 {
            manager
                .handle_remote_candidate(&envelope_from("peer-b", SignalKind::Candidate, candidate(n)))
                .await;
        }
        let engine = factory.last().unwrap();
        assert!(engine.applied_candidates().is_empty());

        manager
            .handle_remote_offer(&envelope_from(
                "peer-b",
                SignalKind::Offer,
                serde_json::json!({ "sdp": "remote-offer" }),
            ))
            .await
            .unwrap();

        let applied = engine.applied_candidates();
        assert_eq!(applied.len(), 3);
        for (n, value) in applied.iter().enumerate() {
            assert_eq!(value, &candidate(n as u32));
        }
    }

    #[tokio::test]
    async fn candidate_before_join_lands_in_side_table_and_is_adopted() {
        let (manager, factory, _sink) = manager_with_mocks();

        manager
            .handle_remote_candidate(&envelope_from("peer-b", SignalKind::Candidate, candidate(7)))
            .await;
        assert!(manager.get_state("peer-b").await.is_none());

        manager
            .connect("peer-b", "Bea", MediaHandle::default(), false)
            .await
            .unwrap();
        manager
            .handle_remote_offer(&envelope_from(
                "peer-b",
                SignalKind::Offer,
                serde_json::json!({ "sdp": "remote-offer" }),
            ))
            .await
            .unwrap();

        let engine = factory.last().unwrap();
        assert_eq!(engine.applied_candidates(), vec![candidate(7)]);
    }

    #[tokio::test]
    async fn one_failed_candidate_does_not_abort_the_rest() {
        let (manager, factory, _sink) = manager_with_mocks();
        manager
            .connect("peer-b", "Bea", MediaHandle::default(), false)
            .await
            .unwrap();
        let engine = factory.last().unwrap();
        // Second of three candidates fails.
        engine.pass_next_candidate();
        engine.fail_next_candidate();

        for n in 0..3 {
            manager
                .handle_remote_candidate(&envelope_from("peer-b", SignalKind::Candidate, candidate(n)))
                .await;
        }
        manager
            .handle_remote_offer(&envelope_from(
                "peer-b",
                SignalKind::Offer,
                serde_json::json!({ "sdp": "remote-offer" }),
            ))
            .await
            .unwrap();

        assert_eq!(
            engine.applied_candidates(),
            vec![candidate(0), candidate(2)]
        );
    }

    #[tokio::test]
    async fn stray_answer_is_dropped() {
        let (manager, factory, _sink) = manager_with_mocks();
        manager
            .connect("peer-b", "Bea", MediaHandle::default(), false)
            .await
            .unwrap();

        manager
            .handle_remote_answer(&envelope_from(
                "peer-b",
                SignalKind::Answer,
                serde_json::json!({ "sdp": "stray" }),
            ))
            .await
            .unwrap();

        let engine = factory.last().unwrap();
        assert!(!engine
            .calls()
            .iter()
            .any(|call| matches!(call, EngineCall::ApplyAnswer)));
    }

    #[tokio::test]
    async fn answer_accepted_only_while_offer_outstanding() {
        let (manager, factory, _sink) = manager_with_mocks();
        manager
            .connect("peer-b", "Bea", MediaHandle::default(), true)
            .await
            .unwrap();

        manager
            .handle_remote_answer(&envelope_from(
                "peer-b",
                SignalKind::Answer,
                serde_json::json!({ "sdp": "answer" }),
            ))
            .await
            .unwrap();
        let engine = factory.last().unwrap();
        let applied = engine
            .calls()
            .iter()
            .filter(|call| matches!(call, EngineCall::ApplyAnswer))
            .count();
        assert_eq!(applied, 1);

        // Replay: no outstanding offer anymore, so it must be dropped.
        manager
            .handle_remote_answer(&envelope_from(
                "peer-b",
                SignalKind::Answer,
                serde_json::json!({ "sdp": "answer" }),
            ))
            .await
            .unwrap();
        let applied = engine
            .calls()
            .iter()
            .filter(|call| matches!(call, EngineCall::ApplyAnswer))
            .count();
        assert_eq!(applied, 1);
    }

    #[tokio::test]
    async fn remote_offer_produces_answer_and_record() {
        let (manager, _factory, sink) = manager_with_mocks();
        manager
            .handle_remote_offer(&envelope_from(
                "peer-b",
                SignalKind::Offer,
                serde_json::json!({ "sdp": "remote-offer" }),
            ))
            .await
            .unwrap();

        assert!(manager.get_state("peer-b").await.is_some());
        let answers: Vec<_> = sink
            .envelopes()
            .into_iter()
            .filter(|e| e.kind == SignalKind::Answer)
            .collect();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].to, "peer-b");
    }

    #[tokio::test]
    async fn negotiation_retries_once_then_escalates() {
        let (manager, factory, _sink) = manager_with_mocks();
        manager
            .connect("peer-b", "Bea", MediaHandle::default(), false)
            .await
            .unwrap();
        let engine = factory.last().unwrap();
        engine.fail_next_negotiations(2);

        let result = manager
            .handle_remote_offer(&envelope_from(
                "peer-b",
                SignalKind::Offer,
                serde_json::json!({ "sdp": "remote-offer" }),
            ))
            .await;
        assert!(result.is_err());
        assert_eq!(manager.get_state("peer-b").await, Some(PeerState::Failed));
    }

    #[tokio::test]
    async fn single_retry_recovers_transient_negotiation_failure() {
        let (manager, factory, sink) = manager_with_mocks();
        manager
            .connect("peer-b", "Bea", MediaHandle::default(), false)
            .await
            .unwrap();
        let engine = factory.last().unwrap();
        engine.fail_next_negotiations(1);

        manager
            .handle_remote_offer(&envelope_from(
                "peer-b",
                SignalKind::Offer,
                serde_json::json!({ "sdp": "remote-offer" }),
            ))
            .await
            .unwrap();
        assert!(sink
            .envelopes()
            .iter()
            .any(|e| e.kind == SignalKind::Answer));
    }

    #[tokio::test]
    async fn remove_closes_engine_and_frees_record() {
        let (manager, factory, _sink) = manager_with_mocks();
        manager
            .connect("peer-b", "Bea", MediaHandle::default(), false)
            .await
            .unwrap();
        manager.remove("peer-b").await;

        assert!(manager.get_state("peer-b").await.is_none());
        let engine = factory.last().unwrap();
        assert!(engine
            .calls()
            .iter()
            .any(|call| matches!(call, EngineCall::Close)));
    }

    #[tokio::test]
    async fn engine_connected_signal_resets_failure_state() {
        let (manager, factory, _sink) = manager_with_mocks();
        manager
            .connect("peer-b", "Bea", MediaHandle::default(), false)
            .await
            .unwrap();
        manager.note_heartbeat_miss("peer-b").await;
        manager.note_heartbeat_miss("peer-b").await;

        let engine = factory.last().unwrap();
        engine.emit(crate::engine::EngineSignal::Connected);
        // Let the event task run.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert_eq!(manager.get_state("peer-b").await, Some(PeerState::Connected));
        let snapshot = &manager.snapshots().await[0];
        assert_eq!(snapshot.consecutive_heartbeat_failures, 0);
    }

    #[tokio::test]
    async fn local_candidates_are_forwarded_to_the_sink() {
        let (manager, factory, sink) = manager_with_mocks();
        manager
            .connect("peer-b", "Bea", MediaHandle::default(), false)
            .await
            .unwrap();
        let engine = factory.last().unwrap();
        engine.emit_local_candidate(candidate(42));
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let sent: Vec<_> = sink
            .envelopes()
            .into_iter()
            .filter(|e| e.kind == SignalKind::Candidate)
            .collect();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, candidate(42));
    }
}

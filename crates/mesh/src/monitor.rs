//! Connection health monitor: the single scheduler of the client core. One
//! task owns the sweep timer and the transport event stream, dispatches
//! signaling into the peer manager, probes peers with out-of-band heartbeats,
//! and walks the recovery ladder when a peer fails.
//!
//! The ladder is strictly ordered per failure episode: ICE restart first,
//! then a relay-only re-offer (once per episode), then a full transport
//! reconnect when the signaling channel itself is down. A peer is abandoned
//! only when presence says it left.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use lantern_proto::{ClientMessage, PeerId, SignalKind, UserId};

use crate::config::MeshConfig;
use crate::peer::{PeerConnectionManager, PeerRecordSnapshot, PeerState, RecoveryStage, SignalSink};
use crate::signaling::{TransportControl, TransportEvent};

enum MonitorCommand {
    NetworkOnline(bool),
}

/// Control handle for a running monitor. Dropping it stops the task.
pub struct MonitorHandle {
    commands: mpsc::UnboundedSender<MonitorCommand>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MonitorHandle {
    /// Feed OS-level connectivity transitions. Coming back online re-runs
    /// transport reconnection and re-validates every peer.
    pub fn set_network_online(&self, online: bool) {
        let _ = self.commands.send(MonitorCommand::NetworkOnline(online));
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

pub struct ConnectionHealthMonitor {
    config: MeshConfig,
    manager: Arc<PeerConnectionManager>,
    sink: Arc<dyn SignalSink>,
    transport: Arc<dyn TransportControl>,
    /// Which logical user each peer endpoint belongs to, learned from
    /// presence events and envelopes.
    peer_users: HashMap<PeerId, UserId>,
    /// Outstanding heartbeat probes by peer.
    pending_probes: HashMap<PeerId, u64>,
    last_recovery_step: HashMap<PeerId, Instant>,
    network_online: bool,
    nonce: u64,
    /// Events forwarded verbatim for the embedding application (voice
    /// rosters, presence, terminal transport states).
    app_events: mpsc::UnboundedSender<TransportEvent>,
}

impl ConnectionHealthMonitor {
    /// Spawn the monitor task. Returns the control handle and a forwarded
    /// copy of the transport event stream for the embedding application.
    pub fn start(
        config: MeshConfig,
        manager: Arc<PeerConnectionManager>,
        sink: Arc<dyn SignalSink>,
        transport: Arc<dyn TransportControl>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> (MonitorHandle, mpsc::UnboundedReceiver<TransportEvent>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (app_tx, app_rx) = mpsc::unbounded_channel();
        let monitor = Self {
            config,
            manager,
            sink,
            transport,
            peer_users: HashMap::new(),
            pending_probes: HashMap::new(),
            last_recovery_step: HashMap::new(),
            network_online: true,
            nonce: 0,
            app_events: app_tx,
        };
        let task = tokio::spawn(monitor.run(events, commands_rx));
        (
            MonitorHandle {
                commands: commands_tx,
                task: Mutex::new(Some(task)),
            },
            app_rx,
        )
    }

    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut commands: mpsc::UnboundedReceiver<MonitorCommand>,
    ) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = sweep.tick() => self.sweep().await,
                command = commands.recv() => {
                    match command {
                        Some(MonitorCommand::NetworkOnline(online)) => {
                            self.on_network_change(online).await;
                        }
                        None => return,
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        tracing::debug!(target = "mesh", "transport event stream ended");
                        return;
                    };
                    self.handle_event(event).await;
                }
            }
        }
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        let _ = self.app_events.send(event.clone());
        match event {
            TransportEvent::RoomJoined {
                room_id,
                peer_id,
                members,
            } => {
                tracing::info!(
                    target = "mesh",
                    room = %room_id,
                    members = members.len(),
                    "room joined, seeding outbound connects"
                );
                self.manager.set_local_peer_id(peer_id);
                // The newcomer initiates toward every existing member.
                for member in members {
                    self.peer_users
                        .insert(member.peer_id.clone(), member.user_id.clone());
                    if let Err(err) = self
                        .manager
                        .connect_with_known_media(&member.peer_id, &member.display_name, true)
                        .await
                    {
                        tracing::warn!(
                            target = "mesh",
                            peer = %member.peer_id,
                            %err,
                            "seeded connect failed"
                        );
                    }
                }
            }
            TransportEvent::UserJoined { member } => {
                // The joining side initiates; we just learn the mapping.
                self.peer_users.insert(member.peer_id, member.user_id);
            }
            TransportEvent::UserLeft { user_id } => {
                self.abandon_user(&user_id).await;
            }
            TransportEvent::Signal { envelope } => {
                self.peer_users
                    .insert(envelope.from.clone(), envelope.user_id.clone());
                self.manager.note_positive_signal(&envelope.from).await;
                let result = match envelope.kind {
                    SignalKind::Offer => self.manager.handle_remote_offer(&envelope).await,
                    SignalKind::Answer => self.manager.handle_remote_answer(&envelope).await,
                    SignalKind::Candidate => {
                        self.manager.handle_remote_candidate(&envelope).await;
                        Ok(())
                    }
                };
                if let Err(err) = result {
                    // The peer is marked failed by the manager; the next
                    // sweep walks the recovery ladder.
                    tracing::warn!(
                        target = "mesh",
                        peer = %envelope.from,
                        kind = ?envelope.kind,
                        %err,
                        "signal handling failed"
                    );
                }
            }
            TransportEvent::PingRequest { from, nonce } => {
                self.sink
                    .send_message(ClientMessage::PingResponse { to: from, nonce });
            }
            TransportEvent::PingResponse { from, nonce: _ } => {
                let peers: Vec<PeerId> = self
                    .peer_users
                    .iter()
                    .filter(|(_, user)| **user == from)
                    .map(|(peer, _)| peer.clone())
                    .collect();
                for peer in peers {
                    if self.pending_probes.remove(&peer).is_some() {
                        self.manager.note_positive_signal(&peer).await;
                    }
                }
            }
            TransportEvent::Reconnected => {
                tracing::info!(target = "mesh", "transport reconnected, re-validating peers");
                self.revalidate_peers().await;
            }
            TransportEvent::GaveUp => {
                tracing::error!(
                    target = "mesh",
                    "signaling transport gave up; waiting for an explicit reconnect"
                );
            }
            // Voice and presence traffic is application-level; already
            // forwarded above.
            TransportEvent::VoiceRoster { .. }
            | TransportEvent::VoiceStateChanged { .. }
            | TransportEvent::VoiceParticipantLeft { .. }
            | TransportEvent::PresenceUpdate { .. } => {}
        }
    }

    /// Presence says the user left: the only path that abandons peers.
    async fn abandon_user(&mut self, user_id: &str) {
        let peers: Vec<PeerId> = self
            .peer_users
            .iter()
            .filter(|(_, user)| user.as_str() == user_id)
            .map(|(peer, _)| peer.clone())
            .collect();
        for peer in peers {
            tracing::info!(target = "mesh", %peer, user = %user_id, "peer left, closing");
            self.manager.remove(&peer).await;
            self.peer_users.remove(&peer);
            self.pending_probes.remove(&peer);
            self.last_recovery_step.remove(&peer);
        }
    }

    async fn on_network_change(&mut self, online: bool) {
        if self.network_online == online {
            return;
        }
        self.network_online = online;
        if online {
            tracing::info!(target = "mesh", "network back online");
            self.transport.request_reconnect();
            self.revalidate_peers().await;
        } else {
            tracing::warn!(target = "mesh", "network offline, pausing probes");
            self.pending_probes.clear();
        }
    }

    /// After a transport-level reconnect, every non-connected peer gets an
    /// immediate recovery step regardless of the sweep throttle.
    async fn revalidate_peers(&mut self) {
        for snapshot in self.manager.snapshots().await {
            if snapshot.state == PeerState::Connected {
                continue;
            }
            self.last_recovery_step.remove(&snapshot.peer_id);
            self.recover(&snapshot).await;
        }
    }

    async fn sweep(&mut self) {
        if !self.network_online {
            return;
        }
        for snapshot in self.manager.snapshots().await {
            match snapshot.state {
                PeerState::Connected | PeerState::Connecting => {
                    self.probe(&snapshot).await;
                }
                PeerState::Disconnected => {
                    let expired = snapshot
                        .disconnected_at
                        .map(|at| at.elapsed() >= self.config.disconnect_grace)
                        .unwrap_or(false);
                    if expired {
                        tracing::warn!(
                            target = "mesh",
                            peer = %snapshot.peer_id,
                            "disconnect grace expired, marking failed"
                        );
                        self.manager.mark_failed(&snapshot.peer_id).await;
                        self.recover(&snapshot).await;
                    }
                }
                PeerState::Failed => {
                    self.recover(&snapshot).await;
                }
                PeerState::New | PeerState::Closed => {}
            }
        }
    }

    /// One heartbeat per peer per sweep. A probe still pending from the
    /// previous sweep counts as a miss; hard transitions happen only at the
    /// consecutive threshold, and only without a recent offsetting signal.
    async fn probe(&mut self, snapshot: &PeerRecordSnapshot) {
        let peer_id = &snapshot.peer_id;
        if self.pending_probes.contains_key(peer_id) {
            if let Some(misses) = self.manager.note_heartbeat_miss(peer_id).await {
                let recently_alive = snapshot
                    .last_positive_signal
                    .map(|at| at.elapsed() < self.config.sweep_interval * 2)
                    .unwrap_or(false);
                if misses >= self.config.heartbeat_failure_threshold && !recently_alive {
                    tracing::warn!(
                        target = "mesh",
                        peer = %peer_id,
                        misses,
                        "heartbeat threshold reached, marking failed"
                    );
                    self.pending_probes.remove(peer_id);
                    self.manager.mark_failed(peer_id).await;
                    self.recover(snapshot).await;
                    return;
                }
            }
        }
        let Some(user) = self.peer_users.get(peer_id) else {
            return;
        };
        self.nonce += 1;
        self.pending_probes.insert(peer_id.clone(), self.nonce);
        self.sink.send_message(ClientMessage::PingUserRequest {
            to: user.clone(),
            nonce: self.nonce,
        });
    }

    /// Walk one step of the recovery ladder, throttled so a step gets a
    /// grace window to take effect before the next one fires.
    async fn recover(&mut self, snapshot: &PeerRecordSnapshot) {
        let peer_id = &snapshot.peer_id;
        if let Some(last) = self.last_recovery_step.get(peer_id) {
            if last.elapsed() < self.config.disconnect_grace {
                return;
            }
        }
        self.last_recovery_step.insert(peer_id.clone(), Instant::now());

        if !snapshot.recovery.tried(RecoveryStage::IceRestart) {
            if let Err(err) = self.manager.restart_ice(peer_id).await {
                tracing::warn!(target = "mesh", peer = %peer_id, %err, "ice restart failed");
            }
        } else if !snapshot.recovery.tried(RecoveryStage::RelayOnly) {
            if let Err(err) = self.manager.relay_only_reoffer(peer_id).await {
                tracing::warn!(target = "mesh", peer = %peer_id, %err, "relay-only re-offer failed");
            }
        } else if !self.transport.is_connected() {
            tracing::warn!(
                target = "mesh",
                peer = %peer_id,
                "signaling transport down, requesting reconnect"
            );
            self.transport.request_reconnect();
            self.manager.note_transport_reconnect(peer_id).await;
        } else {
            // Ladder exhausted; the peer stays failed until presence removes
            // it or a remote offer revives it. Attempts remain visible to
            // the application through snapshots.
            tracing::debug!(
                target = "mesh",
                peer = %peer_id,
                attempts = snapshot.recovery.attempts,
                "recovery ladder exhausted, holding"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineFactory, EngineSignal};
    use crate::mock::{MockEngineFactory, MockSink};
    use chrono::Utc;
    use lantern_proto::RoomMember;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    struct MockTransport {
        connected: AtomicBool,
        reconnect_requests: AtomicU32,
    }

    impl MockTransport {
        fn new(connected: bool) -> Arc<Self> {
            Arc::new(Self {
                connected: AtomicBool::new(connected),
                reconnect_requests: AtomicU32::new(0),
            })
        }

        fn reconnects(&self) -> u32 {
            self.reconnect_requests.load(Ordering::SeqCst)
        }
    }

    impl TransportControl for MockTransport {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn request_reconnect(&self) {
            self.reconnect_requests.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_config() -> MeshConfig {
        MeshConfig::new("http://localhost:8080").sweep_interval(Duration::from_millis(50))
    }

    fn member(peer_id: &str, user_id: &str) -> RoomMember {
        RoomMember {
            user_id: user_id.into(),
            display_name: user_id.into(),
            peer_id: peer_id.into(),
            joined_at: Utc::now(),
        }
    }

    struct Harness {
        manager: Arc<PeerConnectionManager>,
        factory: Arc<MockEngineFactory>,
        sink: Arc<MockSink>,
        transport: Arc<MockTransport>,
        events: mpsc::UnboundedSender<TransportEvent>,
        _handle: MonitorHandle,
        _app_events: mpsc::UnboundedReceiver<TransportEvent>,
    }

    fn start_harness(transport_connected: bool) -> Harness {
        let factory = Arc::new(MockEngineFactory::new());
        let sink = Arc::new(MockSink::new());
        let transport = MockTransport::new(transport_connected);
        let manager = PeerConnectionManager::new(
            "user-a",
            "Ada",
            Arc::clone(&factory) as Arc<dyn EngineFactory>,
            Arc::clone(&sink) as Arc<dyn SignalSink>,
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (handle, app_events) = ConnectionHealthMonitor::start(
            test_config(),
            Arc::clone(&manager),
            Arc::clone(&sink) as Arc<dyn SignalSink>,
            Arc::clone(&transport) as Arc<dyn TransportControl>,
            events_rx,
        );
        Harness {
            manager,
            factory,
            sink,
            transport,
            events: events_tx,
            _handle: handle,
            _app_events: app_events,
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    // Let the interval's immediate first tick land on an empty peer set so
    // sweep timings are deterministic relative to the join.
    async fn join_room(harness: &Harness, peer_id: &str, user_id: &str) {
        tokio::time::sleep(Duration::from_millis(10)).await;
        harness
            .events
            .send(TransportEvent::RoomJoined {
                room_id: "room-1".into(),
                peer_id: "peer-a".into(),
                members: vec![member(peer_id, user_id)],
            })
            .unwrap();
        settle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn room_joined_seeds_outbound_connects() {
        let harness = start_harness(true);
        join_room(&harness, "peer-b", "user-b").await;

        assert_eq!(
            harness.manager.get_state("peer-b").await,
            Some(PeerState::Connecting)
        );
        // The newcomer initiates: exactly one offer toward the member.
        let offers: Vec<_> = harness
            .sink
            .envelopes()
            .into_iter()
            .filter(|e| e.kind == SignalKind::Offer)
            .collect();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].to, "peer-b");
    }

    #[tokio::test(start_paused = true)]
    async fn missed_heartbeats_with_offsetting_signal_never_fail_the_peer() {
        let harness = start_harness(true);
        join_room(&harness, "peer-b", "user-b").await;
        harness
            .factory
            .last()
            .unwrap()
            .emit(EngineSignal::Connected);
        settle().await;

        // Three sweeps with no responses: one probe issued, then two misses.
        tokio::time::sleep(Duration::from_millis(160)).await;
        let snapshot = &harness.manager.snapshots().await[0];
        assert_eq!(snapshot.consecutive_heartbeat_failures, 2);

        // A successful signal resets the soft counter before the third miss.
        harness
            .events
            .send(TransportEvent::PingResponse {
                from: "user-b".into(),
                nonce: 0,
            })
            .unwrap();
        settle().await;

        tokio::time::sleep(Duration::from_millis(110)).await;
        assert_eq!(
            harness.manager.get_state("peer-b").await,
            Some(PeerState::Connected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_heartbeat_loss_marks_failed_and_starts_recovery() {
        let harness = start_harness(true);
        join_room(&harness, "peer-b", "user-b").await;
        harness
            .factory
            .last()
            .unwrap()
            .emit(EngineSignal::Connected);
        settle().await;

        // Probe + three consecutive misses with no offsetting signal.
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(
            harness.manager.get_state("peer-b").await,
            Some(PeerState::Failed)
        );
        assert!(harness
            .sink
            .envelopes()
            .iter()
            .any(|e| e.kind == SignalKind::Offer && e.flags.ice_restart));
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_escalates_ice_restart_then_relay_only_then_transport() {
        let harness = start_harness(false);
        join_room(&harness, "peer-b", "user-b").await;
        harness.factory.last().unwrap().emit(EngineSignal::Failed);
        settle().await;

        // Step 1: ICE restart on the first failed sweep.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let offers: Vec<_> = harness
            .sink
            .envelopes()
            .into_iter()
            .filter(|e| e.kind == SignalKind::Offer)
            .collect();
        assert!(offers.last().unwrap().flags.ice_restart);
        assert_eq!(harness.factory.engines().len(), 1);

        // Step 2: relay-only re-offer after the grace window, on a fresh
        // engine restricted to relay candidates.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(harness.factory.engines().len(), 2);
        assert!(harness.factory.last().unwrap().options.relay_only);
        let offers: Vec<_> = harness
            .sink
            .envelopes()
            .into_iter()
            .filter(|e| e.kind == SignalKind::Offer)
            .collect();
        assert!(offers.last().unwrap().flags.relay_only);
        assert_eq!(harness.transport.reconnects(), 0);

        // Step 3: transport reconnect, only because the transport is down.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(harness.transport.reconnects() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_grace_expiry_escalates_to_failed() {
        let harness = start_harness(true);
        join_room(&harness, "peer-b", "user-b").await;
        let engine = harness.factory.last().unwrap();
        engine.emit(EngineSignal::Connected);
        settle().await;
        engine.emit(EngineSignal::Disconnected);
        settle().await;
        assert_eq!(
            harness.manager.get_state("peer-b").await,
            Some(PeerState::Disconnected)
        );

        // Grace is 2x the sweep interval; past it the peer fails over.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let state = harness.manager.get_state("peer-b").await;
        assert_ne!(state, Some(PeerState::Disconnected));
        assert!(harness
            .sink
            .envelopes()
            .iter()
            .any(|e| e.kind == SignalKind::Offer && e.flags.ice_restart));
    }

    #[tokio::test(start_paused = true)]
    async fn user_left_is_the_only_abandonment_path() {
        let harness = start_harness(true);
        join_room(&harness, "peer-b", "user-b").await;
        harness.factory.last().unwrap().emit(EngineSignal::Failed);
        settle().await;

        // Repeated failed sweeps keep the record alive.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(harness.manager.get_state("peer-b").await.is_some());

        harness
            .events
            .send(TransportEvent::UserLeft {
                user_id: "user-b".into(),
            })
            .unwrap();
        settle().await;
        assert!(harness.manager.get_state("peer-b").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ping_requests_are_answered_with_responses() {
        let harness = start_harness(true);
        harness
            .events
            .send(TransportEvent::PingRequest {
                from: "user-b".into(),
                nonce: 9,
            })
            .unwrap();
        settle().await;

        let responses: Vec<_> = harness
            .sink
            .messages()
            .into_iter()
            .filter(|m| matches!(m, ClientMessage::PingResponse { nonce: 9, .. }))
            .collect();
        assert_eq!(responses.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn incoming_offer_creates_record_and_answers() {
        let harness = start_harness(true);
        harness
            .events
            .send(TransportEvent::Signal {
                envelope: lantern_proto::SignalingEnvelope {
                    to: "peer-a".into(),
                    from: "peer-b".into(),
                    kind: SignalKind::Offer,
                    payload: serde_json::json!({ "sdp": "remote-offer" }),
                    user_id: "user-b".into(),
                    user_name: "Bea".into(),
                    flags: Default::default(),
                },
            })
            .unwrap();
        settle().await;

        assert_eq!(
            harness.manager.get_state("peer-b").await,
            Some(PeerState::Connecting)
        );
        assert!(harness
            .sink
            .envelopes()
            .iter()
            .any(|e| e.kind == SignalKind::Answer && e.to == "peer-b"));
    }

    // Two managers wired back-to-back through in-process sinks: early
    // candidates on both sides all land once both descriptions are set.
    #[tokio::test]
    async fn two_peer_mesh_applies_every_early_candidate() {
        let factory_a = Arc::new(MockEngineFactory::new());
        let factory_b = Arc::new(MockEngineFactory::new());
        let sink_a = Arc::new(MockSink::new());
        let sink_b = Arc::new(MockSink::new());
        let manager_a = PeerConnectionManager::new(
            "user-a",
            "Ada",
            Arc::clone(&factory_a) as Arc<dyn EngineFactory>,
            Arc::clone(&sink_a) as Arc<dyn SignalSink>,
        );
        let manager_b = PeerConnectionManager::new(
            "user-b",
            "Bea",
            Arc::clone(&factory_b) as Arc<dyn EngineFactory>,
            Arc::clone(&sink_b) as Arc<dyn SignalSink>,
        );
        manager_a.set_local_peer_id("peer-a");
        manager_b.set_local_peer_id("peer-b");

        let candidate = |n: u32| serde_json::json!({ "candidate": format!("candidate:{n}") });
        let envelope = |from: &str, to: &str, kind, payload| lantern_proto::SignalingEnvelope {
            to: to.into(),
            from: from.into(),
            kind,
            payload,
            user_id: format!("user-{from}"),
            user_name: from.into(),
            flags: Default::default(),
        };

        // Three candidates from each side arrive before any descriptions.
        for n in 0..3 {
            manager_a
                .handle_remote_candidate(&envelope(
                    "peer-b",
                    "peer-a",
                    SignalKind::Candidate,
                    candidate(n),
                ))
                .await;
            manager_b
                .handle_remote_candidate(&envelope(
                    "peer-a",
                    "peer-b",
                    SignalKind::Candidate,
                    candidate(n + 10),
                ))
                .await;
        }

        // A initiates; relay the offer to B and the answer back to A.
        manager_a
            .connect("peer-b", "Bea", Default::default(), true)
            .await
            .unwrap();
        let offer = sink_a
            .envelopes()
            .into_iter()
            .find(|e| e.kind == SignalKind::Offer)
            .unwrap();
        manager_b
            .handle_remote_offer(&envelope("peer-a", "peer-b", SignalKind::Offer, offer.payload))
            .await
            .unwrap();
        let answer = sink_b
            .envelopes()
            .into_iter()
            .find(|e| e.kind == SignalKind::Answer)
            .unwrap();
        manager_a
            .handle_remote_answer(&envelope(
                "peer-b",
                "peer-a",
                SignalKind::Answer,
                answer.payload,
            ))
            .await
            .unwrap();

        // Both sides report connected and every candidate applied once.
        factory_a.last().unwrap().emit(EngineSignal::Connected);
        factory_b.last().unwrap().emit(EngineSignal::Connected);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            manager_a.get_state("peer-b").await,
            Some(PeerState::Connected)
        );
        assert_eq!(
            manager_b.get_state("peer-a").await,
            Some(PeerState::Connected)
        );
        let applied_a = factory_a.last().unwrap().applied_candidates();
        let applied_b = factory_b.last().unwrap().applied_candidates();
        assert_eq!(applied_a.len() + applied_b.len(), 6);
        assert_eq!(applied_a, vec![candidate(0), candidate(1), candidate(2)]);
        assert_eq!(applied_b, vec![candidate(10), candidate(11), candidate(12)]);
    }
}

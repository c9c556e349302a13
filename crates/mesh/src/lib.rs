//! Client-side connection core for mesh video rooms.
//!
//! The pieces compose in one direction: [`signaling::SignalingTransport`]
//! owns the relay socket and its inner reconnection loop,
//! [`peer::PeerConnectionManager`] owns one engine and state record per
//! remote peer, and [`monitor::ConnectionHealthMonitor`] is the single
//! scheduler driving sweeps, heartbeats, and the recovery ladder on top of
//! both.

pub mod config;
pub mod engine;
pub mod error;
pub mod mock;
pub mod monitor;
pub mod peer;
pub mod polling;
pub mod signaling;

pub use config::{IceServer, MeshConfig};
pub use engine::{
    EngineEvent, EngineFactory, EngineOptions, EngineSignal, MediaHandle, PeerEngine,
    WebRtcEngineFactory,
};
pub use error::TransportError;
pub use monitor::{ConnectionHealthMonitor, MonitorHandle};
pub use peer::{
    PeerConnectionManager, PeerRecordSnapshot, PeerState, PeerStateChange, RecoveryStage,
    SignalSink,
};
pub use signaling::{SignalingTransport, TransportControl, TransportEvent, TransportStatus};

use std::sync::Arc;

/// Wire the whole client core together for one room: transport, manager,
/// monitor. Returns the handles the application holds onto plus the
/// application-facing event stream.
pub fn join_room(
    config: MeshConfig,
    room_id: impl Into<lantern_proto::RoomId>,
    user_id: impl Into<lantern_proto::UserId>,
    display_name: impl Into<String>,
) -> (
    Arc<SignalingTransport>,
    Arc<PeerConnectionManager>,
    MonitorHandle,
    tokio::sync::mpsc::UnboundedReceiver<TransportEvent>,
) {
    let user_id = user_id.into();
    let display_name = display_name.into();
    let (transport, events) =
        SignalingTransport::connect(config.clone(), room_id, user_id.clone(), display_name.clone());
    let factory = Arc::new(WebRtcEngineFactory::new(config.clone()));
    let manager = PeerConnectionManager::new(
        user_id,
        display_name,
        factory as Arc<dyn EngineFactory>,
        Arc::clone(&transport) as Arc<dyn SignalSink>,
    );
    let (monitor, app_events) = ConnectionHealthMonitor::start(
        config,
        Arc::clone(&manager),
        Arc::clone(&transport) as Arc<dyn SignalSink>,
        Arc::clone(&transport) as Arc<dyn TransportControl>,
        events,
    );
    (transport, manager, monitor, app_events)
}

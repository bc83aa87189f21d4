#![forbid(unsafe_code)]

// Room module - participant registry, membership lifecycle and event relay

pub mod registry;
mod relay;

pub use relay::Handshake;

use crate::metrics::ServerMetrics;
use crate::signaling::protocol::{Frame, ServerEvent};
use registry::{Participant, Registry};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outbound frame queue of a single connection
pub type Outbox = mpsc::Sender<Frame>;

/// Why an inbound event produced no outbound traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The sending connection has not joined (or has already left)
    UnregisteredSender,
    /// The addressed connection is not registered
    UnknownTarget,
    /// `join-room` on a connection that already joined
    AlreadyJoined,
}

/// Outcome of handling one inbound event.
///
/// Drops are never reported to the sender; they exist for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Event accepted; number of frames enqueued to recipients
    Delivered(usize),
    Dropped(DropReason),
}

/// Owns the registry and applies every membership and relay rule.
///
/// The registry sits behind a single mutex. Every operation takes the lock
/// once, never awaits while holding it, and enqueues its outbound frames with
/// `try_send` before releasing it, so each inbound event is applied as one
/// atomic step relative to joins, flag changes and disconnects on other
/// connections.
pub struct RoomManager {
    registry: Mutex<Registry>,
    metrics: ServerMetrics,
}

impl RoomManager {
    pub fn new(metrics: ServerMetrics) -> Self {
        Self {
            registry: Mutex::new(Registry::new()),
            metrics,
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a connection in `room_id`, announces it to the room and
    /// sends it the current mute/camera flags of everyone already there.
    pub fn join(
        &self,
        connection_id: &str,
        room_id: &str,
        display_name: Option<&str>,
        outbox: Outbox,
    ) -> Routed {
        let mut registry = self.registry();

        if !registry.register(connection_id, room_id, display_name, outbox) {
            debug!("Ignoring repeated join from {}", connection_id);
            return Routed::Dropped(DropReason::AlreadyJoined);
        }
        let Some(newcomer) = registry.get(connection_id) else {
            return Routed::Dropped(DropReason::UnregisteredSender);
        };
        info!("{} ({}) joined room {}", newcomer.display_name, connection_id, room_id);
        self.metrics.inc_joins();

        let mut sent = 0;

        // Announce the newcomer so existing members can start their handshakes
        if let Some(frame) = self.encode(&ServerEvent::UserConnected(
            connection_id.to_string(),
            newcomer.display_name.clone(),
        )) {
            for member in registry.members_of(room_id) {
                if member.connection_id != connection_id && self.deliver(member, &frame) {
                    sent += 1;
                }
            }
        }

        // State snapshot: current flags of every other member
        for member in registry.members_of(room_id) {
            if member.connection_id == connection_id {
                continue;
            }
            for event in [
                ServerEvent::MuteStatus(member.connection_id.clone(), member.is_muted),
                ServerEvent::CameraStatus(member.connection_id.clone(), member.is_camera_on),
            ] {
                if let Some(frame) = self.encode(&event) {
                    if self.deliver(newcomer, &frame) {
                        sent += 1;
                    }
                }
            }
        }

        Routed::Delivered(sent)
    }

    /// Removes a connection and tells the rest of its room it left.
    ///
    /// A connection that never joined has nothing to clean up.
    pub fn disconnect(&self, connection_id: &str) -> Routed {
        let mut registry = self.registry();

        let Some(departed) = registry.remove(connection_id) else {
            return Routed::Dropped(DropReason::UnregisteredSender);
        };
        info!("{} ({}) left room {}", departed.display_name, connection_id, departed.room_id);
        self.metrics.inc_leaves();

        let Some(frame) = self.encode(&ServerEvent::UserDisconnected(connection_id.to_string())) else {
            return Routed::Delivered(0);
        };
        let sent = registry
            .members_of(&departed.room_id)
            .filter(|member| self.deliver(member, &frame))
            .count();

        if registry.members_of(&departed.room_id).next().is_none() {
            debug!("Room {} is now empty", departed.room_id);
        }

        Routed::Delivered(sent)
    }

    /// Copy of a participant's current record
    pub fn participant(&self, connection_id: &str) -> Option<Participant> {
        self.registry().get(connection_id).cloned()
    }

    pub fn room_members(&self, room_id: &str) -> HashSet<String> {
        self.registry().room_members(room_id)
    }

    pub fn room_count(&self) -> usize {
        self.registry().room_count()
    }

    pub fn participant_count(&self) -> usize {
        self.registry().len()
    }

    /// Drops every participant. Their outboxes close, which ends the
    /// per-connection writer tasks.
    pub fn shutdown(&self) {
        let drained = self.registry().drain();
        info!("Released {} participants on shutdown", drained.len());
    }

    /// Serializes an event, logging instead of failing the caller
    fn encode(&self, event: &ServerEvent) -> Option<Frame> {
        match event.to_frame() {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!("Failed to serialize outbound event: {}", e);
                self.metrics.inc_errors();
                None
            }
        }
    }

    /// Enqueues a frame for one participant.
    ///
    /// A full or closed queue skips only this recipient.
    fn deliver(&self, participant: &Participant, frame: &Frame) -> bool {
        match participant.outbox.try_send(frame.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Channel full for {} in room {}, dropping frame",
                    participant.connection_id, participant.room_id
                );
                self.metrics.inc_delivery_failures();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(
                    "Channel closed for {} in room {} (disconnecting)",
                    participant.connection_id, participant.room_id
                );
                self.metrics.inc_delivery_failures();
                false
            }
        }
    }
}

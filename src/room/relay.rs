#![forbid(unsafe_code)]

// Event relay - target-addressed handshake forwarding and room broadcasts

use super::registry::Registry;
use super::{DropReason, RoomManager, Routed};
use crate::signaling::protocol::{Payload, ServerEvent};
use tracing::debug;

/// The handshake events that are forwarded to exactly one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Offer,
    Answer,
    IceCandidate,
}

impl RoomManager {
    /// Forwards an opaque handshake payload from `sender_id` to `target_id`
    /// and to nobody else.
    ///
    /// Offers carry the sender's display name because the target may not
    /// know the sender yet.
    pub fn relay_handshake(
        &self,
        kind: Handshake,
        sender_id: &str,
        target_id: &str,
        payload: Payload,
    ) -> Routed {
        let registry = self.registry();

        let Some(sender) = registry.get(sender_id) else {
            return Routed::Dropped(DropReason::UnregisteredSender);
        };
        let Some(target) = registry.get(target_id) else {
            debug!("Dropping {:?} from {} to unknown target {}", kind, sender_id, target_id);
            return Routed::Dropped(DropReason::UnknownTarget);
        };

        let event = match kind {
            Handshake::Offer => {
                ServerEvent::Offer(payload, sender_id.to_string(), sender.display_name.clone())
            }
            Handshake::Answer => ServerEvent::Answer(payload, sender_id.to_string()),
            Handshake::IceCandidate => ServerEvent::IceCandidate(payload, sender_id.to_string()),
        };

        let Some(frame) = self.encode(&event) else {
            return Routed::Delivered(0);
        };
        self.metrics.inc_relayed();
        debug!("Relayed {:?} {} -> {}", kind, sender_id, target_id);
        Routed::Delivered(usize::from(self.deliver(target, &frame)))
    }

    /// Sends a chat line to every member of the sender's room, sender included.
    pub fn broadcast_chat(&self, sender_id: &str, text: String) -> Routed {
        let registry = self.registry();

        let Some(sender) = registry.get(sender_id) else {
            return Routed::Dropped(DropReason::UnregisteredSender);
        };
        let event = ServerEvent::ChatMessage(text, sender.display_name.clone());
        self.broadcast(&registry, &sender.room_id, None, &event)
    }

    /// Records the sender's mute flag, then tells the rest of the room.
    pub fn set_mute_status(&self, sender_id: &str, is_muted: bool) -> Routed {
        let mut registry = self.registry();

        if !registry.set_muted(sender_id, is_muted) {
            return Routed::Dropped(DropReason::UnregisteredSender);
        }
        let Some(room_id) = registry.get(sender_id).map(|p| p.room_id.clone()) else {
            return Routed::Dropped(DropReason::UnregisteredSender);
        };
        let event = ServerEvent::MuteStatus(sender_id.to_string(), is_muted);
        self.broadcast(&registry, &room_id, Some(sender_id), &event)
    }

    /// Records the sender's camera flag, then tells the rest of the room.
    pub fn set_camera_status(&self, sender_id: &str, is_on: bool) -> Routed {
        let mut registry = self.registry();

        if !registry.set_camera_on(sender_id, is_on) {
            return Routed::Dropped(DropReason::UnregisteredSender);
        }
        let Some(room_id) = registry.get(sender_id).map(|p| p.room_id.clone()) else {
            return Routed::Dropped(DropReason::UnregisteredSender);
        };
        let event = ServerEvent::CameraStatus(sender_id.to_string(), is_on);
        self.broadcast(&registry, &room_id, Some(sender_id), &event)
    }

    /// Fans one event out to a room, optionally skipping one connection.
    /// Serializes once; each recipient is attempted independently.
    fn broadcast(
        &self,
        registry: &Registry,
        room_id: &str,
        except: Option<&str>,
        event: &ServerEvent,
    ) -> Routed {
        let Some(frame) = self.encode(event) else {
            return Routed::Delivered(0);
        };
        self.metrics.inc_broadcasts();

        let sent = registry
            .members_of(room_id)
            .filter(|member| Some(member.connection_id.as_str()) != except)
            .filter(|member| self.deliver(member, &frame))
            .count();
        Routed::Delivered(sent)
    }
}

#![forbid(unsafe_code)]

// Signaling protocol - named events with positional arguments
//
// Every frame is `{"event": "<name>", "args": <args>}`. Multi-argument events
// carry a JSON array in argument order, single-argument events carry the bare
// value. Handshake payloads are opaque JSON and are never inspected here.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Opaque handshake payload (session description or connectivity candidate)
pub type Payload = Value;

/// Pre-serialized frame, shared between every recipient of a broadcast
pub type Frame = Arc<String>;

/// Errors produced while decoding or encoding frames
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unsupported frame type: {0}")]
    UnsupportedFrame(&'static str),
}

/// Client-to-Server events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "args", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// `join-room(roomId, displayName?)`; a null or omitted name falls back
    /// to the default
    #[serde(deserialize_with = "join_room_args")]
    JoinRoom(String, Option<String>),
    /// `offer(payload, targetConnectionId)`
    Offer(Payload, String),
    /// `answer(payload, targetConnectionId)`
    Answer(Payload, String),
    /// `ice-candidate(payload, targetConnectionId)`
    IceCandidate(Payload, String),
    /// `chat-message(text)`
    ChatMessage(String),
    /// `mute-status(isMuted)`
    MuteStatus(bool),
    /// `camera-status(isOn)`
    CameraStatus(bool),
}

/// Server-to-Client events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "args", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// `user-connected(connectionId, displayName)`
    UserConnected(String, String),
    /// `offer(payload, senderConnectionId, senderDisplayName)`
    Offer(Payload, String, String),
    /// `answer(payload, senderConnectionId)`
    Answer(Payload, String),
    /// `ice-candidate(payload, senderConnectionId)`
    IceCandidate(Payload, String),
    /// `chat-message(text, senderDisplayName)`
    ChatMessage(String, String),
    /// `mute-status(connectionId, isMuted)`
    MuteStatus(String, bool),
    /// `camera-status(connectionId, isOn)`
    CameraStatus(String, bool),
    /// `user-disconnected(connectionId)`
    UserDisconnected(String),
}

/// Accepted argument shapes for `join-room`
#[derive(Deserialize)]
#[serde(untagged)]
enum JoinRoomArgs {
    Named(String, Option<String>),
    RoomOnly((String,)),
    Bare(String),
}

fn join_room_args<'de, D>(deserializer: D) -> Result<(String, Option<String>), D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match JoinRoomArgs::deserialize(deserializer)? {
        JoinRoomArgs::Named(room_id, display_name) => (room_id, display_name),
        JoinRoomArgs::RoomOnly((room_id,)) | JoinRoomArgs::Bare(room_id) => (room_id, None),
    })
}

impl ClientEvent {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wire name of the event, for logging
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinRoom(..) => "join-room",
            ClientEvent::Offer(..) => "offer",
            ClientEvent::Answer(..) => "answer",
            ClientEvent::IceCandidate(..) => "ice-candidate",
            ClientEvent::ChatMessage(..) => "chat-message",
            ClientEvent::MuteStatus(..) => "mute-status",
            ClientEvent::CameraStatus(..) => "camera-status",
        }
    }
}

impl ServerEvent {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serializes once so a broadcast can share the frame across recipients.
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        Ok(Arc::new(serde_json::to_string(self)?))
    }
}

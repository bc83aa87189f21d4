#![forbid(unsafe_code)]

// Client-side peer sessions - one handshake session per remote connection
//
// The media engine sits behind `PeerSession`; this module only decides which
// session an incoming signaling event belongs to and which event to send back.

use crate::signaling::protocol::{ClientEvent, Payload, ServerEvent};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Negotiation with {peer} failed: {reason}")]
    Negotiation { peer: String, reason: String },
}

/// One handshake/connectivity session with a single remote connection
pub trait PeerSession {
    fn produce_offer(&mut self) -> Result<Payload, PeerError>;
    fn produce_answer(&mut self, remote_offer: Payload) -> Result<Payload, PeerError>;
    fn apply_remote_answer(&mut self, answer: Payload) -> Result<(), PeerError>;
    fn apply_remote_candidate(&mut self, candidate: Payload) -> Result<(), PeerError>;
    /// Releases the session's media resources
    fn close(&mut self);
}

/// Creates sessions wired to the local media tracks
pub trait PeerSessionFactory {
    type Session: PeerSession;

    fn create(&mut self, remote_id: &str) -> Self::Session;
}

/// What the local client knows about a remote participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteParticipant {
    pub display_name: Option<String>,
    pub is_muted: bool,
    pub is_camera_on: bool,
}

impl Default for RemoteParticipant {
    fn default() -> Self {
        Self {
            display_name: None,
            is_muted: false,
            is_camera_on: true,
        }
    }
}

/// Ownership map from remote connection id to its session.
///
/// Flags may arrive (join snapshot) before the remote's offer, so the remote
/// view is tracked separately from the session itself.
pub struct PeerSessions<F: PeerSessionFactory> {
    factory: F,
    sessions: HashMap<String, F::Session>,
    remotes: HashMap<String, RemoteParticipant>,
}

impl<F: PeerSessionFactory> PeerSessions<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            sessions: HashMap::new(),
            remotes: HashMap::new(),
        }
    }

    /// Applies one server event; returns the event to send back, if any.
    pub fn handle(&mut self, event: ServerEvent) -> Result<Option<ClientEvent>, PeerError> {
        match event {
            ServerEvent::UserConnected(remote_id, name) => {
                self.remote_mut(&remote_id).display_name = Some(name);
                let mut session = self.open(&remote_id);
                match session.produce_offer() {
                    Ok(offer) => {
                        self.sessions.insert(remote_id.clone(), session);
                        Ok(Some(ClientEvent::Offer(offer, remote_id)))
                    }
                    Err(e) => {
                        session.close();
                        Err(e)
                    }
                }
            }
            ServerEvent::Offer(offer, remote_id, name) => {
                self.remote_mut(&remote_id).display_name = Some(name);
                let mut session = self.open(&remote_id);
                match session.produce_answer(offer) {
                    Ok(answer) => {
                        self.sessions.insert(remote_id.clone(), session);
                        Ok(Some(ClientEvent::Answer(answer, remote_id)))
                    }
                    Err(e) => {
                        session.close();
                        Err(e)
                    }
                }
            }
            ServerEvent::Answer(answer, remote_id) => {
                match self.sessions.get_mut(&remote_id) {
                    Some(session) => session.apply_remote_answer(answer)?,
                    None => debug!("Answer from {} without a session", remote_id),
                }
                Ok(None)
            }
            ServerEvent::IceCandidate(candidate, remote_id) => {
                match self.sessions.get_mut(&remote_id) {
                    Some(session) => session.apply_remote_candidate(candidate)?,
                    None => debug!("Candidate from {} without a session", remote_id),
                }
                Ok(None)
            }
            ServerEvent::MuteStatus(remote_id, is_muted) => {
                self.remote_mut(&remote_id).is_muted = is_muted;
                Ok(None)
            }
            ServerEvent::CameraStatus(remote_id, is_on) => {
                self.remote_mut(&remote_id).is_camera_on = is_on;
                Ok(None)
            }
            ServerEvent::UserDisconnected(remote_id) => {
                if let Some(mut session) = self.sessions.remove(&remote_id) {
                    session.close();
                }
                self.remotes.remove(&remote_id);
                Ok(None)
            }
            // Rendering concern
            ServerEvent::ChatMessage(..) => Ok(None),
        }
    }

    /// Wraps a locally gathered candidate for the remote it belongs to
    pub fn local_candidate(&self, remote_id: &str, candidate: Payload) -> ClientEvent {
        ClientEvent::IceCandidate(candidate, remote_id.to_string())
    }

    pub fn session(&self, remote_id: &str) -> Option<&F::Session> {
        self.sessions.get(remote_id)
    }

    pub fn remote(&self, remote_id: &str) -> Option<&RemoteParticipant> {
        self.remotes.get(remote_id)
    }

    /// Remote sessions plus the local participant
    pub fn participant_count(&self) -> usize {
        self.sessions.len() + 1
    }

    /// Closes every session, e.g. when leaving the room
    pub fn close_all(&mut self) {
        for (_, mut session) in self.sessions.drain() {
            session.close();
        }
        self.remotes.clear();
    }

    /// New session for `remote_id`, closing any previous one first
    fn open(&mut self, remote_id: &str) -> F::Session {
        if let Some(mut previous) = self.sessions.remove(remote_id) {
            previous.close();
        }
        self.factory.create(remote_id)
    }

    fn remote_mut(&mut self, remote_id: &str) -> &mut RemoteParticipant {
        self.remotes.entry(remote_id.to_string()).or_default()
    }
}

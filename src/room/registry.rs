#![forbid(unsafe_code)]

// Connection registry - one record per joined connection

use super::Outbox;
use std::collections::{HashMap, HashSet};

/// Display name used when a join carries no name
pub const DEFAULT_DISPLAY_NAME: &str = "Guest";

/// A joined connection and its latest room state.
///
/// All per-connection state lives in this single record so that removing a
/// participant drops its flags and its outbox in one step.
#[derive(Debug, Clone)]
pub struct Participant {
    pub connection_id: String,
    pub room_id: String,
    pub display_name: String,
    pub is_muted: bool,
    pub is_camera_on: bool,
    pub outbox: Outbox,
}

impl Participant {
    fn new(connection_id: &str, room_id: &str, display_name: Option<&str>, outbox: Outbox) -> Self {
        let display_name = display_name
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_DISPLAY_NAME);

        Self {
            connection_id: connection_id.to_string(),
            room_id: room_id.to_string(),
            display_name: display_name.to_string(),
            is_muted: false,
            is_camera_on: true,
            outbox,
        }
    }
}

/// Mapping from connection id to participant.
///
/// Rooms are not stored; membership is derived by filtering on `room_id`.
#[derive(Debug, Default)]
pub struct Registry {
    participants: HashMap<String, Participant>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a participant with default flags.
    ///
    /// Returns `false` and leaves the existing record untouched if the
    /// connection is already registered.
    pub fn register(
        &mut self,
        connection_id: &str,
        room_id: &str,
        display_name: Option<&str>,
        outbox: Outbox,
    ) -> bool {
        if self.participants.contains_key(connection_id) {
            return false;
        }
        self.participants.insert(
            connection_id.to_string(),
            Participant::new(connection_id, room_id, display_name, outbox),
        );
        true
    }

    pub fn get(&self, connection_id: &str) -> Option<&Participant> {
        self.participants.get(connection_id)
    }

    /// Returns `false` if the connection is not registered.
    pub fn set_muted(&mut self, connection_id: &str, value: bool) -> bool {
        match self.participants.get_mut(connection_id) {
            Some(p) => {
                p.is_muted = value;
                true
            }
            None => false,
        }
    }

    /// Returns `false` if the connection is not registered.
    pub fn set_camera_on(&mut self, connection_id: &str, value: bool) -> bool {
        match self.participants.get_mut(connection_id) {
            Some(p) => {
                p.is_camera_on = value;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, connection_id: &str) -> Option<Participant> {
        self.participants.remove(connection_id)
    }

    /// Connection ids of every participant in `room_id`
    pub fn room_members(&self, room_id: &str) -> HashSet<String> {
        self.members_of(room_id)
            .map(|p| p.connection_id.clone())
            .collect()
    }

    /// Iterates the participants of `room_id` in no particular order
    pub fn members_of<'a>(&'a self, room_id: &'a str) -> impl Iterator<Item = &'a Participant> + 'a {
        self.participants.values().filter(move |p| p.room_id == room_id)
    }

    /// Number of distinct non-empty rooms
    pub fn room_count(&self) -> usize {
        self.participants
            .values()
            .map(|p| p.room_id.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Removes every participant, returning them
    pub fn drain(&mut self) -> Vec<Participant> {
        self.participants.drain().map(|(_, p)| p).collect()
    }
}

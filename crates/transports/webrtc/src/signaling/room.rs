//! Room membership bookkeeping for the relay
//!
//! Rooms are created by the first join and removed when the last member
//! leaves. A peer is a member of at most one room at a time; joining another
//! room leaves the previous one first.

use crate::{Error, Result};
use std::collections::HashMap;

/// A relay room: an id and its members in join order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    id: String,
    members: Vec<String>,
}

impl Room {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            members: Vec::new(),
        }
    }

    /// Room id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Members in join order
    pub fn members(&self) -> &[String] {
        &self.members
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the room has no members
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Whether `peer_id` is a member
    pub fn contains(&self, peer_id: &str) -> bool {
        self.members.iter().any(|m| m == peer_id)
    }

    fn others(&self, peer_id: &str) -> Vec<String> {
        self.members
            .iter()
            .filter(|m| m.as_str() != peer_id)
            .cloned()
            .collect()
    }
}

/// Result of removing a peer from its room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// Room the peer left
    pub room_id: String,
    /// Members still in the room (to be told `peer-disconnected`)
    pub remaining: Vec<String>,
    /// Whether the room was deleted because it became empty
    pub room_removed: bool,
}

/// Result of a successful join
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// Joined room
    pub room_id: String,
    /// Other members before the join (to be told `peer-connected` and listed
    /// in `room-joined`)
    pub others: Vec<String>,
    /// Whether this join created the room
    pub created: bool,
    /// Whether the peer was already a member (idempotent re-join)
    pub already_member: bool,
    /// Previous room the peer left to join this one
    pub left: Option<LeaveOutcome>,
}

/// All rooms known to the relay
#[derive(Debug)]
pub struct RoomRegistry {
    rooms: HashMap<String, Room>,
    memberships: HashMap<String, String>,
    max_room_size: Option<usize>,
}

impl RoomRegistry {
    /// Create an empty registry; `max_room_size` of None means unbounded rooms
    pub fn new(max_room_size: Option<usize>) -> Self {
        Self {
            rooms: HashMap::new(),
            memberships: HashMap::new(),
            max_room_size,
        }
    }

    /// Add `peer_id` to `room_id`, creating the room if absent
    pub fn join(&mut self, room_id: &str, peer_id: &str) -> Result<JoinOutcome> {
        if room_id.trim().is_empty() {
            return Err(Error::SignalingError("room id must not be empty".to_string()));
        }

        if let Some(room) = self.rooms.get(room_id) {
            if room.contains(peer_id) {
                return Ok(JoinOutcome {
                    room_id: room_id.to_string(),
                    others: room.others(peer_id),
                    created: false,
                    already_member: true,
                    left: None,
                });
            }

            if let Some(capacity) = self.max_room_size {
                if room.len() >= capacity {
                    return Err(Error::RoomFull {
                        room_id: room_id.to_string(),
                        capacity,
                    });
                }
            }
        }

        let left = match self.memberships.get(peer_id) {
            Some(current) if current != room_id => self.leave(peer_id),
            _ => None,
        };

        let created = !self.rooms.contains_key(room_id);
        let room = self
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Room::new(room_id));
        let others = room.others(peer_id);
        room.members.push(peer_id.to_string());
        self.memberships
            .insert(peer_id.to_string(), room_id.to_string());

        Ok(JoinOutcome {
            room_id: room_id.to_string(),
            others,
            created,
            already_member: false,
            left,
        })
    }

    /// Remove `peer_id` from its room, deleting the room if it becomes empty
    pub fn leave(&mut self, peer_id: &str) -> Option<LeaveOutcome> {
        let room_id = self.memberships.remove(peer_id)?;
        let room = self.rooms.get_mut(&room_id)?;
        room.members.retain(|m| m != peer_id);

        let remaining = room.members.clone();
        let room_removed = remaining.is_empty();
        if room_removed {
            self.rooms.remove(&room_id);
        }

        Some(LeaveOutcome {
            room_id,
            remaining,
            room_removed,
        })
    }

    /// Other members of `peer_id`'s room; empty if the peer is in no room
    pub fn co_members(&self, peer_id: &str) -> Vec<String> {
        self.memberships
            .get(peer_id)
            .and_then(|room_id| self.rooms.get(room_id))
            .map(|room| room.others(peer_id))
            .unwrap_or_default()
    }

    /// Room the peer currently belongs to
    pub fn room_of(&self, peer_id: &str) -> Option<&str> {
        self.memberships.get(peer_id).map(String::as_str)
    }

    /// Look up a room
    pub fn room(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    /// Number of live rooms
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Configured capacity
    pub fn max_room_size(&self) -> Option<usize> {
        self.max_room_size
    }
}

//! Room membership and countdown timers.
//!
//! [`RoomRegistry`] is a plain single-writer store: every method is a
//! synchronous state transition that returns what the caller has to
//! broadcast. It does no I/O and is shared behind a mutex by the hub.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::RoomError;
use crate::messages::Role;

pub type ConnectionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomMode {
    Standard,
    Queue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub userid: String,
    pub name: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub room: String,
    pub members: Vec<Member>,
    pub timer: u64,
}

#[derive(Debug)]
struct Occupant {
    connection: ConnectionId,
    member: Member,
}

#[derive(Debug)]
struct Room {
    mode: RoomMode,
    capacity: usize,
    occupants: Vec<Occupant>,
    timer_secs: u64,
    /// Set once `roomClosed` has fired for the current zero-timer episode.
    closed: bool,
}

impl Room {
    fn snapshot(&self, key: &str) -> RoomSnapshot {
        RoomSnapshot {
            room: key.to_string(),
            members: self.occupants.iter().map(|o| o.member.clone()).collect(),
            timer: self.timer_secs,
        }
    }
}

/// What one scheduler tick produced for a single room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickEvent {
    TimerUpdate {
        room: String,
        timer: u64,
    },
    /// The timer crossed zero. `evicted` lists the connections that were
    /// members at that moment; they are no longer bound to the room.
    Closed {
        room: String,
        evicted: Vec<ConnectionId>,
    },
}

pub struct RoomRegistry {
    rooms: HashMap<String, Room>,
    /// Connection to the room it holds a membership in.
    bindings: HashMap<ConnectionId, String>,
    default_timer_secs: u64,
    standard_capacity: usize,
    queue_capacity: usize,
}

impl RoomRegistry {
    pub fn new(default_timer_secs: u64, standard_capacity: usize, queue_capacity: usize) -> Self {
        RoomRegistry {
            rooms: HashMap::new(),
            bindings: HashMap::new(),
            default_timer_secs,
            standard_capacity,
            queue_capacity,
        }
    }

    fn capacity_for(&self, mode: RoomMode) -> usize {
        match mode {
            RoomMode::Standard => self.standard_capacity,
            RoomMode::Queue => self.queue_capacity,
        }
    }

    /// Adds `member` to `room_key`, creating the room on first use.
    ///
    /// Capacity is fixed when the room is created. A later join through the
    /// other mode is admitted against the room's stored capacity.
    pub fn join(
        &mut self,
        connection: &str,
        room_key: &str,
        member: Member,
        mode: RoomMode,
    ) -> Result<RoomSnapshot, RoomError> {
        if let Some(binding) = self.bindings.get(connection) {
            return Err(RoomError::AlreadyJoined(binding.clone()));
        }

        let capacity = self.capacity_for(mode);
        let default_timer = self.default_timer_secs;
        let room = self.rooms.entry(room_key.to_string()).or_insert_with(|| {
            log::info!("Creating {mode:?} room {room_key} with capacity {capacity}");
            Room {
                mode,
                capacity,
                occupants: Vec::new(),
                timer_secs: default_timer,
                closed: false,
            }
        });

        if room.mode != mode {
            log::warn!(
                "{mode:?} join for {:?} room {room_key}; keeping capacity {}",
                room.mode,
                room.capacity
            );
        }

        if room.occupants.len() >= room.capacity {
            return Err(RoomError::RoomFull);
        }

        self.bindings.insert(connection.to_string(), room_key.to_string());
        room.occupants.push(Occupant {
            connection: connection.to_string(),
            member,
        });
        // A fresh member re-arms closure for a room sitting at zero.
        room.closed = false;

        Ok(room.snapshot(room_key))
    }

    /// Removes the entry held by `connection`. Other connections sharing
    /// the same user id keep theirs. Returns `None` when the connection was
    /// never bound.
    pub fn leave(&mut self, connection: &str) -> Option<RoomSnapshot> {
        let room_key = self.bindings.remove(connection)?;
        let room = self.rooms.get_mut(&room_key)?;
        let index = room.occupants.iter().position(|o| o.connection == connection)?;
        let removed = room.occupants.remove(index);
        log::info!("User {} removed from room {room_key}", removed.member.name);
        Some(room.snapshot(&room_key))
    }

    /// Adds `additional_secs` to the room timer. Callers must have verified
    /// payment before calling this.
    pub fn extend_timer(&mut self, room_key: &str, additional_secs: u64) -> Result<u64, RoomError> {
        let room = self
            .rooms
            .get_mut(room_key)
            .ok_or_else(|| RoomError::RoomNotFound(room_key.to_string()))?;
        room.timer_secs = room.timer_secs.saturating_add(additional_secs);
        if room.timer_secs > 0 {
            room.closed = false;
        }
        Ok(room.timer_secs)
    }

    /// Advances every room by one second.
    ///
    /// A running timer is decremented. A timer already at zero clears the
    /// room's membership and reports closure once; later ticks stay silent
    /// until the room is rejoined or extended.
    pub fn tick(&mut self) -> Vec<TickEvent> {
        let mut events = Vec::new();
        for (key, room) in &mut self.rooms {
            if room.timer_secs > 0 {
                room.timer_secs -= 1;
                events.push(TickEvent::TimerUpdate {
                    room: key.clone(),
                    timer: room.timer_secs,
                });
            } else if !room.closed {
                room.closed = true;
                let evicted: Vec<ConnectionId> =
                    room.occupants.drain(..).map(|o| o.connection).collect();
                for connection in &evicted {
                    self.bindings.remove(connection);
                }
                log::info!("Room {key} closed, {} member(s) evicted", evicted.len());
                events.push(TickEvent::Closed {
                    room: key.clone(),
                    evicted,
                });
            }
        }
        events
    }

    pub fn contains(&self, room_key: &str) -> bool {
        self.rooms.contains_key(room_key)
    }

    pub fn snapshot(&self, room_key: &str) -> Option<RoomSnapshot> {
        self.rooms.get(room_key).map(|room| room.snapshot(room_key))
    }

    /// Connections currently holding a membership in `room_key`.
    pub fn connections_in(&self, room_key: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(room_key)
            .map(|room| room.occupants.iter().map(|o| o.connection.clone()).collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    fn room_of(&self, connection: &str) -> Option<&str> {
        self.bindings.get(connection).map(String::as_str)
    }
}

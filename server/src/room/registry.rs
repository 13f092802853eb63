use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, info};

use weft_shared::Timer;

use crate::room::{Room, RoomConfig};
use crate::session::SessionId;
use crate::storage::Storage;

/// Builds the storage backend for a room on first connect.
pub type StorageFactory = Box<dyn Fn(&str) -> Box<dyn Storage>>;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long a room with zero sessions lingers before it is closed.
    pub idle_grace: Duration,
    pub room: RoomConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_grace: Duration::from_secs(30),
            room: RoomConfig::default(),
        }
    }
}

struct RoomEntry {
    room: Room,
    idle: Timer,
}

/// Owns the lifetime of every room: lazy creation on first connect, idle
/// auto-close after a grace period with no sessions, and shutdown.
///
/// Session teardown must be routed through [`Registry::handle_close`] and
/// [`Registry::handle_error`] so the registry can watch the remaining
/// session count; this is the session-removed hook of the room, expressed
/// as a return value instead of a callback so no cycle between room and
/// registry exists.
pub struct Registry {
    config: RegistryConfig,
    make_storage: StorageFactory,
    rooms: HashMap<String, RoomEntry>,
}

impl Registry {
    pub fn new(config: RegistryConfig, make_storage: StorageFactory) -> Self {
        Self {
            config,
            make_storage,
            rooms: HashMap::new(),
        }
    }

    /// Returns the room, creating and loading it on first use. Getting a
    /// room cancels any pending idle close.
    pub fn get_or_create(&mut self, room_id: &str) -> &mut Room {
        let Self {
            config,
            make_storage,
            rooms,
        } = self;
        let entry = rooms.entry(room_id.to_string()).or_insert_with(|| {
            info!("creating room `{room_id}`");
            let mut room = Room::new(make_storage(room_id), config.room.clone());
            room.load();
            RoomEntry {
                room,
                idle: Timer::idle(),
            }
        });
        entry.idle.cancel();
        &mut entry.room
    }

    pub fn get(&mut self, room_id: &str) -> Option<&mut Room> {
        self.rooms.get_mut(room_id).map(|entry| &mut entry.room)
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Removes the session from its room and schedules an idle close when
    /// the room just emptied out.
    pub fn handle_close(&mut self, now: Instant, room_id: &str, session_id: SessionId) {
        let Some(entry) = self.rooms.get_mut(room_id) else {
            return;
        };
        let remaining = entry.room.handle_close(session_id);
        if remaining == 0 {
            debug!("room `{room_id}` is empty, idle close scheduled");
            entry.idle.arm(now, self.config.idle_grace);
        }
    }

    pub fn handle_error(&mut self, now: Instant, room_id: &str, session_id: SessionId) {
        self.handle_close(now, room_id, session_id);
    }

    /// Fires due idle closes and forwards the tick to every room's own
    /// timers. A room that gained a session since its idle close was
    /// scheduled stays open.
    pub fn poll(&mut self, now: Instant) {
        let mut expired = Vec::new();
        for (room_id, entry) in &mut self.rooms {
            entry.room.poll(now);
            if entry.idle.fire(now) && entry.room.session_count() == 0 {
                expired.push(room_id.clone());
            }
        }
        for room_id in expired {
            info!("closing idle room `{room_id}`");
            if let Some(mut entry) = self.rooms.remove(&room_id) {
                entry.room.close();
            }
        }
    }

    /// Closes one room immediately, cancelling its idle timer.
    pub fn close(&mut self, room_id: &str) {
        if let Some(mut entry) = self.rooms.remove(room_id) {
            entry.idle.cancel();
            entry.room.close();
        }
    }

    /// Shutdown: closes every room, flushing their final saves.
    pub fn close_all(&mut self) {
        for (room_id, mut entry) in std::mem::take(&mut self.rooms) {
            debug!("closing room `{room_id}`");
            entry.idle.cancel();
            entry.room.close();
        }
    }
}

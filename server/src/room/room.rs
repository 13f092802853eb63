use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use log::{debug, warn};

use weft_shared::{
    patch, ClientMessage, ComponentValue, Fields, Patch, ServerMessage, Timer, EXISTS_FIELD,
    PROTOCOL_VERSION, VERSION_FIELD,
};

use crate::session::{Permission, SendError, Session, SessionId, SessionSocket};
use crate::storage::{FieldStamps, Snapshot, Storage};

/// Tuning knobs for one room.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Minimum spacing between two snapshot saves.
    pub save_throttle: Duration,
    pub protocol_version: u32,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            save_throttle: Duration::from_secs(10),
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

/// The authoritative, single-threaded controller for one document.
///
/// Serializes concurrent patches from its sessions into a monotonic
/// timestamp, tracks per-field write stamps for reconnect catch-up, keeps
/// per-client ephemeral state, and persists through a throttled save timer.
/// All calls for one room happen on one logical thread; time is passed in by
/// the caller.
pub struct Room {
    config: RoomConfig,
    storage: Box<dyn Storage>,
    timestamp: u64,
    state: Patch,
    timestamps: FieldStamps,
    ephemeral: BTreeMap<String, Patch>,
    sessions: BTreeMap<SessionId, Session>,
    next_session_id: u64,
    save_timer: Timer,
}

impl Room {
    pub fn new(storage: Box<dyn Storage>, config: RoomConfig) -> Self {
        Self {
            config,
            storage,
            timestamp: 0,
            state: Patch::new(),
            timestamps: FieldStamps::new(),
            ephemeral: BTreeMap::new(),
            sessions: BTreeMap::new(),
            next_session_id: 0,
            save_timer: Timer::idle(),
        }
    }

    /// Restores the room from storage. Called once, before the first
    /// session connects; a failed load leaves the room empty and in-memory.
    pub fn load(&mut self) {
        match self.storage.load() {
            Ok(Some(snapshot)) => {
                self.timestamp = snapshot.timestamp;
                self.state = snapshot.state;
                self.timestamps = snapshot.timestamps;
            }
            Ok(None) => {}
            Err(err) => warn!("room load failed, starting empty: {err}"),
        }
    }

    /// Registers a session, sends it the ephemeral snapshot of every other
    /// client, and tells everyone the new client count.
    pub fn handle_connect(
        &mut self,
        socket: Box<dyn SessionSocket>,
        client_id: impl Into<String>,
        permission: Permission,
    ) -> SessionId {
        let client_id = client_id.into();
        let session_id = SessionId(self.next_session_id);
        self.next_session_id += 1;
        self.sessions.insert(
            session_id,
            Session {
                client_id: client_id.clone(),
                permission,
                socket,
            },
        );

        let snapshot = self.ephemeral_snapshot(&client_id);
        if !snapshot.is_empty() {
            self.send_to(
                session_id,
                &ServerMessage::Patch {
                    document_patches: vec![],
                    ephemeral_patches: vec![snapshot],
                    client_id: String::new(),
                    timestamp: self.timestamp,
                },
            );
        }

        self.broadcast_client_count();
        session_id
    }

    /// Parses and dispatches one inbound frame. Malformed frames, unknown
    /// message types and empty patch requests are dropped without a reply.
    pub fn handle_message(&mut self, now: Instant, session_id: SessionId, raw: &str) {
        let message = match ClientMessage::decode(raw) {
            Ok(message) => message,
            Err(err) => {
                debug!("dropping frame from {session_id}: {err}");
                return;
            }
        };
        match message {
            ClientMessage::Patch {
                message_id,
                document_patches,
                ephemeral_patches,
            } => self.handle_patch(now, session_id, message_id, document_patches, ephemeral_patches),
            ClientMessage::Reconnect {
                last_timestamp,
                protocol_version,
                document_patches,
                ephemeral_patches,
            } => self.handle_reconnect(
                now,
                session_id,
                last_timestamp,
                protocol_version,
                document_patches,
                ephemeral_patches,
            ),
        }
    }

    /// Removes a session and cleans up after it: its ephemeral state is
    /// tombstoned for everyone else and the client count is re-announced.
    /// Returns the number of sessions left.
    pub fn handle_close(&mut self, session_id: SessionId) -> usize {
        let Some(session) = self.sessions.remove(&session_id) else {
            return self.sessions.len();
        };

        if let Some(published) = self.ephemeral.remove(&session.client_id) {
            if !published.is_empty() {
                let cleanup: Patch = published
                    .keys()
                    .map(|key| (key.to_string(), ComponentValue::Tombstone))
                    .collect();
                self.broadcast(&ServerMessage::Patch {
                    document_patches: vec![],
                    ephemeral_patches: vec![cleanup],
                    client_id: session.client_id.clone(),
                    timestamp: self.timestamp,
                });
            }
        }

        self.broadcast_client_count();
        self.sessions.len()
    }

    /// A transport error tears the session down the same way a close does.
    pub fn handle_error(&mut self, session_id: SessionId) -> usize {
        self.handle_close(session_id)
    }

    /// Fires any due timers. Drive this regularly, along with the clock the
    /// `handle_*` calls see.
    pub fn poll(&mut self, now: Instant) {
        if self.save_timer.fire(now) {
            self.save();
        }
    }

    /// Tombstone-filtered view of the document for persistence.
    pub fn snapshot(&self) -> Snapshot {
        let mut state = self.state.clone();
        state.retain(|_, value| !value.is_tombstone());
        Snapshot {
            timestamp: self.timestamp,
            state,
            timestamps: self.timestamps.clone(),
        }
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn set_permission(&mut self, session_id: SessionId, permission: Permission) {
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.permission = permission;
        }
    }

    pub fn permission(&self, session_id: SessionId) -> Option<Permission> {
        self.sessions.get(&session_id).map(|s| s.permission)
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn client_id(&self, session_id: SessionId) -> Option<&str> {
        self.sessions.get(&session_id).map(|s| s.client_id.as_str())
    }

    /// Flushes one final save, closes every socket and clears the session
    /// table. The room is inert afterwards.
    pub fn close(&mut self) {
        self.save_timer.cancel();
        self.save();
        for session in self.sessions.values_mut() {
            session.socket.close();
        }
        self.sessions.clear();
        self.ephemeral.clear();
    }

    // Message handling

    fn handle_patch(
        &mut self,
        now: Instant,
        session_id: SessionId,
        message_id: String,
        document_patches: Vec<Patch>,
        ephemeral_patches: Vec<Patch>,
    ) {
        if document_patches.is_empty() && ephemeral_patches.is_empty() {
            return;
        }
        if !self.sessions.contains_key(&session_id) {
            return;
        }

        self.apply_and_broadcast(now, session_id, document_patches, ephemeral_patches);

        // Readonly senders had their patches dropped above but are still
        // acked so they do not stall waiting for one.
        self.send_to(
            session_id,
            &ServerMessage::Ack {
                message_id,
                timestamp: self.timestamp,
            },
        );
    }

    fn handle_reconnect(
        &mut self,
        now: Instant,
        session_id: SessionId,
        last_timestamp: u64,
        protocol_version: u32,
        document_patches: Vec<Patch>,
        ephemeral_patches: Vec<Patch>,
    ) {
        let Some(session) = self.sessions.get(&session_id) else {
            return;
        };
        let client_id = session.client_id.clone();

        if protocol_version != self.config.protocol_version {
            let server_protocol_version = self.config.protocol_version;
            self.send_to(
                session_id,
                &ServerMessage::VersionMismatch {
                    server_protocol_version,
                },
            );
            // The client treats its session as doomed after the mismatch,
            // but the diff below is still computed and sent.
        }

        self.apply_and_broadcast(now, session_id, document_patches, ephemeral_patches);

        let diff = self.build_diff(last_timestamp);
        let ephemeral = self.ephemeral_snapshot(&client_id);
        if diff.is_some() || !ephemeral.is_empty() {
            self.send_to(
                session_id,
                &ServerMessage::Patch {
                    document_patches: diff.into_iter().collect(),
                    ephemeral_patches: if ephemeral.is_empty() {
                        vec![]
                    } else {
                        vec![ephemeral]
                    },
                    client_id: String::new(),
                    timestamp: self.timestamp,
                },
            );
        }
    }

    /// Shared tail of patch and reconnect requests: apply whatever the
    /// sender may write, relay it to everyone else, and arm the save timer
    /// if the document changed.
    fn apply_and_broadcast(
        &mut self,
        now: Instant,
        session_id: SessionId,
        document_patches: Vec<Patch>,
        ephemeral_patches: Vec<Patch>,
    ) {
        let Some(session) = self.sessions.get(&session_id) else {
            return;
        };
        if !session.permission.can_write() {
            return;
        }
        let client_id = session.client_id.clone();

        let applied_document = document_patches.iter().any(|p| !p.is_empty());
        if applied_document {
            self.timestamp += 1;
            for patch in &document_patches {
                self.apply_document_patch(patch);
            }
        }

        let applied_ephemeral = ephemeral_patches.iter().any(|p| !p.is_empty());
        if applied_ephemeral {
            let slot = self.ephemeral.entry(client_id.clone()).or_default();
            for incoming in &ephemeral_patches {
                patch::apply(slot, incoming);
            }
            // Tombstones are relayed but not retained; ephemeral state has
            // no catch-up story.
            slot.retain(|_, value| !value.is_tombstone());
        }

        if applied_document || applied_ephemeral {
            self.broadcast_except(
                session_id,
                &ServerMessage::Patch {
                    document_patches,
                    ephemeral_patches,
                    client_id,
                    timestamp: self.timestamp,
                },
            );
        }

        if applied_document {
            self.save_timer.arm_if_idle(now, self.config.save_throttle);
        }
    }

    fn apply_document_patch(&mut self, incoming: &Patch) {
        for (key, value) in incoming {
            match value {
                ComponentValue::Tombstone => {
                    self.state.insert(key, ComponentValue::Tombstone);
                    self.stamp(key, [EXISTS_FIELD.to_string()]);
                }
                ComponentValue::Full(fields) => {
                    self.state.insert(key, ComponentValue::Full(fields.clone()));
                    self.stamp(key, meta_and_field_names(fields, true));
                }
                ComponentValue::Partial(fields) => {
                    match self.state.get_mut(key) {
                        None => self
                            .state
                            .insert(key, ComponentValue::Partial(fields.clone())),
                        // A partial cannot resurrect a deleted component.
                        Some(ComponentValue::Tombstone) => continue,
                        Some(existing) => {
                            if let Some(existing) = existing.fields_mut() {
                                existing.merge_from(fields);
                            }
                        }
                    }
                    self.stamp(key, meta_and_field_names(fields, false));
                }
            }
        }
    }

    fn stamp(&mut self, key: &str, fields: impl IntoIterator<Item = String>) {
        let stamps = self.timestamps.entry(key.to_string()).or_default();
        for field in fields {
            stamps.insert(field, self.timestamp);
        }
    }

    /// The minimal catch-up patch for a client that last saw `since`: only
    /// fields written after it, with full values where the existence itself
    /// changed and bare tombstones for deletions.
    pub fn build_diff(&self, since: u64) -> Option<Patch> {
        let mut out = Patch::new();
        for (key, value) in &self.state {
            let Some(stamps) = self.timestamps.get(key) else {
                continue;
            };
            let newer = |field: &str| stamps.get(field).is_some_and(|stamp| *stamp > since);

            if value.is_tombstone() {
                if newer(EXISTS_FIELD) {
                    out.insert(key, ComponentValue::Tombstone);
                }
                continue;
            }
            if newer(EXISTS_FIELD) {
                // The component (re)appeared since then; send everything.
                out.insert(key, value.clone());
                continue;
            }
            let Some(fields) = value.fields() else {
                continue;
            };
            let mut subset = Fields::new();
            if newer(VERSION_FIELD) {
                subset.version.clone_from(&fields.version);
            }
            for (name, field_value) in fields.iter() {
                if newer(name) {
                    subset.set(name, field_value.clone());
                }
            }
            if !subset.is_empty() {
                out.insert(key, ComponentValue::Partial(subset));
            }
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    // Broadcasting

    fn ephemeral_snapshot(&self, exclude_client: &str) -> Patch {
        weft_shared::merge(
            self.ephemeral
                .iter()
                .filter(|(client_id, _)| client_id.as_str() != exclude_client)
                .map(|(_, patch)| patch),
        )
    }

    fn broadcast_client_count(&mut self) {
        self.broadcast(&ServerMessage::ClientCount {
            count: self.sessions.len(),
        });
    }

    fn broadcast(&mut self, message: &ServerMessage) {
        self.broadcast_frame(None, message);
    }

    fn broadcast_except(&mut self, excluded: SessionId, message: &ServerMessage) {
        self.broadcast_frame(Some(excluded), message);
    }

    /// One JSON encode per broadcast; the same frame goes to every
    /// recipient. Failed sends are ignored, the close handler for that
    /// session arrives separately.
    fn broadcast_frame(&mut self, excluded: Option<SessionId>, message: &ServerMessage) {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!("broadcast encode failed: {err}");
                return;
            }
        };
        for (session_id, session) in &mut self.sessions {
            if Some(*session_id) == excluded {
                continue;
            }
            if let Err(SendError) = session.socket.send(&frame) {
                debug!("send to {session_id} failed, awaiting its close");
            }
        }
    }

    fn send_to(&mut self, session_id: SessionId, message: &ServerMessage) {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!("encode for {session_id} failed: {err}");
                return;
            }
        };
        if let Some(session) = self.sessions.get_mut(&session_id) {
            if let Err(SendError) = session.socket.send(&frame) {
                debug!("send to {session_id} failed, awaiting its close");
            }
        }
    }

    fn save(&mut self) {
        let snapshot = self.snapshot();
        if let Err(err) = self.storage.save(&snapshot) {
            warn!("room save failed: {err}");
        }
    }
}

fn meta_and_field_names(fields: &Fields, exists: bool) -> Vec<String> {
    let mut names = Vec::with_capacity(fields.len() + 2);
    if exists {
        names.push(EXISTS_FIELD.to_string());
    }
    if fields.version.is_some() {
        names.push(VERSION_FIELD.to_string());
    }
    names.extend(fields.names().map(str::to_string));
    names
}

use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, warn};

use weft_shared::{
    key, merge, strip, ClientMessage, ComponentValue, Mutation, Origin, Patch, Schema,
    ServerMessage, SyncBehavior, Timer, PROTOCOL_VERSION,
};

use crate::adapter::{Adapter, AdapterError};
use crate::kv::{KvBackend, KvStore};

pub const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(500);
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(10);

const OFFLINE_BUFFER_KEY: &str = "offlineBuffer";
const LAST_TIMESTAMP_KEY: &str = "lastTimestamp";

/// Returned by [`Connection::send`] when the frame could not be written.
#[derive(Debug, Clone, Copy)]
pub struct SendError;

/// Returned by [`Connection::receive`] when the connection is gone.
#[derive(Debug, Clone, Copy)]
pub struct RecvError;

#[derive(Debug, Clone, thiserror::Error)]
#[error("could not reach the room: {0}")]
pub struct ConnectError(pub String);

/// An established duplex connection to the room. Frames are polled out
/// rather than delivered by callback so everything stays on the adapter's
/// thread.
pub trait Connection {
    fn send(&mut self, frame: &str) -> Result<(), SendError>;

    /// One inbound frame if any is waiting. An error means the connection
    /// was lost or closed by the peer.
    fn receive(&mut self) -> Result<Option<String>, RecvError>;

    fn close(&mut self);
}

/// Establishes connections; owned by the transport adapter so it can redial
/// during reconnect backoff.
pub trait Connector {
    fn connect(&mut self) -> Result<Box<dyn Connection>, ConnectError>;
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub client_id: String,
    pub protocol_version: u32,
    /// Flush cadence with no other client connected.
    pub solo_send_interval: Duration,
    /// Flush cadence while peers are connected.
    pub busy_send_interval: Duration,
    pub min_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// Stay disconnected after init until `reconnect` is called.
    pub start_offline: bool,
}

impl TransportConfig {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            protocol_version: PROTOCOL_VERSION,
            solo_send_interval: Duration::from_secs(1),
            busy_send_interval: Duration::from_secs(1) / 30,
            min_reconnect_delay: MIN_RECONNECT_DELAY,
            max_reconnect_delay: MAX_RECONNECT_DELAY,
            start_offline: false,
        }
    }
}

/// The duplex end of the ring: buffers outgoing patches (offline ones
/// persistently), throttles flushes, replays on reconnect with exponential
/// backoff, and masks incoming broadcasts against in-flight sends so local
/// state never regresses.
pub struct TransportAdapter {
    config: TransportConfig,
    document_id: String,
    connector: Box<dyn Connector>,
    schema: Rc<dyn Schema>,
    backend: Option<Rc<dyn KvBackend>>,
    meta: Option<Box<dyn KvStore>>,
    conn: Option<Box<dyn Connection>>,

    last_timestamp: u64,
    offline_buffer: Patch,
    in_flight: BTreeMap<String, Patch>,
    local_ephemeral: Patch,
    remote_ephemeral: Patch,
    connected_users: usize,

    pending_documents: Vec<Patch>,
    pending_ephemeral: Vec<Patch>,
    document_send_buffer: Vec<Patch>,
    ephemeral_send_buffer: Vec<Patch>,
    last_send: Option<Instant>,
    next_message: u64,

    reconnect_timer: Timer,
    reconnect_delay: Duration,
    intentionally_closed: bool,
    doomed: bool,
    on_version_mismatch: Option<Box<dyn FnMut(u32)>>,
}

impl TransportAdapter {
    pub fn new(
        document_id: impl Into<String>,
        connector: Box<dyn Connector>,
        schema: Rc<dyn Schema>,
        backend: Option<Rc<dyn KvBackend>>,
        config: TransportConfig,
    ) -> Self {
        let reconnect_delay = config.min_reconnect_delay;
        Self {
            config,
            document_id: document_id.into(),
            connector,
            schema,
            backend,
            meta: None,
            conn: None,
            last_timestamp: 0,
            offline_buffer: Patch::new(),
            in_flight: BTreeMap::new(),
            local_ephemeral: Patch::new(),
            remote_ephemeral: Patch::new(),
            connected_users: 1,
            pending_documents: Vec::new(),
            pending_ephemeral: Vec::new(),
            document_send_buffer: Vec::new(),
            ephemeral_send_buffer: Vec::new(),
            last_send: None,
            next_message: 1,
            reconnect_timer: Timer::idle(),
            reconnect_delay,
            intentionally_closed: false,
            doomed: false,
            on_version_mismatch: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn connected_users(&self) -> usize {
        self.connected_users
    }

    pub fn last_timestamp(&self) -> u64 {
        self.last_timestamp
    }

    /// Invoked when the room reports a different protocol version; the
    /// session is unusable from then on.
    pub fn set_on_version_mismatch(&mut self, callback: impl FnMut(u32) + 'static) {
        self.on_version_mismatch = Some(Box::new(callback));
    }

    /// Intentional disconnect: no auto-reconnect until `reconnect`.
    pub fn disconnect(&mut self, now: Instant) {
        self.intentionally_closed = true;
        self.reconnect_timer.cancel();
        if let Some(mut conn) = self.conn.take() {
            conn.close();
        }
        self.connection_lost(now);
    }

    /// Clears the intentional-close flag and dials eagerly with a fresh
    /// backoff.
    pub fn reconnect(&mut self, now: Instant) {
        self.intentionally_closed = false;
        self.doomed = false;
        self.reconnect_delay = self.config.min_reconnect_delay;
        self.reconnect_timer.cancel();
        if self.conn.is_none() {
            self.try_connect(now);
        }
    }

    fn try_connect(&mut self, now: Instant) {
        match self.connector.connect() {
            Ok(conn) => {
                self.conn = Some(conn);
                self.reconnect_timer.cancel();
                self.reconnect_delay = self.config.min_reconnect_delay;
                self.in_flight.clear();
                self.send_reconnect_request(now);
            }
            Err(err) => {
                debug!("connect failed ({err}), retrying in {:?}", self.reconnect_delay);
                self.schedule_reconnect(now);
            }
        }
    }

    fn schedule_reconnect(&mut self, now: Instant) {
        self.reconnect_timer.arm(now, self.reconnect_delay);
        self.reconnect_delay = (self.reconnect_delay * 2).min(self.config.max_reconnect_delay);
    }

    /// The one frame every (re)connection opens with: our high-water
    /// timestamp plus whatever accumulated while we were away.
    fn send_reconnect_request(&mut self, now: Instant) {
        let message = ClientMessage::Reconnect {
            last_timestamp: self.last_timestamp,
            protocol_version: self.config.protocol_version,
            document_patches: if self.offline_buffer.is_empty() {
                vec![]
            } else {
                vec![self.offline_buffer.clone()]
            },
            ephemeral_patches: if self.local_ephemeral.is_empty() {
                vec![]
            } else {
                vec![self.local_ephemeral.clone()]
            },
        };
        self.send_frame(&message, now);
    }

    fn send_frame(&mut self, message: &ClientMessage, now: Instant) {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!("outgoing frame did not encode: {err}");
                return;
            }
        };
        let sent = match &mut self.conn {
            Some(conn) => conn.send(&frame).is_ok(),
            None => false,
        };
        if !sent {
            debug!("send failed, treating connection as lost");
            self.conn = None;
            self.connection_lost(now);
        }
    }

    /// Common teardown for every way a connection ends: ephemeral state of
    /// our peers is tombstoned locally, and an unintentional loss arms the
    /// backoff timer.
    fn connection_lost(&mut self, now: Instant) {
        self.conn = None;
        if !self.remote_ephemeral.is_empty() {
            let cleanup: Patch = self
                .remote_ephemeral
                .keys()
                .map(|patch_key| (patch_key.to_string(), ComponentValue::Tombstone))
                .collect();
            self.pending_ephemeral.push(cleanup);
            self.remote_ephemeral = Patch::new();
        }
        if !self.intentionally_closed {
            self.schedule_reconnect(now);
        }
    }

    fn drain_socket(&mut self, now: Instant) {
        let mut frames = Vec::new();
        let mut lost = false;
        if let Some(conn) = &mut self.conn {
            loop {
                match conn.receive() {
                    Ok(Some(frame)) => frames.push(frame),
                    Ok(None) => break,
                    Err(RecvError) => {
                        lost = true;
                        break;
                    }
                }
            }
        }
        for frame in frames {
            self.handle_frame(&frame, now);
        }
        if lost {
            self.connection_lost(now);
        }
    }

    fn handle_frame(&mut self, frame: &str, now: Instant) {
        // A doomed session ignores everything after the version mismatch.
        if self.doomed {
            return;
        }
        let message = match ServerMessage::decode(frame) {
            Ok(message) => message,
            Err(err) => {
                warn!("dropping undecodable server frame: {err}");
                return;
            }
        };
        match message {
            ServerMessage::Ack {
                message_id,
                timestamp,
            } => {
                self.set_last_timestamp(timestamp);
                self.in_flight.remove(&message_id);
            }
            ServerMessage::Patch {
                document_patches,
                ephemeral_patches,
                timestamp,
                ..
            } => {
                self.set_last_timestamp(timestamp);
                if !document_patches.is_empty() {
                    // Broadcasts that raced our own unacked sends must not
                    // clobber them; the server reapplies ours on top.
                    let mask = merge(self.in_flight.values());
                    for patch in &document_patches {
                        let remainder = strip(patch, &mask);
                        if !remainder.is_empty() {
                            self.pending_documents.push(remainder);
                        }
                    }
                }
                if !ephemeral_patches.is_empty() {
                    for patch in &ephemeral_patches {
                        weft_shared::patch::apply(&mut self.remote_ephemeral, patch);
                    }
                    self.remote_ephemeral.retain(|_, value| !value.is_tombstone());
                    self.pending_ephemeral.extend(ephemeral_patches);
                }
            }
            ServerMessage::ClientCount { count } => {
                self.connected_users = count;
            }
            ServerMessage::VersionMismatch {
                server_protocol_version,
            } => {
                warn!(
                    "room speaks protocol {server_protocol_version}, we speak {}; session is unusable",
                    self.config.protocol_version
                );
                self.doomed = true;
                self.intentionally_closed = true;
                self.reconnect_timer.cancel();
                if let Some(mut conn) = self.conn.take() {
                    conn.close();
                }
                self.connection_lost(now);
                if let Some(callback) = &mut self.on_version_mismatch {
                    callback(server_protocol_version);
                }
            }
        }
    }

    fn flush_if_ready(&mut self, now: Instant) {
        if self.conn.is_none() {
            return;
        }
        if self.document_send_buffer.is_empty() && self.ephemeral_send_buffer.is_empty() {
            return;
        }
        let interval = if self.connected_users > 1 {
            self.config.busy_send_interval
        } else {
            self.config.solo_send_interval
        };
        let ready = self
            .last_send
            .is_none_or(|last| now.duration_since(last) >= interval);
        if ready {
            self.flush(now);
        }
    }

    fn flush(&mut self, now: Instant) {
        // Anything still parked offline rides along in front of the new
        // edits.
        let mut document_patches = Vec::new();
        if !self.offline_buffer.is_empty() {
            document_patches.push(std::mem::take(&mut self.offline_buffer));
            self.persist_offline_buffer();
        }
        document_patches.append(&mut self.document_send_buffer);
        let document = merge(document_patches.iter());

        let ephemeral = merge(self.ephemeral_send_buffer.drain(..).collect::<Vec<_>>().iter());
        if !ephemeral.is_empty() {
            self.local_ephemeral = merge([&self.local_ephemeral, &ephemeral]);
        }

        if document.is_empty() && ephemeral.is_empty() {
            return;
        }

        let message_id = format!("{}-{}", self.config.client_id, self.next_message);
        self.next_message += 1;
        if !document.is_empty() {
            self.in_flight.insert(message_id.clone(), document.clone());
        }

        let message = ClientMessage::Patch {
            message_id,
            document_patches: if document.is_empty() {
                vec![]
            } else {
                vec![document]
            },
            ephemeral_patches: if ephemeral.is_empty() {
                vec![]
            } else {
                vec![ephemeral]
            },
        };
        self.send_frame(&message, now);
        self.last_send = Some(now);
    }

    fn set_last_timestamp(&mut self, timestamp: u64) {
        self.last_timestamp = timestamp;
        if let Some(meta) = &mut self.meta {
            if let Err(err) = meta.put(LAST_TIMESTAMP_KEY, serde_json::Value::from(timestamp)) {
                warn!("persisting lastTimestamp failed: {err}");
            }
        }
    }

    fn persist_offline_buffer(&mut self) {
        let Some(meta) = &mut self.meta else {
            return;
        };
        match serde_json::to_value(&self.offline_buffer) {
            Ok(raw) => {
                if let Err(err) = meta.put(OFFLINE_BUFFER_KEY, raw) {
                    warn!("persisting offline buffer failed: {err}");
                }
            }
            Err(err) => warn!("offline buffer did not serialize: {err}"),
        }
    }

    /// Brings a patch's values up to their components' current schema
    /// versions.
    fn migrate_patch(&self, input: Patch) -> Patch {
        let mut out = Patch::new();
        for (patch_key, value) in input {
            let def = key::component_name(&patch_key).and_then(|name| self.schema.def(name));
            let migrated = match (def, value.fields()) {
                (Some(def), Some(fields)) if fields.version != def.version => {
                    let component = def.name.clone();
                    let from = fields.version.clone();
                    let fresh = self
                        .schema
                        .migrate(&component, fields.clone(), from.as_deref());
                    match value {
                        ComponentValue::Partial(_) => ComponentValue::Partial(fresh),
                        _ => ComponentValue::Full(fresh),
                    }
                }
                _ => value,
            };
            out.insert(patch_key, migrated);
        }
        out
    }
}

impl Adapter for TransportAdapter {
    fn init(&mut self, now: Instant) -> Result<(), AdapterError> {
        if let Some(backend) = &self.backend {
            let mut meta = backend.open(&format!("{}.meta", self.document_id))?;
            if let Some(raw) = meta.get(OFFLINE_BUFFER_KEY)? {
                match serde_json::from_value(raw) {
                    Ok(buffer) => self.offline_buffer = buffer,
                    Err(err) => warn!("dropping undecodable offline buffer: {err}"),
                }
            }
            if let Some(raw) = meta.get(LAST_TIMESTAMP_KEY)? {
                match raw.as_u64() {
                    Some(timestamp) => self.last_timestamp = timestamp,
                    None => warn!("dropping malformed lastTimestamp {raw}"),
                }
            }
            self.meta = Some(meta);
        }

        if self.config.start_offline {
            self.intentionally_closed = true;
        } else {
            self.try_connect(now);
        }
        Ok(())
    }

    fn pull(&mut self, now: Instant) -> Vec<Mutation> {
        if let Some(meta) = &mut self.meta {
            if let Err(err) = meta.poll(now) {
                warn!("meta store flush failed: {err}");
            }
        }
        if self.conn.is_none()
            && !self.intentionally_closed
            && self.reconnect_timer.fire(now)
        {
            self.try_connect(now);
        }
        self.drain_socket(now);

        let mut out = Vec::new();
        if !self.pending_documents.is_empty() {
            let incoming = merge(self.pending_documents.drain(..).collect::<Vec<_>>().iter());
            let incoming = self.migrate_patch(incoming);
            // Fields sitting in the local offline queue are our own unsent
            // work; the server echo must not undo them.
            let taken_offline_buffer = std::mem::take(&mut self.offline_buffer);
            let offline = self.migrate_patch(taken_offline_buffer);
            let document = strip(&incoming, &offline);
            self.persist_offline_buffer();
            if !document.is_empty() {
                out.push(Mutation::new(Origin::Transport, SyncBehavior::Document, document));
            }
        }
        if !self.pending_ephemeral.is_empty() {
            let ephemeral = merge(self.pending_ephemeral.drain(..).collect::<Vec<_>>().iter());
            if !ephemeral.is_empty() {
                out.push(Mutation::new(
                    Origin::Transport,
                    SyncBehavior::Ephemeral,
                    ephemeral,
                ));
            }
        }
        out
    }

    fn push(&mut self, mutations: &[Mutation], now: Instant) {
        for mutation in mutations {
            // Our own deliveries and purely local state stay off the wire;
            // persistence echoes are the store's business, not the room's.
            if mutation.origin == Origin::Transport || mutation.origin == Origin::Persistence {
                continue;
            }
            match mutation.behavior {
                SyncBehavior::Document => {
                    if self.conn.is_some() {
                        self.document_send_buffer.push(mutation.patch.clone());
                    } else {
                        self.offline_buffer = merge([&self.offline_buffer, &mutation.patch]);
                        self.persist_offline_buffer();
                    }
                }
                SyncBehavior::Ephemeral => {
                    if self.conn.is_some() {
                        self.ephemeral_send_buffer.push(mutation.patch.clone());
                    } else {
                        self.local_ephemeral = merge([&self.local_ephemeral, &mutation.patch]);
                    }
                }
                SyncBehavior::Local | SyncBehavior::None => {}
            }
        }
        self.flush_if_ready(now);
    }

    fn close(&mut self) {
        self.intentionally_closed = true;
        self.reconnect_timer.cancel();
        if let Some(mut conn) = self.conn.take() {
            conn.close();
        }
        if let Some(meta) = &mut self.meta {
            if let Err(err) = meta.flush() {
                warn!("final meta flush failed: {err}");
            }
        }
    }
}

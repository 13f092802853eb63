//! Test world, schema and the room/client harness shared by the end-to-end
//! tests.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::debug;
use weft_client::{
    Client, ClientConfig, ConnectError, Connection, Connector, KvBackend, WorldBridge,
};
use weft_server::{MemoryStorage, Permission, Room, RoomConfig, SessionId, SharedSnapshot};
use weft_shared::{
    patch, ComponentDef, ComponentValue, FieldValue, Fields, Patch, Schema, SchemaSet,
    SyncBehavior,
};

use crate::local_socket::{wire, WireMonitor};

/// The schema every end-to-end test runs against:
/// `Pos` and `Shape` are document state (with `Shape.hover` out of
/// history), `Cursor` is ephemeral, `Prefs` is local-only.
pub fn schema() -> Rc<dyn Schema> {
    let mut set = SchemaSet::new();
    set.register(ComponentDef::new("Pos", SyncBehavior::Document));
    set.register(
        ComponentDef::new("Shape", SyncBehavior::Document).exclude_from_history("hover"),
    );
    set.register(ComponentDef::new("Cursor", SyncBehavior::Ephemeral));
    set.register(ComponentDef::new("Prefs", SyncBehavior::Local));
    Rc::new(set)
}

pub fn fields(entries: &[(&str, i64)]) -> Fields {
    let mut fields = Fields::new();
    for (name, value) in entries {
        fields.set(*name, *value);
    }
    fields
}

pub fn full(entries: &[(&str, i64)]) -> ComponentValue {
    ComponentValue::Full(fields(entries))
}

pub fn partial(entries: &[(&str, i64)]) -> ComponentValue {
    ComponentValue::Partial(fields(entries))
}

/// A toy entity/component world with dirty tracking.
#[derive(Default)]
pub struct TestWorld {
    state: Patch,
    dirty: Patch,
}

impl TestWorld {
    pub fn edit(&mut self, key: &str, value: ComponentValue) {
        patch::apply(&mut self.state, &Patch::single(key, value.clone()));
        self.dirty.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&ComponentValue> {
        self.state.get(key).filter(|value| !value.is_tombstone())
    }

    pub fn int_field(&self, key: &str, name: &str) -> Option<i64> {
        match self.get(key)?.fields()?.get(name) {
            Some(FieldValue::Int(value)) => Some(*value),
            _ => None,
        }
    }
}

impl WorldBridge for TestWorld {
    fn take_changes(&mut self) -> Patch {
        std::mem::take(&mut self.dirty)
    }

    fn apply(&mut self, incoming: &Patch) {
        patch::apply(&mut self.state, incoming);
    }
}

struct SessionEntry {
    id: SessionId,
    monitor: WireMonitor,
    open: bool,
}

type Sessions = Rc<RefCell<Vec<SessionEntry>>>;

/// Dials the harness room directly: each connect registers a fresh wire as
/// a new session.
struct RoomConnector {
    room: Rc<RefCell<Room>>,
    sessions: Sessions,
    client_id: String,
    permission: Permission,
}

impl Connector for RoomConnector {
    fn connect(&mut self) -> Result<Box<dyn Connection>, ConnectError> {
        let (client_end, server_end, monitor) = wire();
        let id = self.room.borrow_mut().handle_connect(
            Box::new(server_end),
            &self.client_id,
            self.permission,
        );
        debug!("wired `{}` into the room as {id}", self.client_id);
        self.sessions.borrow_mut().push(SessionEntry {
            id,
            monitor,
            open: true,
        });
        Ok(Box::new(client_end))
    }
}

/// One room plus the plumbing to run any number of clients against it with
/// a manual clock.
///
/// The usual step is: tick the clients (they flush), [`Harness::pump`] (the
/// room processes and broadcasts), tick the clients again (they receive).
pub struct Harness {
    pub room: Rc<RefCell<Room>>,
    pub stored: SharedSnapshot,
    sessions: Sessions,
    pub now: Instant,
    pub schema: Rc<dyn Schema>,
}

impl Harness {
    pub fn new() -> Self {
        let storage = MemoryStorage::new();
        let stored = storage.handle();
        let room = Room::new(Box::new(storage), RoomConfig::default());
        Self {
            room: Rc::new(RefCell::new(room)),
            stored,
            sessions: Rc::new(RefCell::new(Vec::new())),
            now: Instant::now(),
            schema: schema(),
        }
    }

    pub fn client(&self, client_id: &str) -> Client<TestWorld> {
        self.client_with(client_id, Permission::ReadWrite, None, |_| {})
    }

    pub fn client_with(
        &self,
        client_id: &str,
        permission: Permission,
        backend: Option<Rc<dyn KvBackend>>,
        tweak: impl FnOnce(&mut ClientConfig),
    ) -> Client<TestWorld> {
        let mut config = ClientConfig::new("doc", client_id);
        tweak(&mut config);
        let connector = RoomConnector {
            room: Rc::clone(&self.room),
            sessions: Rc::clone(&self.sessions),
            client_id: client_id.to_string(),
            permission,
        };
        Client::new(
            config,
            TestWorld::default(),
            Rc::clone(&self.schema),
            Box::new(connector),
            backend,
        )
    }

    /// Delivers every queued client frame to the room and reports client
    /// hang-ups, in session order.
    pub fn pump(&mut self) {
        let mut sessions = self.sessions.borrow_mut();
        for entry in sessions.iter_mut() {
            if entry.open && entry.monitor.client_hung_up() {
                debug!("{} hung up", entry.id);
                entry.open = false;
                self.room.borrow_mut().handle_close(entry.id);
            }
            while let Some(frame) = entry.monitor.next_inbound_frame() {
                debug!("{} -> room: {frame}", entry.id);
                self.room.borrow_mut().handle_message(self.now, entry.id, &frame);
            }
        }
    }

    pub fn advance(&mut self, duration: Duration) {
        self.now += duration;
    }

    /// One full exchange: flush, room, receive.
    pub fn exchange(&mut self, clients: &mut [&mut Client<TestWorld>]) {
        for client in clients.iter_mut() {
            client.tick(self.now);
        }
        self.pump();
        for client in clients.iter_mut() {
            client.tick(self.now);
        }
    }

    /// The monitor of the most recently opened session.
    pub fn last_wire(&self) -> WireMonitor {
        self.sessions
            .borrow()
            .last()
            .map(|entry| entry.monitor.clone())
            .expect("no session was opened")
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

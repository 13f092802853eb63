//! Shared test doubles for adapter tests.
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use weft_client::{ConnectError, Connection, Connector, RecvError, SendError, WorldBridge};
use weft_shared::{
    patch, ClientMessage, ComponentDef, ComponentValue, FieldValue, Fields, Mutation, Origin,
    Patch, Schema, SchemaSet, ServerMessage, SyncBehavior,
};

/// Schema used across the client tests:
/// - `Pos` syncs as document state
/// - `Cursor` is ephemeral
/// - `Prefs` stays local
/// - `Shape` keeps its `hover` field out of undo history
/// - `Doc` is versioned ("2"), with a migration renaming `body` to `text`
pub fn schema() -> Rc<dyn Schema> {
    let mut set = SchemaSet::new();
    set.register(ComponentDef::new("Pos", SyncBehavior::Document));
    set.register(ComponentDef::new("Cursor", SyncBehavior::Ephemeral));
    set.register(ComponentDef::new("Prefs", SyncBehavior::Local));
    set.register(
        ComponentDef::new("Shape", SyncBehavior::Document).exclude_from_history("hover"),
    );
    set.register_with_migration(
        ComponentDef::new("Doc", SyncBehavior::Document).versioned("2"),
        |mut fields, _from| {
            if let Some(body) = fields.remove("body") {
                fields.set("text", body);
            }
            fields
        },
    );
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

pub fn mutation(origin: Origin, behavior: SyncBehavior, key: &str, value: ComponentValue) -> Mutation {
    Mutation::new(origin, behavior, Patch::single(key, value))
}

/// A toy entity/component world with dirty tracking, standing in for the
/// external storage engine.
#[derive(Default)]
pub struct TestWorld {
    state: Patch,
    dirty: Patch,
}

impl TestWorld {
    pub fn new() -> Self {
        Self::default()
    }

    /// A local write: lands in the world and is picked up by the next pull.
    pub fn edit(&mut self, key: &str, value: ComponentValue) {
        patch::apply(&mut self.state, &Patch::single(key, value.clone()));
        self.dirty.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&ComponentValue> {
        self.state.get(key).filter(|value| !value.is_tombstone())
    }

    pub fn field(&self, key: &str, name: &str) -> Option<&FieldValue> {
        self.get(key)?.fields()?.get(name)
    }

    pub fn int_field(&self, key: &str, name: &str) -> Option<i64> {
        match self.field(key, name) {
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

// In-memory duplex connection.

#[derive(Default)]
struct WireState {
    to_server: VecDeque<String>,
    to_client: VecDeque<String>,
}

/// Observer/controller half of a [`FakeConnector`]'s connections.
#[derive(Clone, Default)]
pub struct WireHandle {
    state: Rc<RefCell<WireState>>,
    open: Rc<Cell<bool>>,
}

impl WireHandle {
    /// Frames the client sent, decoded.
    pub fn sent(&self) -> Vec<ClientMessage> {
        self.state
            .borrow_mut()
            .to_server
            .drain(..)
            .map(|frame| ClientMessage::decode(&frame).expect("client sent an undecodable frame"))
            .collect()
    }

    /// Queues a frame for the client to receive on its next pull.
    pub fn deliver(&self, message: &ServerMessage) {
        self.state
            .borrow_mut()
            .to_client
            .push_back(message.encode().expect("server message should encode"));
    }

    /// Drops the connection from the server side.
    pub fn kill(&self) {
        self.open.set(false);
    }

    pub fn is_open(&self) -> bool {
        self.open.get()
    }
}

struct FakeConn {
    state: Rc<RefCell<WireState>>,
    open: Rc<Cell<bool>>,
}

impl Connection for FakeConn {
    fn send(&mut self, frame: &str) -> Result<(), SendError> {
        if !self.open.get() {
            return Err(SendError);
        }
        self.state.borrow_mut().to_server.push_back(frame.to_string());
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<String>, RecvError> {
        if !self.open.get() {
            return Err(RecvError);
        }
        Ok(self.state.borrow_mut().to_client.pop_front())
    }

    fn close(&mut self) {
        self.open.set(false);
    }
}

#[derive(Default)]
struct ConnectorState {
    fail_attempts: usize,
    attempts: usize,
    wires: Vec<WireHandle>,
}

/// Hands out in-memory connections, optionally failing the first N dials.
#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Rc<RefCell<ConnectorState>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(attempts: usize) -> Self {
        let connector = Self::new();
        connector.state.borrow_mut().fail_attempts = attempts;
        connector
    }

    pub fn attempts(&self) -> usize {
        self.state.borrow().attempts
    }

    /// Handle for the most recent connection.
    pub fn wire(&self) -> WireHandle {
        self.state
            .borrow()
            .wires
            .last()
            .cloned()
            .expect("no connection was established")
    }
}

impl Connector for FakeConnector {
    fn connect(&mut self) -> Result<Box<dyn Connection>, ConnectError> {
        let mut state = self.state.borrow_mut();
        state.attempts += 1;
        if state.fail_attempts > 0 {
            state.fail_attempts -= 1;
            return Err(ConnectError("room unreachable".into()));
        }
        let handle = WireHandle {
            state: Rc::new(RefCell::new(WireState::default())),
            open: Rc::new(Cell::new(true)),
        };
        handle.open.set(true);
        state.wires.push(handle.clone());
        Ok(Box::new(FakeConn {
            state: handle.state.clone(),
            open: handle.open.clone(),
        }))
    }
}

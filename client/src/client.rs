use std::rc::Rc;
use std::time::Instant;

use weft_shared::Schema;

use crate::adapter::{
    Adapter, AdapterError, CheckpointId, Connector, EcsAdapter, HistoryAdapter, HistoryConfig,
    PersistenceAdapter, TransportAdapter, TransportConfig, WorldBridge,
};
use crate::kv::KvBackend;
use crate::router;

#[derive(Clone)]
pub struct ClientConfig {
    pub document_id: String,
    pub transport: TransportConfig,
    pub history: HistoryConfig,
}

impl ClientConfig {
    pub fn new(document_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            transport: TransportConfig::new(client_id),
            history: HistoryConfig::default(),
        }
    }
}

/// One document replica: the adapter ring plus the public editing surface.
///
/// The ring order is fixed: ECS mirror, persistence, history, transport.
/// Undo, redo and checkpoints delegate to the history adapter; connection
/// control delegates to the transport adapter. Drive [`Client::tick`] once
/// per frame with a monotonic clock.
pub struct Client<W: WorldBridge> {
    ecs: EcsAdapter<W>,
    persistence: Option<PersistenceAdapter>,
    history: HistoryAdapter,
    transport: TransportAdapter,
}

impl<W: WorldBridge> Client<W> {
    /// Wires up the ring. Passing a key-value backend enables both local
    /// persistence and the transport's offline buffer.
    pub fn new(
        config: ClientConfig,
        world: W,
        schema: Rc<dyn Schema>,
        connector: Box<dyn Connector>,
        backend: Option<Rc<dyn KvBackend>>,
    ) -> Self {
        let persistence = backend.as_ref().map(|backend| {
            PersistenceAdapter::new(&config.document_id, Rc::clone(backend), Rc::clone(&schema))
        });
        let history = HistoryAdapter::new(Rc::clone(&schema), config.history.clone());
        let transport = TransportAdapter::new(
            &config.document_id,
            connector,
            Rc::clone(&schema),
            backend,
            config.transport.clone(),
        );
        Self {
            ecs: EcsAdapter::new(world, schema),
            persistence,
            history,
            transport,
        }
    }

    /// Initializes every adapter in ring order. The first failure wins;
    /// adapters already initialized stay usable so `close` remains safe.
    pub fn init(&mut self, now: Instant) -> Result<(), AdapterError> {
        self.ecs.init(now)?;
        if let Some(persistence) = &mut self.persistence {
            persistence.init(now)?;
        }
        self.history.init(now)?;
        self.transport.init(now)?;
        Ok(())
    }

    /// One pull/push round over the ring.
    pub fn tick(&mut self, now: Instant) {
        let mut ring: Vec<&mut dyn Adapter> = Vec::with_capacity(4);
        ring.push(&mut self.ecs);
        if let Some(persistence) = &mut self.persistence {
            ring.push(persistence);
        }
        ring.push(&mut self.history);
        ring.push(&mut self.transport);
        router::tick(&mut ring, now);
    }

    pub fn world(&self) -> &W {
        self.ecs.world()
    }

    pub fn world_mut(&mut self) -> &mut W {
        self.ecs.world_mut()
    }

    // History

    pub fn undo(&mut self) -> bool {
        self.history.undo()
    }

    pub fn redo(&mut self) -> bool {
        self.history.redo()
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    pub fn create_checkpoint(&mut self) -> CheckpointId {
        self.history.create_checkpoint()
    }

    pub fn revert_to_checkpoint(&mut self, id: CheckpointId) -> bool {
        self.history.revert_to_checkpoint(id)
    }

    pub fn squash_to_checkpoint(&mut self, id: CheckpointId) -> bool {
        self.history.squash_to_checkpoint(id)
    }

    pub fn on_settled(&mut self, frames: u32, callback: impl FnOnce() + 'static) {
        self.history.on_settled(frames, callback);
    }

    // Transport

    pub fn disconnect(&mut self, now: Instant) {
        self.transport.disconnect(now);
    }

    pub fn reconnect(&mut self, now: Instant) {
        self.transport.reconnect(now);
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn connected_users(&self) -> usize {
        self.transport.connected_users()
    }

    pub fn on_version_mismatch(&mut self, callback: impl FnMut(u32) + 'static) {
        self.transport.set_on_version_mismatch(callback);
    }

    /// Closes every adapter together, flushing buffered persistence.
    pub fn close(&mut self) {
        self.ecs.close();
        if let Some(persistence) = &mut self.persistence {
            persistence.close();
        }
        self.history.close();
        self.transport.close();
    }
}

mod ecs;
mod history;
mod persistence;
mod transport;

use std::time::Instant;

use weft_shared::Mutation;

use crate::kv::KvError;

pub use ecs::{EcsAdapter, WorldBridge};
pub use history::{CheckpointId, HistoryAdapter, HistoryConfig};
pub use persistence::PersistenceAdapter;
pub use transport::{
    Connection, Connector, ConnectError, RecvError, SendError, TransportAdapter, TransportConfig,
    MAX_RECONNECT_DELAY, MIN_RECONNECT_DELAY,
};

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error(transparent)]
    Kv(#[from] KvError),
}

/// One stop on the sync router's ring.
///
/// Adapters are constructed once per document, initialized together, ticked
/// by the router (pull then push, see [`crate::router`]) and closed
/// together. Each adapter recognizes its own origin in the push list and
/// skips the side-effect while still updating whatever internal mirror it
/// keeps.
pub trait Adapter {
    fn init(&mut self, now: Instant) -> Result<(), AdapterError>;

    /// Mutations this adapter wants the rest of the ring to observe this
    /// tick.
    fn pull(&mut self, now: Instant) -> Vec<Mutation>;

    /// The full ordered mutation list of this tick, identical across
    /// adapters.
    fn push(&mut self, mutations: &[Mutation], now: Instant);

    fn close(&mut self);
}

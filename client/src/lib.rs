//! # Weft Client
//! The client half of the sync core: a tick-driven router over an ordered
//! adapter ring (ECS mirror, persistence, undo history, transport) that
//! converges local and remote mutations deterministically each tick.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

mod adapter;
mod client;
mod kv;

pub mod router;

pub use adapter::{
    Adapter, AdapterError, CheckpointId, ConnectError, Connection, Connector, EcsAdapter,
    HistoryAdapter, HistoryConfig, PersistenceAdapter, RecvError, SendError, TransportAdapter,
    TransportConfig, WorldBridge, MAX_RECONNECT_DELAY, MIN_RECONNECT_DELAY,
};
pub use client::{Client, ClientConfig};
pub use kv::{BufferedKv, KvBackend, KvError, KvStore, MemoryKv, MemoryKvBackend};

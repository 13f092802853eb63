//! # Weft Server
//! Authoritative per-document rooms: patch serialization under a monotonic
//! timestamp, reconnect catch-up diffs, ephemeral per-client state with
//! disconnect cleanup, throttled persistence, and room lifetime management.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

mod connect;
mod room;
mod session;
mod storage;

pub use connect::{ConnectError, ConnectParams, DEFAULT_ROOM_ID, POLICY_VIOLATION_CLOSE_CODE};
pub use room::{Registry, RegistryConfig, Room, RoomConfig, StorageFactory};
pub use session::{Permission, SendError, SessionId, SessionSocket, UnknownPermission};
pub use storage::{
    FieldStamps, FileStorage, MemoryStorage, SharedSnapshot, Snapshot, Storage, StorageError,
};

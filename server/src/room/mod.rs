mod registry;
#[allow(clippy::module_inception)]
mod room;

pub use registry::{Registry, RegistryConfig, StorageFactory};
pub use room::{Room, RoomConfig};

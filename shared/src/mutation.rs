use serde::{Deserialize, Serialize};

use crate::patch::Patch;

/// Which adapter produced a mutation. Every adapter observes every mutation
/// and uses the origin to skip its own side-effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    Ecs,
    History,
    Persistence,
    Transport,
}

/// How a patch participates in synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncBehavior {
    /// Persisted server-side, timestamped, broadcast.
    Document,
    /// Per-client transient state, auto-cleaned on disconnect.
    Ephemeral,
    /// Persisted on the originating client only, never transmitted.
    Local,
    /// Not synchronized at all.
    None,
}

/// A patch tagged with its producer and sync behavior, as routed between
/// adapters by the sync router.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub origin: Origin,
    pub behavior: SyncBehavior,
    pub patch: Patch,
}

impl Mutation {
    pub fn new(origin: Origin, behavior: SyncBehavior, patch: Patch) -> Self {
        Self {
            origin,
            behavior,
            patch,
        }
    }
}

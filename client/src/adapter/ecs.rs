use std::rc::Rc;
use std::time::Instant;

use weft_shared::{key, Mutation, Origin, Patch, Schema, SyncBehavior};

use crate::adapter::{Adapter, AdapterError};

/// The application's entity/component world, as seen by the sync core.
///
/// The storage engine itself is external; the mirror only needs a consistent
/// per-tick snapshot of local writes and a way to apply foreign patches.
/// Entity creation and deletion are inferred from `_exists` transitions
/// inside the applied patches.
pub trait WorldBridge {
    /// Local writes since the last call, keyed `<entityId>/<componentName>`.
    fn take_changes(&mut self) -> Patch;

    /// Applies a foreign patch to the world.
    fn apply(&mut self, patch: &Patch);
}

/// Reflects the world into patches and back. The only adapter that
/// originates ECS-tagged mutations; everything the user edits enters the
/// ring here.
pub struct EcsAdapter<W: WorldBridge> {
    world: W,
    schema: Rc<dyn Schema>,
}

impl<W: WorldBridge> EcsAdapter<W> {
    pub fn new(world: W, schema: Rc<dyn Schema>) -> Self {
        Self { world, schema }
    }

    pub fn world(&self) -> &W {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut W {
        &mut self.world
    }

    fn behavior_of(&self, patch_key: &str) -> SyncBehavior {
        key::component_name(patch_key)
            .and_then(|component| self.schema.def(component))
            .map(|def| def.sync)
            // Unregistered components sync as document state, the most
            // conservative choice.
            .unwrap_or(SyncBehavior::Document)
    }
}

impl<W: WorldBridge> Adapter for EcsAdapter<W> {
    fn init(&mut self, _now: Instant) -> Result<(), AdapterError> {
        Ok(())
    }

    fn pull(&mut self, _now: Instant) -> Vec<Mutation> {
        let changes = self.world.take_changes();
        if changes.is_empty() {
            return Vec::new();
        }

        let mut document = Patch::new();
        let mut ephemeral = Patch::new();
        let mut local = Patch::new();
        for (patch_key, value) in changes {
            match self.behavior_of(&patch_key) {
                SyncBehavior::Document => document.insert(patch_key, value),
                SyncBehavior::Ephemeral => ephemeral.insert(patch_key, value),
                SyncBehavior::Local => local.insert(patch_key, value),
                SyncBehavior::None => {}
            }
        }

        [
            (SyncBehavior::Document, document),
            (SyncBehavior::Ephemeral, ephemeral),
            (SyncBehavior::Local, local),
        ]
        .into_iter()
        .filter(|(_, patch)| !patch.is_empty())
        .map(|(behavior, patch)| Mutation::new(Origin::Ecs, behavior, patch))
        .collect()
    }

    fn push(&mut self, mutations: &[Mutation], _now: Instant) {
        for mutation in mutations {
            // Our own writes are already in the world.
            if mutation.origin == Origin::Ecs {
                continue;
            }
            self.world.apply(&mutation.patch);
        }
    }

    fn close(&mut self) {}
}

use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Instant;

use weft_shared::{key, merge, patch, ComponentValue, Fields, Mutation, Origin, Patch, Schema, SyncBehavior};

use crate::adapter::{Adapter, AdapterError};

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Consecutive pushes without an ECS document mutation before the
    /// pending batch commits into one undo step.
    pub quiet_frames: u32,
    /// Oldest steps are shifted out beyond this depth.
    pub max_stack_size: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            quiet_frames: 60,
            max_stack_size: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CheckpointId(u64);

#[derive(Debug, Clone)]
struct Step {
    forward: Patch,
    inverse: Patch,
}

struct Settle {
    remaining: u32,
    initial: u32,
    callback: Box<dyn FnOnce()>,
}

/// Derives minimal inverse patches from observed forward patches, batches
/// them into undo steps after quiet periods, and keeps undo/redo correct
/// when remote edits interleave with local ones.
///
/// Only ECS-origin document mutations are recorded. Document mutations of
/// any other origin update the private state mirror so inverses are always
/// derived against what the document really looked like; ephemeral and
/// local mutations are skipped entirely.
pub struct HistoryAdapter {
    config: HistoryConfig,
    schema: Rc<dyn Schema>,
    state: Patch,
    undo_stack: Vec<Step>,
    redo_stack: Vec<Step>,
    pending_forward: Patch,
    pending_inverse: Patch,
    quiet: u32,
    outbox: Vec<Mutation>,
    checkpoints: BTreeMap<CheckpointId, usize>,
    next_checkpoint: u64,
    settles: Vec<Settle>,
}

impl HistoryAdapter {
    pub fn new(schema: Rc<dyn Schema>, config: HistoryConfig) -> Self {
        Self {
            config,
            schema,
            state: Patch::new(),
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            pending_forward: Patch::new(),
            pending_inverse: Patch::new(),
            quiet: 0,
            outbox: Vec::new(),
            checkpoints: BTreeMap::new(),
            next_checkpoint: 0,
            settles: Vec::new(),
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty() || !self.pending_forward.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }

    /// Undoes the newest step (committing the pending batch first).
    ///
    /// The redo target is re-derived against the current mirror rather than
    /// taken from the original forward, so redoing restores the pre-undo
    /// state even when remote edits landed in between.
    pub fn undo(&mut self) -> bool {
        self.commit();
        let Some(step) = self.undo_stack.pop() else {
            return false;
        };
        let redo_forward = invert(&self.state, &step.inverse);
        self.redo_stack.push(Step {
            forward: redo_forward,
            inverse: step.inverse.clone(),
        });
        patch::apply(&mut self.state, &step.inverse);
        self.emit(step.inverse);

        let depth = self.undo_stack.len();
        self.checkpoints.retain(|_, index| *index <= depth);
        true
    }

    /// Reapplies the newest undone step, symmetrically re-deriving its
    /// inverse against the current mirror.
    pub fn redo(&mut self) -> bool {
        let Some(step) = self.redo_stack.pop() else {
            return false;
        };
        let inverse = invert(&self.state, &step.forward);
        self.undo_stack.push(Step {
            forward: step.forward.clone(),
            inverse,
        });
        patch::apply(&mut self.state, &step.forward);
        self.emit(step.forward);
        true
    }

    /// Marks the current undo depth for a later revert or squash.
    pub fn create_checkpoint(&mut self) -> CheckpointId {
        let id = CheckpointId(self.next_checkpoint);
        self.next_checkpoint += 1;
        self.checkpoints.insert(id, self.undo_stack.len());
        id
    }

    /// Rolls the document back to where the checkpoint was created, undoing
    /// every step above it. The checkpoint is consumed.
    pub fn revert_to_checkpoint(&mut self, id: CheckpointId) -> bool {
        self.commit();
        let Some(target) = self.checkpoints.remove(&id) else {
            return false;
        };
        while self.undo_stack.len() > target {
            let Some(step) = self.undo_stack.pop() else {
                break;
            };
            patch::apply(&mut self.state, &step.inverse);
            self.emit(step.inverse);
        }
        self.redo_stack.clear();
        let depth = self.undo_stack.len();
        self.checkpoints.retain(|_, index| *index <= depth);
        true
    }

    /// Collapses every step above the checkpoint into one combined step
    /// without touching the document. The checkpoint is consumed.
    pub fn squash_to_checkpoint(&mut self, id: CheckpointId) -> bool {
        self.commit();
        let Some(target) = self.checkpoints.remove(&id) else {
            return false;
        };
        if self.undo_stack.len() > target {
            let steps = self.undo_stack.split_off(target);
            let forward = merge(steps.iter().map(|step| &step.forward));
            // Oldest prior value wins per field, so inverses merge in
            // reverse order.
            let mut inverse = merge(steps.iter().rev().map(|step| &step.inverse));
            // Whatever collapsed out of the forward (create-then-delete)
            // has no business being restored either.
            inverse.retain(|key, _| forward.contains_key(key));
            if !forward.is_empty() {
                self.undo_stack.push(Step { forward, inverse });
            }
        }
        let depth = self.undo_stack.len();
        self.checkpoints.retain(|_, index| *index <= depth);
        true
    }

    /// One-shot callback fired after `frames` consecutive pushes with zero
    /// ECS mutations of any behavior. The countdown restarts whenever the
    /// user touches something.
    pub fn on_settled(&mut self, frames: u32, callback: impl FnOnce() + 'static) {
        let frames = frames.max(1);
        self.settles.push(Settle {
            remaining: frames,
            initial: frames,
            callback: Box::new(callback),
        });
    }

    fn emit(&mut self, patch: Patch) {
        self.outbox
            .push(Mutation::new(Origin::History, SyncBehavior::Document, patch));
    }

    /// Commits the pending batch into one undo step, sanitizing net no-ops
    /// out of it first. Clears the redo stack and enforces the stack cap.
    fn commit(&mut self) {
        if self.pending_forward.is_empty() && self.pending_inverse.is_empty() {
            return;
        }
        let forward = std::mem::take(&mut self.pending_forward);
        let inverse = std::mem::take(&mut self.pending_inverse);

        // A key whose forward and inverse agree did not really change
        // within the batch.
        let mut forward = forward;
        forward.retain(|key, value| inverse.get(key) != Some(value));
        let mut inverse = inverse;
        inverse.retain(|key, _| forward.contains_key(key));

        if forward.is_empty() {
            return;
        }
        self.undo_stack.push(Step { forward, inverse });
        self.redo_stack.clear();

        if self.undo_stack.len() > self.config.max_stack_size {
            let overflow = self.undo_stack.len() - self.config.max_stack_size;
            self.undo_stack.drain(..overflow);
            // Shift checkpoint indices with the stack; ones pointing into
            // the dropped region can never be reached again.
            let mut shifted = BTreeMap::new();
            for (id, index) in std::mem::take(&mut self.checkpoints) {
                if index >= overflow {
                    shifted.insert(id, index - overflow);
                }
            }
            self.checkpoints = shifted;
        }
    }

    /// Derives the inverse of one observed forward patch against the mirror
    /// and accumulates both sides into the pending batch.
    fn record(&mut self, incoming: &Patch) {
        let mut forward = Patch::new();
        let mut inverse = Patch::new();
        for (patch_key, value) in incoming {
            let inverse_value = invert_value(&self.state, patch_key, value);
            let mut forward_value = value.clone();

            if let Some(excluded) = self.excluded_of(patch_key) {
                if let Some(fields) = forward_value.fields_mut() {
                    fields.retain(|name| !excluded.contains(name));
                }
                if forward_value.is_partial()
                    && forward_value.fields().is_some_and(Fields::is_empty)
                {
                    // The change only touched excluded fields.
                    continue;
                }
            }
            forward.insert(patch_key, forward_value);
            inverse.insert(patch_key, self.strip_excluded_inverse(patch_key, inverse_value));
        }

        self.pending_forward = merge([&self.pending_forward, &forward]);
        // The oldest prior value must win, so fresh inverse entries merge in
        // underneath the accumulated ones.
        self.pending_inverse = merge([&inverse, &self.pending_inverse]);
    }

    /// Excluded fields leave inverses too, except full restores: undo of a
    /// deletion brings back the complete prior state.
    fn strip_excluded_inverse(&self, patch_key: &str, mut value: ComponentValue) -> ComponentValue {
        if value.is_partial() {
            if let Some(excluded) = self.excluded_of(patch_key) {
                if let Some(fields) = value.fields_mut() {
                    fields.retain(|name| !excluded.contains(name));
                }
            }
        }
        value
    }

    fn excluded_of(&self, patch_key: &str) -> Option<&std::collections::HashSet<String>> {
        let component = key::component_name(patch_key)?;
        let def = self.schema.def(component)?;
        if def.history_excluded.is_empty() {
            None
        } else {
            Some(&def.history_excluded)
        }
    }
}

impl Adapter for HistoryAdapter {
    fn init(&mut self, _now: Instant) -> Result<(), AdapterError> {
        Ok(())
    }

    fn pull(&mut self, _now: Instant) -> Vec<Mutation> {
        std::mem::take(&mut self.outbox)
    }

    fn push(&mut self, mutations: &[Mutation], _now: Instant) {
        let mut saw_ecs_document = false;
        let mut saw_ecs = false;
        for mutation in mutations {
            if mutation.origin == Origin::Ecs {
                saw_ecs = true;
            }
            if mutation.behavior != SyncBehavior::Document {
                continue;
            }
            if mutation.origin == Origin::Ecs {
                saw_ecs_document = true;
                self.record(&mutation.patch);
            }
            // Every document mutation reaches the mirror, recorded or not.
            patch::apply(&mut self.state, &mutation.patch);
        }

        if saw_ecs_document {
            self.quiet = 0;
        } else {
            self.quiet = self.quiet.saturating_add(1);
            if self.quiet >= self.config.quiet_frames.max(1) && self.can_commit() {
                self.commit();
            }
        }

        if saw_ecs {
            for settle in &mut self.settles {
                settle.remaining = settle.initial;
            }
        } else {
            let mut index = 0;
            while index < self.settles.len() {
                self.settles[index].remaining -= 1;
                if self.settles[index].remaining == 0 {
                    let settle = self.settles.remove(index);
                    (settle.callback)();
                } else {
                    index += 1;
                }
            }
        }
    }

    fn close(&mut self) {
        self.settles.clear();
        self.outbox.clear();
    }
}

impl HistoryAdapter {
    fn can_commit(&self) -> bool {
        !self.pending_forward.is_empty() || !self.pending_inverse.is_empty()
    }
}

/// The inverse of `patch` as seen from `state`, before `patch` is applied.
fn invert(state: &Patch, patch: &Patch) -> Patch {
    patch
        .iter()
        .map(|(patch_key, value)| (patch_key.to_string(), invert_value(state, patch_key, value)))
        .collect()
}

fn invert_value(state: &Patch, patch_key: &str, value: &ComponentValue) -> ComponentValue {
    let prior = state.get(patch_key).and_then(ComponentValue::fields);
    match (value, prior) {
        // Overwritten or deleted: restore the complete prior value.
        (ComponentValue::Tombstone | ComponentValue::Full(_), Some(prior)) => {
            ComponentValue::Full(prior.clone())
        }
        // Created where nothing was: undo deletes it again.
        (_, None) => ComponentValue::Tombstone,
        (ComponentValue::Partial(touched), Some(prior)) => {
            let mut restored = Fields::new();
            if touched.version.is_some() && prior.version.is_some() {
                restored.version.clone_from(&prior.version);
            }
            for (name, _) in touched.iter() {
                // Fields that did not exist before are simply omitted.
                if let Some(old) = prior.get(name) {
                    restored.set(name, old.clone());
                }
            }
            ComponentValue::Partial(restored)
        }
    }
}

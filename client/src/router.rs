//! The tick loop that converges every adapter on the same mutation list.

use std::time::Instant;

use weft_shared::Mutation;

use crate::adapter::Adapter;

/// One router tick over an ordered adapter ring.
///
/// Pull phase first: every adapter contributes its mutations, concatenated
/// in ring order. Push phase second: every adapter observes the complete
/// list, again in ring order. Each adapter therefore sees every mutation of
/// the tick, including its own, in the same order; convergence follows from
/// the shared list plus deterministic merge semantics. The fixed order is
/// also the intra-tick tie-break: a later adapter's patch wins a same-field
/// conflict, which is why the transport sits last in the ring and remote
/// state beats a concurrent local edit.
pub fn tick(adapters: &mut [&mut dyn Adapter], now: Instant) -> Vec<Mutation> {
    let mut mutations = Vec::new();
    for adapter in adapters.iter_mut() {
        mutations.extend(adapter.pull(now));
    }
    for adapter in adapters.iter_mut() {
        adapter.push(&mutations, now);
    }
    mutations
}

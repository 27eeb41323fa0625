/// Accumulator - The live generation and its detach-and-replace swap
///
/// Writers merge into the live generation under a short-held mutex. The
/// scheduler detaches the whole generation in one step and installs a fresh
/// one, so a write either lands in the generation being flushed or in the
/// next one, never in both and never in neither.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::generation::Generation;
use crate::metrics;

pub struct Accumulator {
    live: Mutex<Live>,
}

struct Live {
    generation: Generation,
    next_id: u64,
}

impl Accumulator {
    pub fn new() -> Self {
        Self {
            live: Mutex::new(Live {
                generation: Generation::new(1),
                next_id: 2,
            }),
        }
    }

    // merges never panic halfway, so a poisoned generation is still consistent
    fn lock(&self) -> MutexGuard<'_, Live> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_to_counter(&self, key: &str, delta: i64) {
        self.lock().generation.add_to_counter(key, delta);
        metrics::increment_writes_accumulated("incrby");
    }

    pub fn add_to_hash_counter(&self, key: &str, field: &str, delta: i64) {
        self.lock().generation.add_to_hash_counter(key, field, delta);
        metrics::increment_writes_accumulated("hincrby");
    }

    pub fn add_to_set(&self, key: &str, member: &str) {
        self.lock().generation.add_to_set(key, member);
        metrics::increment_writes_accumulated("sadd");
    }

    /// Detach the live generation and install an empty one in its place
    pub fn detach(&self) -> Generation {
        let mut live = self.lock();
        let fresh = Generation::new(live.next_id);
        live.next_id += 1;
        std::mem::replace(&mut live.generation, fresh)
    }

    /// Entries pending in the live generation
    pub fn pending_entries(&self) -> usize {
        self.lock().generation.entry_count()
    }

    /// Id of the generation currently accepting writes
    pub fn live_generation_id(&self) -> u64 {
        self.lock().generation.id()
    }

    #[cfg(test)]
    pub(crate) fn peek(&self) -> Generation {
        self.lock().generation.clone()
    }
}

impl Default for Accumulator {
    fn default() -> Self {
        Self::new()
    }
}

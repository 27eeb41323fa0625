//! Store client boundary
//!
//! The batch only needs three primitives from the key-value store. Anything
//! implementing [`KeyValueStore`] can be plugged in: a real network client,
//! a retrying wrapper, or the bundled [`MemoryStore`].

use async_trait::async_trait;
use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::generation::Command;

/// Error returned by a store call
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Capability interface for the remote key-value store
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Add `delta` to the counter stored at `key` (INCRBY)
    async fn incr_by(&self, key: &str, delta: i64) -> Result<(), StoreError>;

    /// Add `delta` to the counter stored at `key`/`field` (HINCRBY)
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<(), StoreError>;

    /// Add all `members` to the set stored at `key` (SADD)
    async fn sadd(&self, key: &str, members: &[String]) -> Result<(), StoreError>;
}

/// Contents of a [`MemoryStore`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryContents {
    pub counters: IndexMap<String, i64>,
    pub hashes: IndexMap<String, IndexMap<String, i64>>,
    pub sets: IndexMap<String, IndexSet<String>>,
}

#[derive(Default)]
struct MemoryState {
    contents: MemoryContents,
    calls: Vec<Command>,
    failing_keys: HashSet<String>,
}

/// In-process store
///
/// Applies commands to in-memory maps and records every call in arrival
/// order. Keys marked with [`MemoryStore::fail_key`] reject every command.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every command against `key` fail
    pub fn fail_key(&self, key: &str) {
        self.lock().failing_keys.insert(key.to_string());
    }

    /// Every call received so far, including failed ones
    pub fn calls(&self) -> Vec<Command> {
        self.lock().calls.clone()
    }

    /// Calls received for one command name (incrby, hincrby, sadd)
    pub fn calls_named(&self, name: &str) -> Vec<Command> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.name() == name)
            .cloned()
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn contents(&self) -> MemoryContents {
        self.lock().contents.clone()
    }

    pub fn counter(&self, key: &str) -> Option<i64> {
        self.lock().contents.counters.get(key).copied()
    }

    pub fn hash_field(&self, key: &str, field: &str) -> Option<i64> {
        self.lock().contents.hashes.get(key)?.get(field).copied()
    }

    pub fn members(&self, key: &str) -> Vec<String> {
        self.lock()
            .contents
            .sets
            .get(key)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Record the call, then apply it unless the key is marked failing
    fn apply(&self, command: Command) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.calls.push(command.clone());

        if state.failing_keys.contains(command.key()) {
            return Err(format!("{} rejected: key {} unavailable", command.name(), command.key()).into());
        }

        let contents = &mut state.contents;
        match command {
            Command::IncrBy { key, delta } => {
                let value = contents.counters.entry(key).or_insert(0);
                *value = value.checked_add(delta).ok_or("increment or decrement would overflow")?;
            }
            Command::HIncrBy { key, field, delta } => {
                let value = contents.hashes.entry(key).or_default().entry(field).or_insert(0);
                *value = value.checked_add(delta).ok_or("increment or decrement would overflow")?;
            }
            Command::SAdd { key, members } => {
                contents.sets.entry(key).or_default().extend(members);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn incr_by(&self, key: &str, delta: i64) -> Result<(), StoreError> {
        self.apply(Command::IncrBy {
            key: key.to_string(),
            delta,
        })
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<(), StoreError> {
        self.apply(Command::HIncrBy {
            key: key.to_string(),
            field: field.to_string(),
            delta,
        })
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<(), StoreError> {
        self.apply(Command::SAdd {
            key: key.to_string(),
            members: members.to_vec(),
        })
    }
}

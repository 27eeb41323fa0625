/// Generation - One snapshot of pending writes
///
/// A generation holds everything accumulated between two flush instants:
/// counter deltas, hash-field deltas and pending set members. Keys, fields
/// and members all keep their first-insertion order so the commands emitted
/// for a generation are deterministic.

use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use std::fmt;

use crate::merge;

/// Accumulated writes for one flush interval
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generation {
    id: u64,
    counters: IndexMap<String, i64>,
    hash_counters: IndexMap<String, IndexMap<String, i64>>,
    sets: IndexMap<String, IndexSet<String>>,
}

/// A single store command produced from a generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum Command {
    IncrBy {
        key: String,
        delta: i64,
    },
    HIncrBy {
        key: String,
        field: String,
        delta: i64,
    },
    SAdd {
        key: String,
        members: Vec<String>,
    },
}

impl Command {
    /// Command name, used as the metrics label
    pub fn name(&self) -> &'static str {
        match self {
            Command::IncrBy { .. } => "incrby",
            Command::HIncrBy { .. } => "hincrby",
            Command::SAdd { .. } => "sadd",
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Command::IncrBy { key, .. } | Command::HIncrBy { key, .. } | Command::SAdd { key, .. } => key,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::IncrBy { key, delta } => write!(f, "INCRBY {} {}", key, delta),
            Command::HIncrBy { key, field, delta } => write!(f, "HINCRBY {} {} {}", key, field, delta),
            Command::SAdd { key, members } => write!(f, "SADD {} ({} members)", key, members.len()),
        }
    }
}

impl Generation {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Merge a counter delta into the pending value for `key`
    pub fn add_to_counter(&mut self, key: &str, delta: i64) {
        match self.counters.get_mut(key) {
            Some(pending) => *pending = merge::merge_counter(*pending, delta),
            None => {
                self.counters.insert(key.to_string(), delta);
            }
        }
    }

    /// Merge a hash-field delta; a field's position is fixed on first sight
    pub fn add_to_hash_counter(&mut self, key: &str, field: &str, delta: i64) {
        match self.hash_counters.get_mut(key) {
            Some(fields) => match fields.get_mut(field) {
                Some(pending) => *pending = merge::merge_hash_field(*pending, delta),
                None => {
                    fields.insert(field.to_string(), delta);
                }
            },
            None => {
                let mut fields = IndexMap::new();
                fields.insert(field.to_string(), delta);
                self.hash_counters.insert(key.to_string(), fields);
            }
        }
    }

    /// Add a member to the pending set for `key`
    pub fn add_to_set(&mut self, key: &str, member: &str) {
        match self.sets.get_mut(key) {
            Some(members) => {
                merge::merge_member(members, member);
            }
            None => {
                let mut members = IndexSet::new();
                members.insert(member.to_string());
                self.sets.insert(key.to_string(), members);
            }
        }
    }

    pub fn counter(&self, key: &str) -> Option<i64> {
        self.counters.get(key).copied()
    }

    pub fn hash_counter(&self, key: &str, field: &str) -> Option<i64> {
        self.hash_counters.get(key)?.get(field).copied()
    }

    pub fn hash_fields(&self, key: &str) -> Option<Vec<&str>> {
        self.hash_counters
            .get(key)
            .map(|fields| fields.keys().map(String::as_str).collect())
    }

    pub fn members(&self, key: &str) -> Option<Vec<&str>> {
        self.sets
            .get(key)
            .map(|members| members.iter().map(String::as_str).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty() && self.hash_counters.is_empty() && self.sets.is_empty()
    }

    /// Number of pending entries: counter keys, hash fields and set members
    pub fn entry_count(&self) -> usize {
        self.counters.len()
            + self.hash_counters.values().map(IndexMap::len).sum::<usize>()
            + self.sets.values().map(IndexSet::len).sum::<usize>()
    }

    /// Number of commands a flush of this generation will dispatch
    pub fn command_count(&self) -> usize {
        self.counters.len()
            + self.hash_counters.values().map(IndexMap::len).sum::<usize>()
            + self.sets.len()
    }

    /// Consume the generation into the minimal command list
    ///
    /// Order: all INCRBY, then HINCRBY grouped by key, then SADD. Within each
    /// group keys (and fields) appear in first-insertion order.
    pub fn into_commands(self) -> Vec<Command> {
        let mut commands = Vec::with_capacity(self.command_count());

        for (key, delta) in self.counters {
            commands.push(Command::IncrBy { key, delta });
        }

        for (key, fields) in self.hash_counters {
            for (field, delta) in fields {
                commands.push(Command::HIncrBy {
                    key: key.clone(),
                    field,
                    delta,
                });
            }
        }

        for (key, members) in self.sets {
            commands.push(Command::SAdd {
                key,
                members: members.into_iter().collect(),
            });
        }

        commands
    }
}

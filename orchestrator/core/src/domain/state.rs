// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Shard Local State
//!
//! [`LocalState`] is the per-shard map of entities built from the state deltas a
//! shard originates or merges. Entries are keyed by `entity_type:entity_id`.
//!
//! Two merge strategies are supported:
//!
//! - [`MergeStrategy::Record`] — whole-record last-write-wins via
//!   [`StateDelta::merge`]. A newer delta replaces the entity entirely.
//! - [`MergeStrategy::Field`] — one LWW register per field. Concurrent updates to
//!   different fields of the same entity both survive; a delete is a tombstone
//!   that hides every field written before it.
//!
//! Applying the same delta any number of times leaves the state unchanged.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

use crate::domain::delta::{entity_key, DeltaOperation, Stamp, StateDelta};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    #[default]
    Record,
    Field,
}

#[derive(Debug, Clone)]
struct Register {
    value: Value,
    stamp: Stamp,
}

#[derive(Debug, Clone)]
struct EntityEntry {
    /// Latest delta seen for the entity, by stamp.
    winner: StateDelta,
    registers: BTreeMap<String, Register>,
    tombstone: Option<Stamp>,
}

#[derive(Debug, Clone, Default)]
pub struct LocalState {
    strategy: MergeStrategy,
    entries: HashMap<String, EntityEntry>,
}

impl LocalState {
    pub fn new(strategy: MergeStrategy) -> Self {
        Self {
            strategy,
            entries: HashMap::new(),
        }
    }

    pub fn strategy(&self) -> MergeStrategy {
        self.strategy
    }

    /// Merge `delta` into the state. Returns `true` if anything changed.
    pub fn apply(&mut self, delta: StateDelta) -> bool {
        let key = delta.entity_key();
        match self.entries.get_mut(&key) {
            None => {
                let mut entry = EntityEntry {
                    winner: delta.clone(),
                    registers: BTreeMap::new(),
                    tombstone: None,
                };
                if self.strategy == MergeStrategy::Field {
                    Self::apply_fields(&mut entry, &delta);
                }
                self.entries.insert(key, entry);
                true
            }
            Some(entry) => {
                let mut changed = false;
                if StateDelta::merge(&entry.winner, &delta).delta_id != entry.winner.delta_id {
                    entry.winner = delta.clone();
                    changed = true;
                }
                if self.strategy == MergeStrategy::Field {
                    changed |= Self::apply_fields(entry, &delta);
                }
                changed
            }
        }
    }

    fn apply_fields(entry: &mut EntityEntry, delta: &StateDelta) -> bool {
        let stamp = delta.stamp();
        if delta.operation == DeltaOperation::Delete {
            if entry.tombstone.map_or(true, |t| stamp > t) {
                entry.tombstone = Some(stamp);
                return true;
            }
            return false;
        }

        let mut changed = false;
        for (field, value) in &delta.changes {
            let newer = entry
                .registers
                .get(field)
                .map_or(true, |existing| stamp > existing.stamp);
            if newer {
                entry.registers.insert(
                    field.clone(),
                    Register {
                        value: value.clone(),
                        stamp,
                    },
                );
                changed = true;
            }
        }
        changed
    }

    /// Materialized view of an entity, or `None` if absent or deleted.
    pub fn get(&self, entity_type: &str, entity_id: &str) -> Option<Value> {
        let entry = self.entries.get(&entity_key(entity_type, entity_id))?;
        match self.strategy {
            MergeStrategy::Record => match entry.winner.operation {
                DeltaOperation::Delete => None,
                _ => Some(Value::Object(entry.winner.changes.clone())),
            },
            MergeStrategy::Field => {
                let live: Map<String, Value> = entry
                    .registers
                    .iter()
                    .filter(|(_, r)| entry.tombstone.map_or(true, |t| r.stamp > t))
                    .map(|(k, r)| (k.clone(), r.value.clone()))
                    .collect();
                if live.is_empty() && entry.tombstone.is_some() {
                    None
                } else {
                    Some(Value::Object(live))
                }
            }
        }
    }

    pub fn last_delta(&self, entity_type: &str, entity_id: &str) -> Option<&StateDelta> {
        self.entries
            .get(&entity_key(entity_type, entity_id))
            .map(|e| &e.winner)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }
}

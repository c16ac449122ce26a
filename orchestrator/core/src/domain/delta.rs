// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # State Deltas
//!
//! A [`StateDelta`] is a versioned change record for one entity, exchanged
//! between shards via STATE_DELTA messages.
//!
//! ## Merge Rule
//!
//! [`StateDelta::merge`] is last-write-wins by timestamp. On an exact timestamp
//! tie the delta with the greater `delta_id` wins, so every replica picks the
//! same winner from the same pair regardless of arrival order.
//!
//! Whole-record LWW is not conflict-free for concurrent updates to *different*
//! fields of the same entity; see [`crate::domain::state::MergeStrategy::Field`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use uuid::Uuid;

use crate::domain::identity::ShardId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaOperation {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    pub delta_id: Uuid,
    pub shard_id: ShardId,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: DeltaOperation,
    #[serde(default)]
    pub changes: Map<String, Value>,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
}

/// Total order used to pick LWW winners: timestamp, then delta id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stamp {
    pub timestamp: DateTime<Utc>,
    pub delta_id: Uuid,
}

impl StateDelta {
    pub fn new(
        shard_id: ShardId,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        operation: DeltaOperation,
        changes: Map<String, Value>,
        version: u64,
    ) -> Self {
        Self {
            delta_id: Uuid::new_v4(),
            shard_id,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation,
            changes,
            version,
            timestamp: Utc::now(),
        }
    }

    /// Key under which the delta is stored in local state: `entity_type:entity_id`.
    pub fn entity_key(&self) -> String {
        entity_key(&self.entity_type, &self.entity_id)
    }

    pub fn stamp(&self) -> Stamp {
        Stamp {
            timestamp: self.timestamp,
            delta_id: self.delta_id,
        }
    }

    /// Pick the winner of two deltas for the same entity.
    pub fn merge<'a>(a: &'a StateDelta, b: &'a StateDelta) -> &'a StateDelta {
        match a.stamp().cmp(&b.stamp()) {
            Ordering::Less => b,
            Ordering::Greater | Ordering::Equal => a,
        }
    }
}

pub fn entity_key(entity_type: &str, entity_id: &str) -> String {
    format!("{}:{}", entity_type, entity_id)
}

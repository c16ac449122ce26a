// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::domain::capability::Capability;
use crate::domain::events::BusEvent;
use crate::domain::identity::ShardId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItemId(pub Uuid);

impl WorkItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque task envelope owned by exactly one shard at a time.
///
/// Created from a matched bus event or adopted from a peer's REQUEST/HANDOFF.
/// Ownership moves with the value: once enqueued, it belongs to that shard until
/// it completes, is offloaded or is handed off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    #[serde(rename = "type")]
    pub work_type: String,
    pub source: String,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
    /// Capability a peer must advertise to receive this item on offload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_capability: Option<Capability>,
    /// Number of times this item has been forwarded between shards.
    #[serde(default)]
    pub hops: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_shard: Option<ShardId>,
}

impl WorkItem {
    pub fn new(work_type: impl Into<String>, source: impl Into<String>, payload: Value) -> Self {
        let work_type = work_type.into();
        Self {
            id: WorkItemId::new(),
            required_capability: Capability::infer(&work_type),
            work_type,
            source: source.into(),
            payload,
            received_at: Utc::now(),
            hops: 0,
            origin_shard: None,
        }
    }

    pub fn from_event(event: &BusEvent, owner: ShardId) -> Self {
        let mut item = Self::new(&event.event_type, &event.source, event.payload.clone());
        item.origin_shard = Some(owner);
        item
    }

    /// Copy of this item prepared for transfer to another shard.
    pub fn forwarded(&self) -> Self {
        let mut item = self.clone();
        item.hops += 1;
        item
    }
}

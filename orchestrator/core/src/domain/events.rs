// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Bus Events and Reserved Topics
//!
//! Everything a shard sends or receives travels as a [`BusEvent`]. Domain events
//! use free-form topics such as `infra.cpu_high`; shard-to-shard traffic lives
//! under the reserved `shard.` namespace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix owned by the shard runtime. Domain events must not use it.
pub const SHARD_NAMESPACE: &str = "shard.";
/// Topic carrying periodic shard heartbeats.
pub const HEARTBEAT_TOPIC: &str = "shard.heartbeat";
/// Subscription pattern covering every peer-to-peer message type.
pub const P2P_PATTERN: &str = "shard.p2p.*";

/// Build the P2P topic for a message type tag, e.g. `shard.p2p.request`.
pub fn p2p_topic(message_type: &str) -> String {
    format!("shard.p2p.{}", message_type)
}

/// An event as carried by the shared bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    /// Topic the event is published under.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Originating component, e.g. `infra.monitor`. Scope domain matching uses this.
    pub source: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl BusEvent {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            source: source.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Whether the event belongs to the shard runtime rather than a domain.
    pub fn is_reserved(&self) -> bool {
        self.event_type.starts_with(SHARD_NAMESPACE)
    }
}

/// Topic pattern matching used by bus subscriptions.
///
/// - `"*"` matches every topic
/// - `"infra.*"` matches any topic starting with `"infra."`
/// - anything else is an exact match
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => topic.starts_with(prefix),
        None => pattern == topic,
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Shard Lifecycle and Observability Types
//!
//! Value objects describing a shard from the outside: its [`ShardType`] and
//! [`ShardStatus`], the [`ShardMetrics`] it maintains, the [`ShardSnapshot`]
//! exposed for dashboards, the coordinator's [`ShardRecord`], and the
//! [`PeerInfo`] entries a shard keeps about its peers.
//!
//! ## Status Transitions
//!
//! ```text
//! Initializing ──start()──▶ Active ◀──heartbeat──▶ Idle / Overloaded
//!                              │
//!                           stop()
//!                              ▼
//!                          Retiring ──handoff done──▶ Terminated
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::capability::Capability;
use crate::domain::identity::{PublicKey, ShardId};
use crate::domain::scope::ShardScope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardType {
    Domain,
    Workload,
    Replica,
}

impl fmt::Display for ShardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShardType::Domain => "domain",
            ShardType::Workload => "workload",
            ShardType::Replica => "replica",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStatus {
    Initializing,
    Active,
    Idle,
    Overloaded,
    Retiring,
    Terminated,
}

impl ShardStatus {
    /// Statuses in which the shard's loops are running.
    pub fn is_running(&self) -> bool {
        matches!(self, ShardStatus::Active | ShardStatus::Idle | ShardStatus::Overloaded)
    }

    /// Status implied by a load reading. Only meaningful for running shards.
    pub fn from_load(load_factor: f64, active_tasks: usize, overload_threshold: f64) -> Self {
        if load_factor >= overload_threshold {
            ShardStatus::Overloaded
        } else if load_factor == 0.0 && active_tasks == 0 {
            ShardStatus::Idle
        } else {
            ShardStatus::Active
        }
    }
}

impl fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShardStatus::Initializing => "initializing",
            ShardStatus::Active => "active",
            ShardStatus::Idle => "idle",
            ShardStatus::Overloaded => "overloaded",
            ShardStatus::Retiring => "retiring",
            ShardStatus::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Counters and gauges maintained by a running shard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardMetrics {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// Items sent to a peer via REQUEST instead of running locally.
    pub tasks_offloaded: u64,
    /// Items adopted from a peer's REQUEST or HANDOFF.
    pub tasks_adopted: u64,
    /// Items broadcast as HANDOFF during stop.
    pub tasks_handed_off: u64,
    pub messages_processed: u64,
    pub messages_dropped: u64,
    /// Running average execution latency.
    pub avg_latency_ms: f64,
    pub load_factor: f64,
    pub queue_depth: usize,
    pub uptime_seconds: u64,
}

impl ShardMetrics {
    /// Fold one execution latency into the running average.
    pub fn record_latency(&mut self, latency_ms: f64) {
        let n = (self.tasks_completed + self.tasks_failed) as f64;
        if n <= 1.0 {
            self.avg_latency_ms = latency_ms;
        } else {
            self.avg_latency_ms += (latency_ms - self.avg_latency_ms) / n;
        }
    }
}

/// Read-only view of one shard, for dashboards and the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardSnapshot {
    pub shard_id: ShardId,
    pub shard_type: ShardType,
    pub status: ShardStatus,
    pub metrics: ShardMetrics,
    pub active_task_count: usize,
}

/// Coordinator-side mirror of a live shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRecord {
    pub shard_id: ShardId,
    pub shard_type: ShardType,
    pub status: ShardStatus,
    pub capabilities: Vec<Capability>,
    pub scope: ShardScope,
    pub created_at: DateTime<Utc>,
    /// Set for replicas: the overloaded shard this one relieves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica_of: Option<ShardId>,
}

/// What a shard knows about one of its peers. Advisory and possibly stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub shard_id: ShardId,
    pub shard_type: ShardType,
    pub capabilities: Vec<Capability>,
    pub public_key: PublicKey,
    pub load_factor: f64,
    pub status: ShardStatus,
    pub last_seen: DateTime<Utc>,
}

impl PeerInfo {
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Payload of a `shard.heartbeat` bus event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub shard_id: ShardId,
    pub shard_type: ShardType,
    pub status: ShardStatus,
    pub capabilities: Vec<Capability>,
    pub public_key: PublicKey,
    pub metrics: ShardMetrics,
    pub active_task_count: usize,
}

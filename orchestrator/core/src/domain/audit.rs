// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Audit Sink Port
//!
//! Shards and the coordinator record lifecycle actions (start, stop, spawn,
//! retire) through an [`AuditSink`]. The sink is append-only and fire-and-forget
//! from the caller's point of view, but a failed write must never vanish: use
//! [`record_or_log`] so failures land in the local log instead.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    Failure(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub actor: String,
    pub action: String,
    pub resource: String,
    pub subsystem: String,
    pub payload: Value,
    pub result: AuditResult,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        actor: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
        payload: Value,
        result: AuditResult,
    ) -> Self {
        Self {
            actor: actor.into(),
            action: action.into(),
            resource: resource.into(),
            subsystem: AUDIT_SUBSYSTEM.to_string(),
            payload,
            result,
            recorded_at: Utc::now(),
        }
    }
}

/// Subsystem name stamped on every record emitted by the shard runtime.
pub const AUDIT_SUBSYSTEM: &str = "shard_coordination";

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Audit sink unavailable: {0}")]
    Unavailable(String),

    #[error("Audit record rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<(), AuditError>;
}

/// Write to `sink`, falling back to a local `warn!` if the sink errors.
pub async fn record_or_log(sink: &Arc<dyn AuditSink>, record: AuditRecord) {
    let action = record.action.clone();
    let resource = record.resource.clone();
    if let Err(e) = sink.record(record).await {
        warn!(action = %action, resource = %resource, error = %e, "Failed to write audit record");
    }
}

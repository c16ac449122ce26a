// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Audit Sink Adapters
//!
//! Two [`AuditSink`] implementations:
//!
//! - [`TracingAuditSink`] writes each record as a structured `tracing` event so
//!   any subscriber (stdout JSON, Loki, …) captures it.
//! - [`InMemoryAuditSink`] keeps records in memory for tests and the CLI
//!   `simulate` summary.

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::domain::audit::{AuditError, AuditRecord, AuditResult, AuditSink};

/// Writes audit records to the structured tracing log.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl TracingAuditSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), AuditError> {
        match &record.result {
            AuditResult::Success => info!(
                target: "audit",
                actor = %record.actor,
                action = %record.action,
                resource = %record.resource,
                subsystem = %record.subsystem,
                payload = %record.payload,
                "audit"
            ),
            AuditResult::Failure(reason) => warn!(
                target: "audit",
                actor = %record.actor,
                action = %record.action,
                resource = %record.resource,
                subsystem = %record.subsystem,
                payload = %record.payload,
                reason = %reason,
                "audit"
            ),
        }
        Ok(())
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    pub fn actions(&self) -> Vec<String> {
        self.records.lock().iter().map(|r| r.action.clone()).collect()
    }

    pub fn count(&self, action: &str) -> usize {
        self.records.lock().iter().filter(|r| r.action == action).count()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), AuditError> {
        self.records.lock().push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::audit::{record_or_log, AUDIT_SUBSYSTEM};
    use serde_json::json;
    use std::sync::Arc;

    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn record(&self, _record: AuditRecord) -> Result<(), AuditError> {
            Err(AuditError::Unavailable("ledger offline".to_string()))
        }
    }

    #[tokio::test]
    async fn test_in_memory_sink_keeps_records() {
        let sink = Arc::new(InMemoryAuditSink::new());
        let dyn_sink: Arc<dyn AuditSink> = sink.clone();

        record_or_log(
            &dyn_sink,
            AuditRecord::new("coordinator", "shard.spawn", "shard-1", json!({}), AuditResult::Success),
        )
        .await;

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].subsystem, AUDIT_SUBSYSTEM);
        assert_eq!(sink.count("shard.spawn"), 1);
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_propagate() {
        let sink: Arc<dyn AuditSink> = Arc::new(FailingSink);
        record_or_log(
            &sink,
            AuditRecord::new("shard", "shard.stop", "shard-1", json!({}), AuditResult::Success),
        )
        .await;
    }

    #[tokio::test]
    async fn test_tracing_sink_accepts_failures() {
        let sink = TracingAuditSink::new();
        let record = AuditRecord::new(
            "coordinator",
            "shard.retire",
            "shard-9",
            json!({}),
            AuditResult::Failure("not found".to_string()),
        );
        assert!(sink.record(record).await.is_ok());
    }
}

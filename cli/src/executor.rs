// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Simulated work executor
//!
//! Stands in for the real per-domain executors when the CLI runs a fleet on its
//! own. Each item sleeps for a latency scaled by the capability it needs, then
//! succeeds unless its payload carries `"fail": true`.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use shardmesh_core::domain::capability::Capability;
use shardmesh_core::domain::executor::{ExecutionError, ExecutorRegistry, WorkExecutor};
use shardmesh_core::domain::work::WorkItem;

#[derive(Debug, Clone)]
pub struct SimulatedExecutor {
    base_latency: Duration,
}

impl SimulatedExecutor {
    pub fn new(base_latency: Duration) -> Self {
        Self { base_latency }
    }

    pub fn latency_for(&self, item: &WorkItem) -> Duration {
        let factor = match item.required_capability {
            Some(Capability::DataIngestion) | Some(Capability::MemorySteward) => 3,
            Some(Capability::SecuritySentinel) | Some(Capability::SelfHealing) => 2,
            _ => 1,
        };
        self.base_latency * factor
    }

    /// Registry that routes every domain to a simulated executor.
    pub fn registry(base_latency: Duration) -> ExecutorRegistry {
        ExecutorRegistry::new(Arc::new(Self::new(base_latency)))
    }
}

#[async_trait]
impl WorkExecutor for SimulatedExecutor {
    async fn execute(&self, item: &WorkItem) -> Result<Value, ExecutionError> {
        let latency = self.latency_for(item);
        tokio::time::sleep(latency).await;

        if item.payload.get("fail").and_then(Value::as_bool) == Some(true) {
            return Err(ExecutionError::Failed(format!(
                "simulated failure for {}",
                item.work_type
            )));
        }

        debug!(work_item = %item.id, work_type = %item.work_type, ?latency, "Simulated execution");
        Ok(json!({
            "work_type": item.work_type,
            "capability": item.required_capability,
            "latency_ms": latency.as_millis() as u64,
        }))
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Work Executor Port
//!
//! The business logic a shard ultimately runs is opaque to the coordination
//! runtime. It is supplied per domain as a [`WorkExecutor`]; failures are counted
//! by the shard and never retried here.
//!
//! The executor follows the item, not the shard: an `infra.*` item adopted by an
//! app shard still runs the infra executor.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::work::WorkItem;

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Execution failed: {0}")]
    Failed(String),

    #[error("Execution timed out after {0}ms")]
    Timeout(u64),

    #[error("No executor can handle work type '{0}'")]
    Unsupported(String),
}

#[async_trait]
pub trait WorkExecutor: Send + Sync {
    async fn execute(&self, item: &WorkItem) -> Result<Value, ExecutionError>;
}

/// Resolves the executor for a work item from the domain it came from.
#[derive(Clone)]
pub struct ExecutorRegistry {
    default: Arc<dyn WorkExecutor>,
    by_domain: HashMap<String, Arc<dyn WorkExecutor>>,
}

impl ExecutorRegistry {
    pub fn new(default: Arc<dyn WorkExecutor>) -> Self {
        Self {
            default,
            by_domain: HashMap::new(),
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>, executor: Arc<dyn WorkExecutor>) -> Self {
        self.by_domain.insert(domain.into(), executor);
        self
    }

    /// Executor for `item`, keyed on the first segment of its source, then of its
    /// type. Falls back to the default executor.
    pub fn resolve_for(&self, item: &WorkItem) -> Arc<dyn WorkExecutor> {
        [item.source.as_str(), item.work_type.as_str()]
            .into_iter()
            .filter_map(|name| name.split('.').next())
            .find_map(|domain| self.by_domain.get(domain))
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixed(&'static str);

    #[async_trait]
    impl WorkExecutor for Fixed {
        async fn execute(&self, _item: &WorkItem) -> Result<Value, ExecutionError> {
            Ok(json!(self.0))
        }
    }

    async fn run(registry: &ExecutorRegistry, work_type: &str, source: &str) -> Value {
        let item = WorkItem::new(work_type, source, json!({}));
        registry.resolve_for(&item).execute(&item).await.unwrap()
    }

    #[tokio::test]
    async fn test_registry_resolves_by_item_domain() {
        let registry = ExecutorRegistry::new(Arc::new(Fixed("default")))
            .with_domain("infra", Arc::new(Fixed("infra")))
            .with_domain("app", Arc::new(Fixed("app")));

        assert_eq!(run(&registry, "infra.cpu_high", "infra.node").await, json!("infra"));
        assert_eq!(run(&registry, "app.service_crash", "app.web").await, json!("app"));
        // Source wins over type; type is used when the source names no domain
        assert_eq!(run(&registry, "app.service_crash", "infra.node").await, json!("infra"));
        assert_eq!(run(&registry, "infra.disk_alert", "node-7").await, json!("infra"));
        assert_eq!(run(&registry, "billing.invoice", "billing").await, json!("default"));
    }

    #[tokio::test]
    async fn test_domain_match_is_by_whole_segment() {
        let registry = ExecutorRegistry::new(Arc::new(Fixed("default")))
            .with_domain("app", Arc::new(Fixed("app")));
        assert_eq!(run(&registry, "apply.patch", "apply.queue").await, json!("default"));
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Shard Coordinator
//!
//! Owns the fleet table and is the only component that creates or destroys
//! shards. Spawn and retire are serialized through an admin lock so that peer
//! introductions always see a consistent fleet; read paths (`fleet_status`,
//! `get_shard`) only take the table's read lock.
//!
//! The coordination loop is a relief valve, not a scheduler: each tick it
//! spawns a REPLICA next to every overloaded shard (up to
//! `max_replicas_per_shard`) and reports idle shards. It never moves queued
//! work itself; the overloaded shard discovers the replica as a peer and
//! offloads to it.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use shardmesh_core::domain::audit::{record_or_log, AuditRecord, AuditResult, AuditSink};
use shardmesh_core::domain::capability::Capability;
use shardmesh_core::domain::config::FleetSpec;
use shardmesh_core::domain::events::SHARD_NAMESPACE;
use shardmesh_core::domain::executor::ExecutorRegistry;
use shardmesh_core::domain::identity::{ShardId, ShardIdentity};
use shardmesh_core::domain::scope::ShardScope;
use shardmesh_core::domain::shard::{ShardRecord, ShardSnapshot, ShardStatus, ShardType};
use shardmesh_core::infrastructure::event_bus::EventBus;

use crate::application::shard::{AgentShard, ShardDependencies, ShardError};

const COORDINATOR_ACTOR: &str = "coordinator";

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Shard not found: {0}")]
    ShardNotFound(ShardId),

    #[error("Domain '{0}' collides with the reserved shard namespace")]
    ReservedDomain(String),

    #[error("Shard {shard_id} failed to start: {source}")]
    StartFailed {
        shard_id: ShardId,
        #[source]
        source: ShardError,
    },
}

/// Outcome of one rebalance pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RebalanceReport {
    /// `(overloaded shard, replica spawned for it)`
    pub replicas_spawned: Vec<(ShardId, ShardId)>,
    /// Idle shards observed this pass. Reported only; never retired automatically.
    pub idle: Vec<ShardId>,
}

/// Point-in-time view of the whole fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetStatus {
    pub shards: Vec<ShardSnapshot>,
    pub total: usize,
    pub overloaded: usize,
    pub idle: usize,
    pub generated_at: DateTime<Utc>,
}

struct FleetEntry {
    record: ShardRecord,
    shard: Arc<AgentShard>,
}

pub struct ShardCoordinator {
    spec: FleetSpec,
    bus: EventBus,
    audit: Arc<dyn AuditSink>,
    executors: ExecutorRegistry,
    fleet: RwLock<HashMap<ShardId, FleetEntry>>,
    admin: tokio::sync::Mutex<()>,
}

impl ShardCoordinator {
    pub fn new(
        spec: FleetSpec,
        bus: EventBus,
        audit: Arc<dyn AuditSink>,
        executors: ExecutorRegistry,
    ) -> Self {
        Self {
            spec,
            bus,
            audit,
            executors,
            fleet: RwLock::new(HashMap::new()),
            admin: tokio::sync::Mutex::new(()),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn spec(&self) -> &FleetSpec {
        &self.spec
    }

    /// Create, start and introduce a new shard.
    pub async fn spawn_shard(
        &self,
        shard_type: ShardType,
        scope: ShardScope,
        capabilities: Vec<Capability>,
    ) -> Result<Arc<AgentShard>, CoordinatorError> {
        let _admin = self.admin.lock().await;
        self.spawn_locked(shard_type, scope, capabilities, None).await
    }

    async fn spawn_locked(
        &self,
        shard_type: ShardType,
        scope: ShardScope,
        capabilities: Vec<Capability>,
        replica_of: Option<ShardId>,
    ) -> Result<Arc<AgentShard>, CoordinatorError> {
        if let Some(domain) = &scope.domain {
            if format!("{}.", domain).starts_with(SHARD_NAMESPACE) {
                return Err(CoordinatorError::ReservedDomain(domain.clone()));
            }
        }

        let identity = ShardIdentity::generate(capabilities.clone(), self.spec.shard.trust_level);
        let shard_id = identity.shard_id();
        let shard = AgentShard::new(
            identity,
            shard_type,
            scope.clone(),
            self.spec.shard.clone(),
            ShardDependencies {
                bus: self.bus.clone(),
                audit: self.audit.clone(),
                executors: self.executors.clone(),
            },
        );

        if let Err(source) = shard.start().await {
            record_or_log(
                &self.audit,
                AuditRecord::new(
                    COORDINATOR_ACTOR,
                    "shard.spawn",
                    shard_id.to_string(),
                    json!({ "shard_type": shard_type, "scope": scope }),
                    AuditResult::Failure(source.to_string()),
                ),
            )
            .await;
            return Err(CoordinatorError::StartFailed { shard_id, source });
        }

        let introduced = {
            let mut fleet = self.fleet.write();
            let newcomer = shard.peer_info();
            for entry in fleet.values() {
                entry.shard.register_peer(newcomer.clone());
                shard.register_peer(entry.shard.peer_info());
            }
            fleet.insert(
                shard_id,
                FleetEntry {
                    record: ShardRecord {
                        shard_id,
                        shard_type,
                        status: shard.status(),
                        capabilities: capabilities.clone(),
                        scope: scope.clone(),
                        created_at: Utc::now(),
                        replica_of,
                    },
                    shard: shard.clone(),
                },
            );
            metrics::gauge!("shardmesh_fleet_size").set(fleet.len() as f64);
            fleet.len() - 1
        };

        info!(
            shard_id = %shard_id,
            shard_type = %shard_type,
            scope = %scope,
            peers = introduced,
            replica_of = ?replica_of,
            "Spawned shard"
        );
        record_or_log(
            &self.audit,
            AuditRecord::new(
                COORDINATOR_ACTOR,
                "shard.spawn",
                shard_id.to_string(),
                json!({
                    "shard_type": shard_type,
                    "scope": scope,
                    "capabilities": capabilities,
                    "replica_of": replica_of,
                }),
                AuditResult::Success,
            ),
        )
        .await;
        Ok(shard)
    }

    /// Stop a shard and remove it from the fleet. Returns the number of tasks it handed off.
    pub async fn retire_shard(&self, shard_id: ShardId) -> Result<usize, CoordinatorError> {
        let _admin = self.admin.lock().await;
        self.retire_locked(shard_id).await
    }

    async fn retire_locked(&self, shard_id: ShardId) -> Result<usize, CoordinatorError> {
        let removed = {
            let mut fleet = self.fleet.write();
            let removed = fleet.remove(&shard_id);
            if removed.is_some() {
                for entry in fleet.values() {
                    entry.shard.forget_peer(&shard_id);
                }
                metrics::gauge!("shardmesh_fleet_size").set(fleet.len() as f64);
            }
            removed
        };

        let Some(entry) = removed else {
            record_or_log(
                &self.audit,
                AuditRecord::new(
                    COORDINATOR_ACTOR,
                    "shard.retire",
                    shard_id.to_string(),
                    json!({}),
                    AuditResult::Failure("shard not found".to_string()),
                ),
            )
            .await;
            return Err(CoordinatorError::ShardNotFound(shard_id));
        };

        let handed_off = entry.shard.stop().await;
        info!(shard_id = %shard_id, handed_off, "Retired shard");
        record_or_log(
            &self.audit,
            AuditRecord::new(
                COORDINATOR_ACTOR,
                "shard.retire",
                shard_id.to_string(),
                json!({ "shard_type": entry.record.shard_type, "handed_off": handed_off }),
                AuditResult::Success,
            ),
        )
        .await;
        Ok(handed_off)
    }

    /// Bootstrap the configured baseline fleet: one shard per domain and per workload.
    pub async fn spawn_default_shards(&self) -> Result<Vec<Arc<AgentShard>>, CoordinatorError> {
        let _admin = self.admin.lock().await;
        let fleet = self.spec.fleet.clone();
        let mut spawned = Vec::with_capacity(fleet.domains.len() + fleet.workloads.len());

        for domain in fleet.domains {
            let mut scope = ShardScope::for_domain(domain.domain);
            if let Some(geography) = domain.geography {
                scope = scope.with_geography(geography);
            }
            spawned.push(
                self.spawn_locked(ShardType::Domain, scope, domain.capabilities, None)
                    .await?,
            );
        }
        for workload in fleet.workloads {
            spawned.push(
                self.spawn_locked(
                    ShardType::Workload,
                    ShardScope::for_workload(workload.workload_type),
                    workload.capabilities,
                    None,
                )
                .await?,
            );
        }

        info!(count = spawned.len(), "Default fleet spawned");
        Ok(spawned)
    }

    /// One coordination pass: replicas for overloaded shards, report idle ones.
    pub async fn rebalance(&self) -> Result<RebalanceReport, CoordinatorError> {
        let _admin = self.admin.lock().await;
        let mut report = RebalanceReport::default();

        let candidates: Vec<(ShardId, ShardScope, Vec<Capability>)> = {
            let fleet = self.fleet.read();
            let mut replica_counts: HashMap<ShardId, usize> = HashMap::new();
            for entry in fleet.values() {
                if let Some(origin) = entry.record.replica_of {
                    *replica_counts.entry(origin).or_default() += 1;
                }
            }

            let mut candidates = Vec::new();
            for (id, entry) in fleet.iter() {
                match entry.shard.status() {
                    ShardStatus::Idle => report.idle.push(*id),
                    ShardStatus::Overloaded if entry.record.shard_type != ShardType::Replica => {
                        let replicas = replica_counts.get(id).copied().unwrap_or(0);
                        if replicas < self.spec.coordinator.max_replicas_per_shard {
                            candidates.push((
                                *id,
                                entry.record.scope.clone(),
                                entry.record.capabilities.clone(),
                            ));
                        } else {
                            debug!(shard_id = %id, replicas, "Overloaded shard already at replica limit");
                        }
                    }
                    _ => {}
                }
            }
            candidates
        };

        for (origin, scope, capabilities) in candidates {
            let replica = self
                .spawn_locked(ShardType::Replica, scope, capabilities, Some(origin))
                .await?;
            metrics::counter!("shardmesh_replicas_spawned_total").increment(1);
            info!(shard_id = %origin, replica = %replica.shard_id(), "Spawned replica for overloaded shard");
            report.replicas_spawned.push((origin, replica.shard_id()));
        }

        report.idle.sort();
        if !report.idle.is_empty() {
            debug!(idle = report.idle.len(), "Idle shards observed");
        }
        Ok(report)
    }

    /// Run `rebalance` every `coordination_interval` until `cancel` fires.
    pub async fn run_coordination_loop(self: Arc<Self>, cancel: CancellationToken) {
        let period = self.spec.coordinator.coordination_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        info!(interval = ?period, "Coordination loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.rebalance().await {
                        warn!(error = %e, "Rebalance pass failed");
                    }
                }
            }
        }
        info!("Coordination loop stopped");
    }

    /// Read-only snapshot of every shard. Not used for control decisions.
    pub fn fleet_status(&self) -> FleetStatus {
        let mut shards: Vec<ShardSnapshot> = self
            .fleet
            .read()
            .values()
            .map(|entry| entry.shard.snapshot())
            .collect();
        shards.sort_by_key(|s| s.shard_id);

        FleetStatus {
            total: shards.len(),
            overloaded: shards.iter().filter(|s| s.status == ShardStatus::Overloaded).count(),
            idle: shards.iter().filter(|s| s.status == ShardStatus::Idle).count(),
            shards,
            generated_at: Utc::now(),
        }
    }

    pub fn get_shard(&self, shard_id: &ShardId) -> Option<Arc<AgentShard>> {
        self.fleet.read().get(shard_id).map(|entry| entry.shard.clone())
    }

    /// Fleet records with each status refreshed from the live shard.
    pub fn records(&self) -> Vec<ShardRecord> {
        let mut records: Vec<ShardRecord> = self
            .fleet
            .read()
            .values()
            .map(|entry| ShardRecord {
                status: entry.shard.status(),
                ..entry.record.clone()
            })
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    pub fn len(&self) -> usize {
        self.fleet.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.fleet.read().is_empty()
    }

    /// Retire every shard, newest first. Returns the number of shards retired.
    pub async fn shutdown(&self) -> usize {
        let _admin = self.admin.lock().await;
        let mut ids: Vec<(DateTime<Utc>, ShardId)> = self
            .fleet
            .read()
            .values()
            .map(|entry| (entry.record.created_at, entry.record.shard_id))
            .collect();
        ids.sort();

        let mut retired = 0;
        for (_, shard_id) in ids.into_iter().rev() {
            match self.retire_locked(shard_id).await {
                Ok(_) => retired += 1,
                Err(e) => warn!(shard_id = %shard_id, error = %e, "Failed to retire shard during shutdown"),
            }
        }
        info!(retired, "Fleet shut down");
        retired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use shardmesh_core::domain::config::FleetConfig;
    use shardmesh_core::domain::executor::{ExecutionError, WorkExecutor};
    use shardmesh_core::domain::work::WorkItem;
    use shardmesh_core::infrastructure::audit::InMemoryAuditSink;

    struct Noop;

    #[async_trait]
    impl WorkExecutor for Noop {
        async fn execute(&self, _item: &WorkItem) -> Result<Value, ExecutionError> {
            Ok(Value::Null)
        }
    }

    fn coordinator(audit: Arc<InMemoryAuditSink>) -> ShardCoordinator {
        ShardCoordinator::new(
            FleetConfig::default().spec,
            EventBus::new(256),
            audit,
            ExecutorRegistry::new(Arc::new(Noop)),
        )
    }

    #[tokio::test]
    async fn test_reserved_domain_is_rejected() {
        let coordinator = coordinator(Arc::new(InMemoryAuditSink::new()));
        let result = coordinator
            .spawn_shard(ShardType::Domain, ShardScope::for_domain("shard"), vec![])
            .await;
        assert!(matches!(result, Err(CoordinatorError::ReservedDomain(_))));
        assert!(coordinator.is_empty());
    }

    #[tokio::test]
    async fn test_retire_unknown_shard() {
        let audit = Arc::new(InMemoryAuditSink::new());
        let coordinator = coordinator(audit.clone());
        let missing = ShardId::new();

        let result = coordinator.retire_shard(missing).await;
        assert!(matches!(result, Err(CoordinatorError::ShardNotFound(id)) if id == missing));
        assert_eq!(audit.count("shard.retire"), 1);
    }

    #[tokio::test]
    async fn test_default_fleet_matches_config() {
        let coordinator = coordinator(Arc::new(InMemoryAuditSink::new()));
        let spawned = coordinator.spawn_default_shards().await.unwrap();

        let expected = coordinator.spec().fleet.domains.len() + coordinator.spec().fleet.workloads.len();
        assert_eq!(spawned.len(), expected);
        assert_eq!(coordinator.len(), expected);
        for shard in &spawned {
            assert_eq!(shard.peers().len(), expected - 1);
        }

        assert_eq!(coordinator.shutdown().await, expected);
        assert!(coordinator.is_empty());
        for shard in &spawned {
            assert_eq!(shard.status(), ShardStatus::Terminated);
        }
    }
}

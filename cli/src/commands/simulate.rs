// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `shardmesh simulate`: push synthetic events through a fleet and report
//!
//! Runs the configured default fleet with a simulated executor, publishes a
//! burst of domain events, waits for every queue to drain and prints the fleet
//! table plus an audit summary.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use shardmesh_core::domain::audit::AuditSink;
use shardmesh_core::domain::config::FleetConfig;
use shardmesh_core::domain::events::BusEvent;
use shardmesh_core::infrastructure::audit::InMemoryAuditSink;
use shardmesh_core::infrastructure::event_bus::EventBus;
use shardmesh_swarm::ShardCoordinator;

use crate::commands::output::render_fleet_table;
use crate::executor::SimulatedExecutor;

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Number of events to publish
    #[arg(long, default_value = "200")]
    pub events: usize,

    /// Pause between published events, in milliseconds
    #[arg(long, default_value = "5")]
    pub interval_ms: u64,

    /// Mark every Nth event as failing (0 disables)
    #[arg(long, default_value = "0")]
    pub fail_every: usize,

    /// Override the per-shard queue capacity
    #[arg(long)]
    pub capacity: Option<usize>,

    /// Heartbeat interval for the simulated fleet, in milliseconds
    #[arg(long, default_value = "500")]
    pub heartbeat_ms: u64,

    /// Base latency of the simulated executor, in milliseconds
    #[arg(long, default_value = "20")]
    pub executor_latency_ms: u64,

    /// Give up waiting for queues to drain after this many seconds
    #[arg(long, default_value = "60")]
    pub drain_timeout_secs: u64,

    /// Print the final fleet status as JSON
    #[arg(long)]
    pub json: bool,
}

fn event_kinds(domain: &str) -> &'static [&'static str] {
    match domain {
        "infra" => &["cpu_high", "disk_pressure", "memory_leak", "node_restart"],
        "app" => &["service_crash", "latency_metric", "cache_miss_spike", "proactive_scan"],
        "security" => &["intrusion_alert", "auth_failure", "threat_report"],
        "data" => &["ingest_batch", "schedule_import", "trace_export"],
        _ => &["metric_report", "proactive_check", "incident_alert"],
    }
}

/// Deterministic synthetic event number `seq`, spread round-robin over `domains`.
pub fn synthetic_event(seq: usize, domains: &[String], fail_every: usize) -> BusEvent {
    let domain = domains
        .get(seq % domains.len().max(1))
        .map(String::as_str)
        .unwrap_or("sim");
    let kinds = event_kinds(domain);
    let kind = kinds[(seq / domains.len().max(1)) % kinds.len()];
    let fail = fail_every > 0 && (seq + 1) % fail_every == 0;

    BusEvent::new(
        format!("{}.{}", domain, kind),
        format!("{}.sim-{}", domain, seq % 3),
        json!({ "seq": seq, "fail": fail }),
    )
}

pub async fn execute(args: SimulateArgs, config_path: Option<PathBuf>) -> Result<()> {
    let mut config = FleetConfig::load_or_default(config_path).context("Failed to load configuration")?;
    let heartbeat = Duration::from_millis(args.heartbeat_ms.max(1));
    config.spec.shard.heartbeat_interval = heartbeat;
    config.spec.coordinator.coordination_interval = heartbeat * 2;
    if let Some(capacity) = args.capacity {
        config.spec.shard.capacity = capacity;
    }
    config.validate().context("Configuration validation failed")?;

    let bus = EventBus::new(config.spec.bus.capacity.max(args.events));
    let audit = Arc::new(InMemoryAuditSink::new());
    let coordinator = Arc::new(ShardCoordinator::new(
        config.spec.clone(),
        bus.clone(),
        audit.clone() as Arc<dyn AuditSink>,
        SimulatedExecutor::registry(Duration::from_millis(args.executor_latency_ms)),
    ));
    coordinator
        .spawn_default_shards()
        .await
        .context("Failed to spawn default fleet")?;

    let cancel = CancellationToken::new();
    let coordination = tokio::spawn(coordinator.clone().run_coordination_loop(cancel.clone()));

    let domains: Vec<String> = config.spec.fleet.domains.iter().map(|d| d.domain.clone()).collect();
    info!(events = args.events, domains = domains.len(), "Publishing synthetic events");
    for seq in 0..args.events {
        bus.publish(synthetic_event(seq, &domains, args.fail_every));
        if args.interval_ms > 0 {
            tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
        }
    }

    let drained = wait_for_drain(&coordinator, Duration::from_secs(args.drain_timeout_secs)).await;
    if !drained {
        warn!("Queues did not drain before the timeout; reporting partial results");
    }
    cancel.cancel();
    let _ = coordination.await;

    let status = coordinator.fleet_status();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("{}", "Fleet status:".bold());
        println!("{}", render_fleet_table(&status));
        println!();
        println!("{}", "Audit summary:".bold());
        for action in ["shard.spawn", "shard.start", "shard.retire", "shard.stop"] {
            println!("  {:<14} {}", action, audit.count(action));
        }
        let replicas = coordinator.records().iter().filter(|r| r.replica_of.is_some()).count();
        println!("  {:<14} {}", "replicas", replicas);
    }

    coordinator.shutdown().await;
    Ok(())
}

/// Poll until every shard reports an empty queue and no active task twice in a row.
async fn wait_for_drain(coordinator: &ShardCoordinator, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut quiet_polls = 0;
    while Instant::now() < deadline {
        let status = coordinator.fleet_status();
        let busy = status
            .shards
            .iter()
            .any(|s| s.metrics.queue_depth > 0 || s.active_task_count > 0);
        quiet_polls = if busy { 0 } else { quiet_polls + 1 };
        if quiet_polls >= 2 {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

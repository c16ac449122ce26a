// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `shardmesh run`: host the default fleet until interrupted
//!
//! Spawns the configured baseline fleet, drives the coordination loop, and
//! periodically logs the fleet table. Ctrl-C retires every shard, which hands
//! off any in-flight work before the process exits.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use shardmesh_core::domain::audit::AuditSink;
use shardmesh_core::domain::config::FleetConfig;
use shardmesh_core::domain::events::{BusEvent, HEARTBEAT_TOPIC};
use shardmesh_core::domain::shard::{HeartbeatPayload, ShardStatus};
use shardmesh_core::infrastructure::audit::TracingAuditSink;
use shardmesh_core::infrastructure::event_bus::{EventBus, EventHandler};
use shardmesh_swarm::ShardCoordinator;

use crate::commands::output::render_fleet_table;
use crate::executor::SimulatedExecutor;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Seconds between fleet status reports (0 disables them)
    #[arg(long, default_value = "60")]
    pub status_interval: u64,

    /// Base latency of the simulated executor, in milliseconds
    #[arg(long, default_value = "50")]
    pub executor_latency_ms: u64,
}

/// Logs peer heartbeats that signal trouble.
struct HeartbeatLogger;

#[async_trait]
impl EventHandler for HeartbeatLogger {
    async fn handle(&self, event: BusEvent) {
        match serde_json::from_value::<HeartbeatPayload>(event.payload) {
            Ok(heartbeat) if heartbeat.status == ShardStatus::Overloaded => warn!(
                shard_id = %heartbeat.shard_id,
                load_factor = heartbeat.metrics.load_factor,
                queue_depth = heartbeat.metrics.queue_depth,
                "Shard overloaded"
            ),
            Ok(heartbeat) => debug!(
                shard_id = %heartbeat.shard_id,
                status = %heartbeat.status,
                active_tasks = heartbeat.active_task_count,
                "Heartbeat"
            ),
            Err(e) => warn!(error = %e, "Unreadable heartbeat"),
        }
    }
}

pub async fn execute(args: RunArgs, config_path: Option<PathBuf>) -> Result<()> {
    let config = FleetConfig::load_or_default(config_path).context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;

    let bus = EventBus::new(config.spec.bus.capacity);
    let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink::new());
    let coordinator = Arc::new(ShardCoordinator::new(
        config.spec.clone(),
        bus.clone(),
        audit,
        SimulatedExecutor::registry(Duration::from_millis(args.executor_latency_ms)),
    ));

    let heartbeat_logger = bus.subscribe_with(HEARTBEAT_TOPIC, Arc::new(HeartbeatLogger));
    let shards = coordinator
        .spawn_default_shards()
        .await
        .context("Failed to spawn default fleet")?;
    info!(shards = shards.len(), "Fleet running; press Ctrl-C to stop");

    let cancel = CancellationToken::new();
    let coordination = tokio::spawn(coordinator.clone().run_coordination_loop(cancel.clone()));
    let reporter = (args.status_interval > 0).then(|| {
        tokio::spawn(report_status(
            coordinator.clone(),
            Duration::from_secs(args.status_interval),
            cancel.clone(),
        ))
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");

    cancel.cancel();
    let _ = coordination.await;
    if let Some(reporter) = reporter {
        let _ = reporter.await;
    }
    let retired = coordinator.shutdown().await;
    heartbeat_logger.abort();

    info!(retired, "Fleet stopped");
    Ok(())
}

async fn report_status(coordinator: Arc<ShardCoordinator>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                info!("Fleet status\n{}", render_fleet_table(&coordinator.fleet_status()));
            }
        }
    }
}

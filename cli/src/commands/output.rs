// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Terminal rendering of fleet snapshots

use colored::{ColoredString, Colorize};

use shardmesh_core::domain::shard::{ShardSnapshot, ShardStatus};
use shardmesh_swarm::FleetStatus;

fn status_label(status: ShardStatus) -> ColoredString {
    let label = status.to_string();
    match status {
        ShardStatus::Active => label.green(),
        ShardStatus::Idle => label.dimmed(),
        ShardStatus::Overloaded => label.red().bold(),
        ShardStatus::Retiring | ShardStatus::Terminated => label.yellow(),
        ShardStatus::Initializing => label.normal(),
    }
}

fn row(snapshot: &ShardSnapshot) -> String {
    let m = &snapshot.metrics;
    let id = snapshot.shard_id.to_string();
    format!(
        "  {:<8} {:<9} {:<12} {:>6} {:>9} {:>6} {:>9} {:>7} {:>6.2} {:>9.1}",
        &id[..8],
        snapshot.shard_type.to_string(),
        status_label(snapshot.status),
        snapshot.active_task_count,
        m.tasks_completed,
        m.tasks_failed,
        m.tasks_offloaded,
        m.tasks_adopted,
        m.load_factor,
        m.avg_latency_ms,
    )
}

/// One line per shard plus a totals footer.
pub fn render_fleet_table(status: &FleetStatus) -> String {
    let mut lines = vec![format!(
        "  {:<8} {:<9} {:<12} {:>6} {:>9} {:>6} {:>9} {:>7} {:>6} {:>9}",
        "SHARD", "TYPE", "STATUS", "ACTIVE", "COMPLETED", "FAILED", "OFFLOADED", "ADOPTED", "LOAD", "AVG MS"
    )
    .bold()
    .to_string()];
    lines.extend(status.shards.iter().map(row));
    lines.push(format!(
        "  {} shards, {} overloaded, {} idle (at {})",
        status.total,
        status.overloaded,
        status.idle,
        status.generated_at.format("%H:%M:%S")
    ));
    lines.join("\n")
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod coordinator;
pub mod shard;

pub use coordinator::{CoordinatorError, FleetStatus, RebalanceReport, ShardCoordinator};
pub use shard::{AgentShard, ShardDependencies, ShardError};

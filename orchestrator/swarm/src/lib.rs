// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # `shardmesh-swarm` — Shard Runtime and Fleet Coordination
//!
//! Runs the agent shards defined in `shardmesh-core` and manages the fleet
//! they form.
//!
//! ## Crate Layout
//!
//! | Module | Layer | Contents |
//! |--------|-------|----------|
//! | [`domain`] | Domain | `PeerTable` |
//! | [`application`] | Application | `AgentShard`, `ShardCoordinator` |
//!
//! ## Key Concepts
//!
//! - **Shard**: three loops (work, messages, heartbeat) over private queues fed
//!   from the shared event bus. Shards never call each other directly.
//! - **Peer table**: each shard's advisory, possibly stale view of its peers,
//!   learned from coordinator introductions, OFFERs and heartbeats.
//! - **Coordinator**: the composition-root-owned fleet manager. Spawns, retires
//!   and introduces shards, and adds replicas next to overloaded ones.

pub mod application;
pub mod domain;

pub use application::*;
pub use domain::*;

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Shard Coordination Domain Layer
//!
//! Pure domain types with no runtime dependencies beyond async traits for the
//! two consumed ports ([`audit::AuditSink`], [`executor::WorkExecutor`]).
//!
//! | Module | Key Types |
//! |--------|-----------|
//! | [`capability`] | `Capability` |
//! | [`identity`] | `ShardId`, `ShardIdentity`, `PublicKey` |
//! | [`scope`] | `ShardScope`, `WorkloadType` |
//! | [`events`] | `BusEvent`, topic helpers |
//! | [`work`] | `WorkItem` |
//! | [`message`] | `P2PMessage`, `MessageType`, payloads |
//! | [`delta`] | `StateDelta` |
//! | [`state`] | `LocalState`, `MergeStrategy` |
//! | [`shard`] | `ShardStatus`, `ShardMetrics`, `ShardRecord`, `PeerInfo` |
//! | [`config`] | `FleetConfig` |

pub mod audit;
pub mod capability;
pub mod config;
pub mod delta;
pub mod events;
pub mod executor;
pub mod identity;
pub mod message;
pub mod scope;
pub mod shard;
pub mod state;
pub mod work;

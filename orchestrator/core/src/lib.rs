// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # `shardmesh-core` — Shard Coordination Primitives
//!
//! Domain types and infrastructure shared by the shard runtime and the CLI.
//!
//! ## Crate Layout
//!
//! | Module | Layer | Contents |
//! |--------|-------|----------|
//! | [`domain`] | Domain | identities, scopes, messages, deltas, config, ports |
//! | [`infrastructure`] | Infrastructure | `EventBus`, audit sinks |

pub mod domain;
pub mod infrastructure;

pub use domain::*;

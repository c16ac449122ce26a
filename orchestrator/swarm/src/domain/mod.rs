// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Domain Layer
//!
//! Pure bookkeeping owned by a single shard. No I/O.
//!
//! | Module | Key Types |
//! |--------|-----------|
//! | [`peers`] | `PeerTable` |

pub mod peers;

pub use peers::PeerTable;

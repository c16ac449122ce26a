// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Infrastructure adapters: the in-memory event bus and audit sinks.

pub mod audit;
pub mod event_bus;

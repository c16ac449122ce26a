// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the shardmesh CLI

pub mod config;
pub mod output;
pub mod run;
pub mod simulate;

pub use self::config::ConfigCommand;
pub use self::run::RunArgs;
pub use self::simulate::SimulateArgs;

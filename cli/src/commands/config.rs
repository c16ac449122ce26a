// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use shardmesh_core::domain::config::FleetConfig;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show the effective configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,

        /// Print the effective configuration as YAML
        #[arg(long)]
        yaml: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path
        #[arg(short, long, default_value = "./shardmesh.yaml")]
        output: PathBuf,

        /// Include every option with comments
        #[arg(long)]
        examples: bool,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths, yaml } => show(config_override, paths, yaml).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, examples } => generate(output, examples).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool, as_yaml: bool) -> Result<()> {
    let config = FleetConfig::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. SHARDMESH_CONFIG_PATH: {}",
            std::env::var("SHARDMESH_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./shardmesh.yaml");
        println!("  4. ~/.shardmesh/config.yaml");
        println!();
    }

    if as_yaml {
        print!("{}", config.to_yaml_string()?);
        return Ok(());
    }

    let spec = &config.spec;
    println!("{}", "Shard runtime:".bold());
    println!("  Capacity: {}", spec.shard.capacity);
    println!("  Heartbeat interval: {:?}", spec.shard.heartbeat_interval);
    println!(
        "  Overload / help thresholds: {} / {}",
        spec.shard.overload_threshold, spec.shard.help_threshold
    );
    println!("  Max offload hops: {}", spec.shard.max_offload_hops);
    println!("  Merge strategy: {:?}", spec.shard.merge_strategy);
    println!();

    println!("{}", "Coordinator:".bold());
    println!("  Coordination interval: {:?}", spec.coordinator.coordination_interval);
    println!("  Max replicas per shard: {}", spec.coordinator.max_replicas_per_shard);
    println!();

    println!("{}", "Default fleet:".bold());
    for domain in &spec.fleet.domains {
        let capabilities: Vec<&str> = domain.capabilities.iter().map(|c| c.as_str()).collect();
        print!("  {} [{}]", domain.domain.bold(), capabilities.join(", "));
        match &domain.geography {
            Some(geography) => println!(" @ {}", geography),
            None => println!(),
        }
    }
    for workload in &spec.fleet.workloads {
        let capabilities: Vec<&str> = workload.capabilities.iter().map(|c| c.as_str()).collect();
        println!(
            "  {} [{}]",
            format!("workload:{}", workload.workload_type).bold(),
            capabilities.join(", ")
        );
    }
    println!();

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = FleetConfig::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: PathBuf, with_examples: bool) -> Result<()> {
    let sample = sample_config(with_examples);

    std::fs::write(&output, sample)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}

fn sample_config(with_examples: bool) -> &'static str {
    if with_examples {
        include_str!("../../templates/config-with-examples.yaml")
    } else {
        include_str!("../../templates/config-minimal.yaml")
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use enclave_core::domain::runtime_config::RuntimeConfigManifest;
use enclave_core::domain::sandbox::{SandboxPolicy, SecurityLevel};

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,

        /// Print the effective manifest as YAML
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
        /// Output path (default: ./enclave-config.yaml)
        #[arg(short, long, default_value = "./enclave-config.yaml")]
        output: PathBuf,

        /// Include a sample custom sandbox policy and metrics port
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
        ConfigCommand::Generate { output, examples } => generate(&output, examples).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool, as_yaml: bool) -> Result<()> {
    let config = RuntimeConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. ENCLAVE_CONFIG_PATH: {}",
            std::env::var("ENCLAVE_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./enclave-config.yaml");
        println!("  4. ~/.enclave/config.yaml");
        println!("  5. /etc/enclave/config.yaml");
        println!();
    }

    if as_yaml {
        print!(
            "{}",
            serde_yaml::to_string(&config).context("Failed to render configuration")?
        );
        return Ok(());
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!("  Name: {}", config.metadata.name);
    println!();

    println!("{}", "Contexts:".bold());
    println!("  Max contexts: {}", spec.contexts.max_contexts);
    println!("  Idle TTL: {:?}", spec.contexts.ttl);
    println!("  Sweep interval: {:?}", spec.contexts.sweep_interval);
    println!();

    println!("{}", "Events:".bold());
    println!("  Max attempts: {}", spec.events.default_max_attempts);
    println!("  Attempt timeout: {:?}", spec.events.default_timeout);
    println!("  Cancel grace: {:?}", spec.events.cancel_grace);
    println!("  Cross-boundary types: {}", spec.events.cross_boundary_types.join(", "));
    println!();

    println!("{}", "Results:".bold());
    println!("  Max size: {}", spec.results.max_size);
    println!("  Retention: {:?}", spec.results.retention);
    println!();

    println!("{}", "Sandbox:".bold());
    println!("  Default level: {}", spec.sandbox.default_level);
    println!("  Worker threads: {}", spec.sandbox.worker_threads);
    for (name, policy) in &spec.sandbox.custom_policies {
        println!(
            "    - {} ({}, {}MB, wall {:?})",
            name.bold(),
            policy.level,
            policy.max_memory_mb,
            policy.max_wall_time
        );
    }
    println!();

    println!("{}", "Observability:".bold());
    println!("  Log level: {}", spec.observability.log_level);
    match spec.observability.metrics_port {
        Some(port) => println!("  Metrics port: {}", port),
        None => println!("  Metrics port: {}", "(disabled)".dimmed()),
    }
    println!();

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = RuntimeConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: &Path, with_examples: bool) -> Result<()> {
    sample_manifest(with_examples)
        .to_yaml_file(output)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}

/// Default manifest, optionally carrying a sample custom policy.
pub fn sample_manifest(with_examples: bool) -> RuntimeConfigManifest {
    let mut manifest = RuntimeConfigManifest::default();
    if with_examples {
        manifest.spec.sandbox.custom_policies.insert(
            "strict-net".to_string(),
            SandboxPolicy::preset(SecurityLevel::High)
                .with_memory_mb(64)
                .with_wall_time(Duration::from_secs(5))
                .deny_module("pickle"),
        );
        manifest.spec.observability.metrics_port = Some(9464);
    }
    manifest
}

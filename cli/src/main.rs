// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Enclave CLI
//!
//! The `enclave` binary inspects runtime configuration, encodes and decodes
//! scope keys, and boots a demo runtime that exercises the isolation
//! guarantees end to end.
//!
//! ## Commands
//!
//! - `enclave config show|validate|generate` - Configuration management
//! - `enclave scope encode|decode` - Scope key tooling
//! - `enclave run` - Demo runtime with health and statistics output

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use enclave::commands::{self, ConfigCommand, RunArgs, ScopeCommand};

/// Enclave - isolation-scoping runtime for multi-tenant agents
#[derive(Parser)]
#[command(name = "enclave")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "ENCLAVE_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "ENCLAVE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format (text, json)
    #[arg(long, global = true, env = "ENCLAVE_LOG_FORMAT", default_value = "text")]
    log_format: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Scope key tooling
    #[command(name = "scope")]
    Scope {
        #[command(subcommand)]
        command: ScopeCommand,
    },

    /// Boot a demo runtime and print what it observed
    #[command(name = "run")]
    Run {
        #[command(flatten)]
        args: RunArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level, &cli.log_format)?;

    match cli.command {
        Some(Commands::Config { command }) => {
            commands::config::handle_command(command, cli.config).await
        }
        Some(Commands::Scope { command }) => commands::scope::handle_command(command),
        Some(Commands::Run { args }) => commands::run::execute(args, cli.config).await,
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr);

    match format {
        "json" => builder.json().init(),
        "text" => builder.compact().init(),
        other => anyhow::bail!("Unknown log format '{}'. Expected 'text' or 'json'", other),
    }

    Ok(())
}

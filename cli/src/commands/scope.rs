// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Scope key tooling
//!
//! Commands: encode, decode

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::Serialize;

use enclave_core::domain::scope::{IsolationLevel, Scope};

#[derive(Subcommand)]
pub enum ScopeCommand {
    /// Encode scope dimensions into the canonical key
    Encode {
        #[arg(long)]
        tenant: String,

        #[arg(long)]
        agent: String,

        #[arg(long)]
        platform: Option<String>,

        #[arg(long)]
        conversation: Option<String>,
    },

    /// Decode a canonical key, or a `tenant:agent[:platform][:conversation]` string
    Decode {
        #[arg(value_name = "KEY")]
        key: String,

        /// Parse the human colon form instead of the canonical key
        #[arg(long)]
        human: bool,
    },
}

/// Everything the CLI prints about one scope.
#[derive(Debug, Serialize)]
pub struct ScopeDescription {
    pub scope: Scope,
    pub display: String,
    pub key: String,
    pub level: IsolationLevel,
    pub stable_hash: String,
}

impl From<Scope> for ScopeDescription {
    fn from(scope: Scope) -> Self {
        Self {
            display: scope.to_string(),
            key: scope.key(),
            level: scope.level(),
            stable_hash: scope.stable_hash(),
            scope,
        }
    }
}

pub fn handle_command(command: ScopeCommand) -> Result<()> {
    let description = match command {
        ScopeCommand::Encode {
            tenant,
            agent,
            platform,
            conversation,
        } => ScopeDescription::from(
            Scope::new(tenant, agent, platform, conversation).context("Invalid scope")?,
        ),
        ScopeCommand::Decode { key, human } => decode(&key, human)?,
    };

    println!("{}", serde_json::to_string_pretty(&description)?);
    Ok(())
}

pub fn decode(value: &str, human: bool) -> Result<ScopeDescription> {
    let scope = if human {
        Scope::parse_human(value)
    } else {
        Scope::parse_key(value)
    }
    .with_context(|| format!("Failed to decode scope '{}'", value))?;
    Ok(ScopeDescription::from(scope))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_inverts_encode() {
        let scope = Scope::new("t:1", "a1", Some("qq".to_string()), None).unwrap();
        let decoded = decode(&scope.key(), false).unwrap();
        assert_eq!(decoded.scope, scope);
        assert_eq!(decoded.level, IsolationLevel::Platform);
    }

    #[test]
    fn test_decode_human_form() {
        let decoded = decode("t1:a1:qq:c1", true).unwrap();
        assert_eq!(decoded.scope.conversation_id(), Some("c1"));
        assert_eq!(decoded.display, "t1:a1:qq:c1");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode("only-one-part", true).is_err());
    }
}

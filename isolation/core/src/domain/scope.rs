// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Scope Identity
//!
//! A [`Scope`] is the `(tenant, agent, platform?, conversation?)` tuple that
//! drives every isolation decision in the runtime. Contexts, handler
//! registrations, event envelopes, stored results and sandbox violations are
//! all keyed by it.
//!
//! ## Encodings
//!
//! | Form | Example | Injective | Used for |
//! |------|---------|-----------|----------|
//! | [`Scope::key`] | `+acme:+bot:-:+c1` | yes | map keys, wire form |
//! | [`Scope::stable_hash`] | `9f1c0d2e8a7b6c5d` | collision-resistant | generated ids |
//! | `Display` | `acme:bot:c1` | no | logs |
//!
//! ## Narrowing
//!
//! `a.is_within(&b)` holds when `a` equals `b` or strictly narrows it: same
//! tenant and agent, and every optional dimension pinned by `b` is pinned to
//! the same value by `a`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::error::IsolationError;

const KEY_SEPARATOR: char = ':';
const KEY_ESCAPE: char = '\\';
const KEY_PRESENT: char = '+';
const KEY_ABSENT: char = '-';

/// Granularity of a scope, from the coarsest dimension to the narrowest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    Agent,
    Platform,
    Conversation,
}

/// Canonical isolation identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawScope")]
pub struct Scope {
    tenant_id: String,
    agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    conversation_id: Option<String>,
}

#[derive(Deserialize)]
struct RawScope {
    tenant_id: String,
    agent_id: String,
    #[serde(default)]
    platform: Option<String>,
    #[serde(default)]
    conversation_id: Option<String>,
}

impl TryFrom<RawScope> for Scope {
    type Error = IsolationError;

    fn try_from(raw: RawScope) -> Result<Self, Self::Error> {
        Scope::new(raw.tenant_id, raw.agent_id, raw.platform, raw.conversation_id)
    }
}

/// Fields a child scope may pin on top of its parent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeOverrides {
    pub platform: Option<String>,
    pub conversation_id: Option<String>,
}

impl ScopeOverrides {
    pub fn platform(platform: impl Into<String>) -> Self {
        Self {
            platform: Some(platform.into()),
            conversation_id: None,
        }
    }

    pub fn conversation(conversation_id: impl Into<String>) -> Self {
        Self {
            platform: None,
            conversation_id: Some(conversation_id.into()),
        }
    }
}

impl Scope {
    /// Builds a scope, failing fast when a required dimension is blank.
    pub fn new(
        tenant_id: impl Into<String>,
        agent_id: impl Into<String>,
        platform: Option<String>,
        conversation_id: Option<String>,
    ) -> Result<Self, IsolationError> {
        let tenant_id = required("tenant_id", tenant_id.into())?;
        let agent_id = required("agent_id", agent_id.into())?;
        Ok(Self {
            tenant_id,
            agent_id,
            platform: optional(platform),
            conversation_id: optional(conversation_id),
        })
    }

    /// Agent-wide scope with no platform or conversation pinned.
    pub fn agent(tenant_id: impl Into<String>, agent_id: impl Into<String>) -> Result<Self, IsolationError> {
        Self::new(tenant_id, agent_id, None, None)
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = optional(Some(platform.into()));
        self
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = optional(Some(conversation_id.into()));
        self
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn platform(&self) -> Option<&str> {
        self.platform.as_deref()
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Narrowest populated dimension.
    pub fn level(&self) -> IsolationLevel {
        if self.conversation_id.is_some() {
            IsolationLevel::Conversation
        } else if self.platform.is_some() {
            IsolationLevel::Platform
        } else {
            IsolationLevel::Agent
        }
    }

    /// Number of optional dimensions pinned (0..=2).
    pub fn specificity(&self) -> u8 {
        u8::from(self.platform.is_some()) + u8::from(self.conversation_id.is_some())
    }

    /// True when `self` equals `other` or strictly narrows it.
    pub fn is_within(&self, other: &Scope) -> bool {
        if self.tenant_id != other.tenant_id || self.agent_id != other.agent_id {
            return false;
        }
        let pinned_match = |mine: &Option<String>, theirs: &Option<String>| match theirs {
            Some(value) => mine.as_deref() == Some(value.as_str()),
            None => true,
        };
        pinned_match(&self.platform, &other.platform)
            && pinned_match(&self.conversation_id, &other.conversation_id)
    }

    /// Derives a child scope. Unset overrides inherit from `self`; an
    /// override may pin a free dimension or restate a pinned one, never move
    /// it sideways.
    pub fn narrow(&self, overrides: &ScopeOverrides) -> Result<Scope, IsolationError> {
        let platform = merge_dimension("platform", &self.platform, &overrides.platform)?;
        let conversation_id =
            merge_dimension("conversation_id", &self.conversation_id, &overrides.conversation_id)?;
        Ok(Scope {
            tenant_id: self.tenant_id.clone(),
            agent_id: self.agent_id.clone(),
            platform,
            conversation_id,
        })
    }

    /// The agent-wide ancestor of this scope.
    pub fn agent_scope(&self) -> Scope {
        Scope {
            tenant_id: self.tenant_id.clone(),
            agent_id: self.agent_id.clone(),
            platform: None,
            conversation_id: None,
        }
    }

    /// Injective string encoding, inverted by [`Scope::parse_key`].
    pub fn key(&self) -> String {
        let mut out = String::with_capacity(
            self.tenant_id.len() + self.agent_id.len() + 16,
        );
        push_component(&mut out, Some(&self.tenant_id));
        out.push(KEY_SEPARATOR);
        push_component(&mut out, Some(&self.agent_id));
        out.push(KEY_SEPARATOR);
        push_component(&mut out, self.platform.as_deref());
        out.push(KEY_SEPARATOR);
        push_component(&mut out, self.conversation_id.as_deref());
        out
    }

    /// Decodes a string produced by [`Scope::key`].
    pub fn parse_key(encoded: &str) -> Result<Scope, IsolationError> {
        let mut parts: Vec<Option<String>> = Vec::with_capacity(4);
        let mut current = String::new();
        let mut escaped = false;
        for ch in encoded.chars() {
            if escaped {
                current.push(ch);
                escaped = false;
            } else if ch == KEY_ESCAPE {
                escaped = true;
            } else if ch == KEY_SEPARATOR {
                parts.push(decode_component(&current, encoded)?);
                current.clear();
            } else {
                current.push(ch);
            }
        }
        if escaped {
            return Err(malformed(encoded, "dangling escape"));
        }
        parts.push(decode_component(&current, encoded)?);

        if parts.len() != 4 {
            return Err(malformed(encoded, "expected four components"));
        }
        let mut parts = parts.into_iter();
        let tenant = parts.next().flatten().ok_or_else(|| malformed(encoded, "tenant is absent"))?;
        let agent = parts.next().flatten().ok_or_else(|| malformed(encoded, "agent is absent"))?;
        let platform = parts.next().flatten();
        let conversation = parts.next().flatten();
        Scope::new(tenant, agent, platform, conversation)
    }

    /// Parses the human `tenant:agent[:platform][:conversation]` form.
    ///
    /// Three parts are read as `tenant:agent:platform`.
    pub fn parse_human(value: &str) -> Result<Scope, IsolationError> {
        let parts: Vec<&str> = value.split(KEY_SEPARATOR).collect();
        if parts.len() < 2 {
            return Err(IsolationError::Configuration(format!(
                "invalid scope '{value}': expected at least tenant:agent"
            )));
        }
        if parts.len() > 4 {
            return Err(IsolationError::Configuration(format!(
                "invalid scope '{value}': too many components"
            )));
        }
        Scope::new(
            parts[0],
            parts[1],
            parts.get(2).map(|s| s.to_string()),
            parts.get(3).map(|s| s.to_string()),
        )
    }

    /// First 16 hex characters of the blake3 digest of [`Scope::key`].
    pub fn stable_hash(&self) -> String {
        let digest = blake3::hash(self.key().as_bytes());
        digest.to_hex()[..16].to_string()
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tenant_id, self.agent_id)?;
        if let Some(platform) = &self.platform {
            write!(f, ":{platform}")?;
        }
        if let Some(conversation) = &self.conversation_id {
            write!(f, ":{conversation}")?;
        }
        Ok(())
    }
}

/// Builds an identifier namespaced to `scope`.
pub fn generate_isolated_id(prefix: &str, scope: &Scope, base: &str) -> String {
    format!("{prefix}:{}:{base}", scope.stable_hash())
}

fn required(field: &str, value: String) -> Result<String, IsolationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(IsolationError::Configuration(format!("{field} is required")));
    }
    Ok(trimmed.to_string())
}

fn optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn merge_dimension(
    field: &str,
    parent: &Option<String>,
    requested: &Option<String>,
) -> Result<Option<String>, IsolationError> {
    match (parent, optional(requested.clone())) {
        (current, None) => Ok(current.clone()),
        (None, Some(value)) => Ok(Some(value)),
        (Some(current), Some(value)) if *current == value => Ok(Some(value)),
        (Some(current), Some(value)) => Err(IsolationError::Configuration(format!(
            "cannot narrow {field} from '{current}' to '{value}'"
        ))),
    }
}

fn push_component(out: &mut String, value: Option<&str>) {
    match value {
        Some(value) => {
            out.push(KEY_PRESENT);
            for ch in value.chars() {
                if ch == KEY_SEPARATOR || ch == KEY_ESCAPE {
                    out.push(KEY_ESCAPE);
                }
                out.push(ch);
            }
        }
        None => out.push(KEY_ABSENT),
    }
}

fn decode_component(raw: &str, encoded: &str) -> Result<Option<String>, IsolationError> {
    let mut chars = raw.chars();
    match chars.next() {
        Some(KEY_PRESENT) => Ok(Some(chars.collect())),
        Some(KEY_ABSENT) if raw.len() == 1 => Ok(None),
        _ => Err(malformed(encoded, "component must start with '+' or be '-'")),
    }
}

fn malformed(encoded: &str, reason: &str) -> IsolationError {
    IsolationError::Configuration(format!("malformed scope key '{encoded}': {reason}"))
}

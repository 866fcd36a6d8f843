// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Event Envelope
//!
//! One unit of routed work. The envelope carries its own retry budget and
//! per-attempt timeout; the router drives its status through the transitions
//! below and never moves a terminal envelope again.
//!
//! ```text
//! Pending ──start──▶ Running ──complete──▶ Done
//!    │                  ├──fail─────────▶ Failed  ──resubmit──▶ Pending
//!    │                  ├──time_out─────▶ Timeout ──resubmit──▶ Pending
//!    └──cancel──▶ Cancelled ◀──cancel──┘
//! ```
//!
//! `resubmit` is only accepted while `attempts < max_attempts`. Attempts are
//! counted on `start`, so an envelope with `max_attempts = 3` runs at most
//! three times.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::scope::Scope;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
    Timeout,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Running => "running",
            EventStatus::Done => "done",
            EventStatus::Failed => "failed",
            EventStatus::Cancelled => "cancelled",
            EventStatus::Timeout => "timeout",
        }
    }

    /// `Failed` and `Timeout` are terminal unless the envelope is resubmitted.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EventStatus::Pending | EventStatus::Running)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EnvelopeError {
    #[error("Invalid event status transition from {from} to {to}")]
    InvalidTransition { from: EventStatus, to: EventStatus },

    #[error("Retry budget exhausted after {attempts} of {max_attempts} attempts")]
    RetryBudgetExhausted { attempts: u32, max_attempts: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: EventId,
    pub event_type: String,
    pub scope: Scope,
    pub payload: Value,
    #[serde(default)]
    pub priority: EventPriority,
    pub created_at: DateTime<Utc>,
    status: EventStatus,
    attempts: u32,
    pub max_attempts: u32,
    /// Per-attempt deadline; the router default applies when unset.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    pub trace_id: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub parent_event_id: Option<EventId>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl EventEnvelope {
    pub fn new(event_type: impl Into<String>, scope: Scope, payload: Value) -> Self {
        let id = EventId::new();
        let created_at = Utc::now();
        let trace_id = derive_trace_id(&id, &created_at, &scope);
        Self {
            id,
            event_type: event_type.into(),
            scope,
            payload,
            priority: EventPriority::Normal,
            created_at,
            status: EventStatus::Pending,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeout: None,
            trace_id,
            correlation_id: None,
            parent_event_id: None,
            source: None,
            tags: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Values below one are clamped to one.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn status(&self) -> EventStatus {
        self.status
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn can_retry(&self) -> bool {
        matches!(self.status, EventStatus::Failed | EventStatus::Timeout)
            && self.attempts < self.max_attempts
    }

    /// Pending → Running, counting one attempt.
    pub fn start(&mut self) -> Result<(), EnvelopeError> {
        self.transition(EventStatus::Running)?;
        self.attempts += 1;
        Ok(())
    }

    pub fn complete(&mut self) -> Result<(), EnvelopeError> {
        self.transition(EventStatus::Done)
    }

    pub fn fail(&mut self) -> Result<(), EnvelopeError> {
        self.transition(EventStatus::Failed)
    }

    pub fn time_out(&mut self) -> Result<(), EnvelopeError> {
        self.transition(EventStatus::Timeout)
    }

    pub fn cancel(&mut self) -> Result<(), EnvelopeError> {
        self.transition(EventStatus::Cancelled)
    }

    /// Failed/Timeout → Pending while budget remains.
    pub fn resubmit(&mut self) -> Result<(), EnvelopeError> {
        if !matches!(self.status, EventStatus::Failed | EventStatus::Timeout) {
            return Err(EnvelopeError::InvalidTransition {
                from: self.status,
                to: EventStatus::Pending,
            });
        }
        if self.attempts >= self.max_attempts {
            return Err(EnvelopeError::RetryBudgetExhausted {
                attempts: self.attempts,
                max_attempts: self.max_attempts,
            });
        }
        self.status = EventStatus::Pending;
        Ok(())
    }

    /// Fresh delivery copy: same identity and trace, own status and budget.
    pub fn delivery_copy(&self) -> Self {
        let mut copy = self.clone();
        copy.status = EventStatus::Pending;
        copy.attempts = 0;
        copy
    }

    /// Copy of this event re-addressed to `scope`, linked to it by
    /// `parent_event_id` and sharing its trace id.
    pub fn derive_child(&self, scope: Scope) -> Self {
        let mut child = EventEnvelope::new(self.event_type.clone(), scope, self.payload.clone());
        child.priority = self.priority;
        child.max_attempts = self.max_attempts;
        child.timeout = self.timeout;
        child.trace_id = self.trace_id.clone();
        child.correlation_id = self.correlation_id.clone();
        child.parent_event_id = Some(self.id);
        child.source = self.source.clone();
        child.tags = self.tags.clone();
        child
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }

    fn transition(&mut self, to: EventStatus) -> Result<(), EnvelopeError> {
        let allowed = matches!(
            (self.status, to),
            (EventStatus::Pending, EventStatus::Running)
                | (EventStatus::Pending, EventStatus::Cancelled)
                | (EventStatus::Running, EventStatus::Done)
                | (EventStatus::Running, EventStatus::Failed)
                | (EventStatus::Running, EventStatus::Timeout)
                | (EventStatus::Running, EventStatus::Cancelled)
        );
        if !allowed {
            return Err(EnvelopeError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

fn derive_trace_id(id: &EventId, created_at: &DateTime<Utc>, scope: &Scope) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(id.0.as_bytes());
    hasher.update(created_at.to_rfc3339().as_bytes());
    hasher.update(scope.key().as_bytes());
    hasher.finalize().to_hex()[..16].to_string()
}

/// Well-known event type names and their classification.
pub mod event_types {
    pub const ON_MESSAGE: &str = "on_message";
    pub const ON_ISOLATED_MESSAGE: &str = "on_isolated_message";
    pub const ON_TENANT_MESSAGE: &str = "on_tenant_message";
    pub const ON_AGENT_MESSAGE: &str = "on_agent_message";
    pub const ON_PLATFORM_MESSAGE: &str = "on_platform_message";
    pub const ON_CHAT_STREAM_MESSAGE: &str = "on_chat_stream_message";

    pub const ON_AGENT_CONFIG_CHANGE: &str = "on_agent_config_change";
    pub const ON_AGENT_CREATED: &str = "on_agent_created";
    pub const ON_AGENT_DELETED: &str = "on_agent_deleted";
    pub const ON_PLATFORM_CONNECTED: &str = "on_platform_connected";
    pub const ON_PLATFORM_DISCONNECTED: &str = "on_platform_disconnected";
    pub const ON_CHAT_STREAM_CREATED: &str = "on_chat_stream_created";
    pub const ON_CHAT_STREAM_DESTROYED: &str = "on_chat_stream_destroyed";
    pub const ON_MEMORY_UPDATE: &str = "on_memory_update";
    pub const ON_TENANT_CREATED: &str = "on_tenant_created";
    pub const ON_TENANT_DELETED: &str = "on_tenant_deleted";
    pub const ON_PLUGIN_ENABLED: &str = "on_plugin_enabled";
    pub const ON_PLUGIN_DISABLED: &str = "on_plugin_disabled";

    pub const ON_SYSTEM_STARTUP: &str = "on_system_startup";
    pub const ON_SYSTEM_SHUTDOWN: &str = "on_system_shutdown";
    pub const ON_HEALTH_CHECK: &str = "on_health_check";
    pub const ON_CONFIG_LOADED: &str = "on_config_loaded";
    pub const ON_CONFIG_CHANGED: &str = "on_config_changed";
    pub const ON_SECURITY_ALERT: &str = "on_security_alert";
    pub const ON_ERROR_OCCURRED: &str = "on_error_occurred";
    pub const ON_RESOURCE_WARNING: &str = "on_resource_warning";
    pub const ON_ACCESS_DENIED: &str = "on_access_denied";

    /// System-wide types delivered to matching handlers in every tenant.
    pub const CROSS_BOUNDARY: &[&str] = &[
        ON_SYSTEM_STARTUP,
        ON_SYSTEM_SHUTDOWN,
        ON_HEALTH_CHECK,
        ON_CONFIG_LOADED,
        ON_CONFIG_CHANGED,
        ON_SECURITY_ALERT,
        ON_ERROR_OCCURRED,
        ON_RESOURCE_WARNING,
    ];

    pub fn is_cross_boundary(event_type: &str) -> bool {
        CROSS_BOUNDARY.contains(&event_type)
    }

    pub fn is_isolation_event(event_type: &str) -> bool {
        [
            "on_isolated_",
            "on_tenant_",
            "on_agent_",
            "on_platform_",
            "on_chat_stream_",
        ]
        .iter()
        .any(|prefix| event_type.starts_with(prefix))
    }

    pub fn is_system_event(event_type: &str) -> bool {
        [
            "on_system_",
            "on_config_",
            "on_plugin_",
            "on_security_",
            "on_data_",
        ]
        .iter()
        .any(|prefix| event_type.starts_with(prefix))
    }

    pub fn is_lifecycle_event(event_type: &str) -> bool {
        [
            "_created",
            "_updated",
            "_deleted",
            "_activated",
            "_deactivated",
            "_connected",
            "_disconnected",
            "_started",
            "_stopped",
        ]
        .iter()
        .any(|suffix| event_type.ends_with(suffix))
    }

    /// Suggested subscription priority for a type (higher runs first).
    pub fn default_priority(event_type: &str) -> i32 {
        match event_type {
            ON_SECURITY_ALERT => 100,
            ON_ERROR_OCCURRED => 90,
            ON_ACCESS_DENIED => 85,
            ON_RESOURCE_WARNING => 75,
            ON_SYSTEM_STARTUP | ON_SYSTEM_SHUTDOWN => 70,
            ON_AGENT_CREATED | ON_AGENT_DELETED => 65,
            ON_TENANT_CREATED | ON_TENANT_DELETED => 60,
            ON_PLATFORM_CONNECTED | ON_PLATFORM_DISCONNECTED => 55,
            ON_CONFIG_CHANGED => 50,
            ON_ISOLATED_MESSAGE => 30,
            ON_TENANT_MESSAGE => 25,
            ON_AGENT_MESSAGE | ON_MEMORY_UPDATE => 20,
            ON_PLATFORM_MESSAGE => 15,
            ON_HEALTH_CHECK => 5,
            _ => 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope() -> EventEnvelope {
        let scope = Scope::agent("t1", "a1").unwrap();
        EventEnvelope::new("message", scope, json!({"text": "hi"}))
    }

    #[test]
    fn test_new_envelope_defaults() {
        let env = envelope();
        assert_eq!(env.status(), EventStatus::Pending);
        assert_eq!(env.attempts(), 0);
        assert_eq!(env.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(env.trace_id.len(), 16);
        assert_eq!(env.priority, EventPriority::Normal);
    }

    #[test]
    fn test_retry_accounting_exhausts_budget() {
        let mut env = envelope().with_max_attempts(2);
        env.start().unwrap();
        env.fail().unwrap();
        assert!(env.can_retry());
        env.resubmit().unwrap();
        env.start().unwrap();
        env.time_out().unwrap();
        assert_eq!(env.attempts(), 2);
        assert!(!env.can_retry());
        assert_eq!(
            env.resubmit(),
            Err(EnvelopeError::RetryBudgetExhausted {
                attempts: 2,
                max_attempts: 2
            })
        );
        assert_eq!(env.status(), EventStatus::Timeout);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut env = envelope();
        env.start().unwrap();
        env.complete().unwrap();
        assert!(env.start().is_err());
        assert!(env.resubmit().is_err());
        assert!(env.cancel().is_err());

        let mut cancelled = envelope();
        cancelled.cancel().unwrap();
        assert!(cancelled.start().is_err());
        assert!(cancelled.resubmit().is_err());
    }

    #[test]
    fn test_derive_child_keeps_trace() {
        let parent = envelope().with_correlation_id("corr");
        let other = Scope::agent("t1", "a2").unwrap();
        let child = parent.derive_child(other.clone());
        assert_ne!(child.id, parent.id);
        assert_eq!(child.parent_event_id, Some(parent.id));
        assert_eq!(child.trace_id, parent.trace_id);
        assert_eq!(child.scope, other);
        assert_eq!(child.correlation_id.as_deref(), Some("corr"));
    }

    #[test]
    fn test_delivery_copy_resets_budget() {
        let mut env = envelope();
        env.start().unwrap();
        let copy = env.delivery_copy();
        assert_eq!(copy.id, env.id);
        assert_eq!(copy.status(), EventStatus::Pending);
        assert_eq!(copy.attempts(), 0);
    }

    #[test]
    fn test_event_type_classification() {
        assert!(event_types::is_cross_boundary(event_types::ON_SECURITY_ALERT));
        assert!(!event_types::is_cross_boundary("message"));
        assert!(event_types::is_isolation_event(event_types::ON_PLATFORM_MESSAGE));
        assert!(event_types::is_system_event(event_types::ON_CONFIG_LOADED));
        assert!(event_types::is_lifecycle_event(event_types::ON_AGENT_CREATED));
        assert!(
            event_types::default_priority(event_types::ON_SECURITY_ALERT)
                > event_types::default_priority(event_types::ON_HEALTH_CHECK)
        );
    }

    #[test]
    fn test_envelope_serializes_timeout_as_humantime() {
        let env = envelope().with_timeout(Duration::from_secs(5));
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["timeout"], json!("5s"));
        let back: EventEnvelope = serde_json::from_value(value).unwrap();
        assert_eq!(back.timeout, Some(Duration::from_secs(5)));
    }
}

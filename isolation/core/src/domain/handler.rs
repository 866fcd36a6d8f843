// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Event handlers and their registrations
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Contract between the event router and scope-bound handler code

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::event::EventEnvelope;
use crate::domain::scope::Scope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandlerId(pub Uuid);

impl HandlerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HandlerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Extra predicates a registration places on events. All must hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventFilter {
    /// Event scope must be pinned to this platform.
    Platform(String),
    /// Event must carry every listed tag.
    Tags(Vec<String>),
    /// Top-level payload field must equal `value`.
    Payload { key: String, value: Value },
}

impl EventFilter {
    pub fn matches(&self, event: &EventEnvelope) -> bool {
        match self {
            EventFilter::Platform(platform) => event.scope.platform() == Some(platform.as_str()),
            EventFilter::Tags(tags) => tags.iter().all(|t| event.tags.contains(t)),
            EventFilter::Payload { key, value } => event.payload.get(key) == Some(value),
        }
    }
}

/// What a handler tells the router after one successful attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerOutcome {
    pub continue_processing: bool,
    /// Replacement payload for the rest of the intercepting chain.
    pub payload: Option<Value>,
    pub result: Option<Value>,
    pub message: Option<String>,
}

impl HandlerOutcome {
    pub fn proceed() -> Self {
        Self {
            continue_processing: true,
            payload: None,
            result: None,
            message: None,
        }
    }

    pub fn halt(message: impl Into<String>) -> Self {
        Self {
            continue_processing: false,
            payload: None,
            result: None,
            message: Some(message.into()),
        }
    }

    pub fn rewrite(payload: Value) -> Self {
        Self {
            continue_processing: true,
            payload: Some(payload),
            result: None,
            message: None,
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }
}

impl Default for HandlerOutcome {
    fn default() -> Self {
        Self::proceed()
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("handler observed cancellation")]
    Cancelled,
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// Scope-bound reaction to routed events.
///
/// Non-intercepting handlers run as detached tasks and cannot affect the
/// publisher. Intercepting handlers run one after another and may halt the
/// chain or rewrite the payload.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    fn intercepts(&self) -> bool {
        false
    }

    async fn handle(
        &self,
        event: &EventEnvelope,
        cancel: &CancellationToken,
    ) -> Result<HandlerOutcome, HandlerError>;
}

/// A handler bound to a scope and a set of event types.
#[derive(Clone)]
pub struct HandlerRegistration {
    pub id: HandlerId,
    pub name: String,
    pub event_types: BTreeSet<String>,
    pub scope: Scope,
    pub filters: Vec<EventFilter>,
    pub priority: i32,
    pub seq: u64,
    pub intercepting: bool,
    pub enabled: bool,
    pub handler: Arc<dyn EventHandler>,
}

impl HandlerRegistration {
    /// Type, scope lineage (skipped for cross-boundary types) and filters.
    pub fn matches(&self, event: &EventEnvelope, cross_boundary: bool) -> bool {
        self.enabled
            && self.event_types.contains(&event.event_type)
            && (cross_boundary || event.scope.is_within(&self.scope))
            && self.filters.iter().all(|f| f.matches(event))
    }

    /// Dispatch order key: most specific scope, then highest priority, then
    /// earliest registration.
    pub fn order_key(&self) -> (Reverse<u8>, Reverse<i32>, u64) {
        (Reverse(self.scope.specificity()), Reverse(self.priority), self.seq)
    }
}

impl fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("event_types", &self.event_types)
            .field("scope", &self.scope)
            .field("priority", &self.priority)
            .field("seq", &self.seq)
            .field("intercepting", &self.intercepting)
            .field("enabled", &self.enabled)
            .finish()
    }
}

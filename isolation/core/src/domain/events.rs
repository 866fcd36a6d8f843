// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::context::ContextHandle;
use crate::domain::event::EventId;
use crate::domain::handler::HandlerId;
use crate::domain::plugin::{ExecutionStatus, InvocationId};
use crate::domain::result::ResultStatus;
use crate::domain::scope::Scope;
use crate::domain::violation::Violation;

/// Why a context left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    Expired,
    Invalidated,
    CapacityLru,
    TenantCleared,
    Shutdown,
}

impl EvictionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionReason::Expired => "expired",
            EvictionReason::Invalidated => "invalidated",
            EvictionReason::CapacityLru => "capacity_lru",
            EvictionReason::TenantCleared => "tenant_cleared",
            EvictionReason::Shutdown => "shutdown",
        }
    }
}

/// Context lifecycle, replacing per-registry callbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ContextEvent {
    Created {
        handle: ContextHandle,
        scope: Scope,
        parent: Option<ContextHandle>,
        created_at: DateTime<Utc>,
    },
    Invalidated {
        handle: ContextHandle,
        scope: Scope,
        cascaded: usize,
        invalidated_at: DateTime<Utc>,
    },
    Destroyed {
        handle: ContextHandle,
        scope: Scope,
        reason: EvictionReason,
        destroyed_at: DateTime<Utc>,
    },
}

/// Routing milestones for one published envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DispatchEvent {
    Published {
        event_id: EventId,
        event_type: String,
        scope: Scope,
        matched_handlers: usize,
        published_at: DateTime<Utc>,
    },
    DeliveryCompleted {
        event_id: EventId,
        handler_id: HandlerId,
        status: ResultStatus,
        attempts: u32,
        completed_at: DateTime<Utc>,
    },
    ChainHalted {
        event_id: EventId,
        handler_id: HandlerId,
        halted_at: DateTime<Utc>,
    },
    HandlerCancelled {
        handler_id: HandlerId,
        cancelled: usize,
        forced: usize,
        cancelled_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutionEvent {
    Started {
        invocation_id: InvocationId,
        plugin_id: String,
        scope: Scope,
        started_at: DateTime<Utc>,
    },
    Finished {
        invocation_id: InvocationId,
        plugin_id: String,
        status: ExecutionStatus,
        execution_ms: u64,
        finished_at: DateTime<Utc>,
    },
    Denied {
        invocation_id: InvocationId,
        plugin_id: String,
        scope: Scope,
        reason: String,
        denied_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViolationEvent {
    pub invocation_id: InvocationId,
    pub violation: Violation,
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Plugin Contract
//!
//! Extension code runs through the [`Plugin`] trait. A plugin declares which
//! tenants, agents and platforms it may serve ([`PluginAccess`]) and whether
//! it cooperates with the async scheduler or blocks a worker thread
//! ([`ExecutionMode`]). Every invocation produces an [`ExecutionResult`].
//!
//! ```text
//! Pending ──▶ Running ──▶ Success | Failure | Timeout | Cancelled
//!    └──────────────────▶ Failure | Cancelled   (never started)
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::context::Context;
use crate::domain::error::IsolationError;
use crate::domain::sandbox::{SandboxAccess, SandboxError, SecurityLevel};
use crate::domain::scope::Scope;
use crate::domain::violation::Violation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationId(pub Uuid);

impl InvocationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InvocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Async,
    Blocking,
}

/// Tenant/agent/platform allow and deny lists. An empty allow list admits
/// everyone; a deny entry always wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginAccess {
    #[serde(default)]
    pub allowed_tenants: BTreeSet<String>,
    #[serde(default)]
    pub denied_tenants: BTreeSet<String>,
    #[serde(default)]
    pub allowed_agents: BTreeSet<String>,
    #[serde(default)]
    pub denied_agents: BTreeSet<String>,
    #[serde(default)]
    pub allowed_platforms: BTreeSet<String>,
    #[serde(default)]
    pub denied_platforms: BTreeSet<String>,
}

impl PluginAccess {
    pub fn allow_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.allowed_tenants.insert(tenant.into());
        self
    }

    pub fn deny_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.denied_tenants.insert(tenant.into());
        self
    }

    pub fn allow_agent(mut self, agent: impl Into<String>) -> Self {
        self.allowed_agents.insert(agent.into());
        self
    }

    pub fn deny_agent(mut self, agent: impl Into<String>) -> Self {
        self.denied_agents.insert(agent.into());
        self
    }

    pub fn allow_platform(mut self, platform: impl Into<String>) -> Self {
        self.allowed_platforms.insert(platform.into());
        self
    }

    pub fn deny_platform(mut self, platform: impl Into<String>) -> Self {
        self.denied_platforms.insert(platform.into());
        self
    }

    /// Platform lists only apply when the scope pins a platform.
    pub fn check(&self, plugin_id: &str, scope: &Scope) -> Result<(), IsolationError> {
        let deny = |dimension: &str, value: &str| {
            Err(IsolationError::Permission(format!(
                "plugin '{plugin_id}' is not permitted for {dimension} '{value}'"
            )))
        };

        let tenant = scope.tenant_id();
        if self.denied_tenants.contains(tenant)
            || (!self.allowed_tenants.is_empty() && !self.allowed_tenants.contains(tenant))
        {
            return deny("tenant", tenant);
        }

        let agent = scope.agent_id();
        if self.denied_agents.contains(agent)
            || (!self.allowed_agents.is_empty() && !self.allowed_agents.contains(agent))
        {
            return deny("agent", agent);
        }

        if let Some(platform) = scope.platform() {
            if self.denied_platforms.contains(platform)
                || (!self.allowed_platforms.is_empty()
                    && !self.allowed_platforms.contains(platform))
            {
                return deny("platform", platform);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PluginError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("plugin observed cancellation")]
    Cancelled,

    #[error("plugin does not support {0} execution")]
    Unsupported(&'static str),
}

impl PluginError {
    pub fn failed(message: impl Into<String>) -> Self {
        PluginError::Failed(message.into())
    }
}

/// Everything a plugin can reach during one invocation.
#[derive(Clone)]
pub struct PluginEnv {
    pub invocation_id: InvocationId,
    pub method: String,
    pub context: Arc<Context>,
    pub sandbox: Arc<dyn SandboxAccess>,
    pub cancel: CancellationToken,
}

impl PluginEnv {
    pub fn scope(&self) -> &Scope {
        self.context.scope()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl fmt::Debug for PluginEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginEnv")
            .field("invocation_id", &self.invocation_id)
            .field("method", &self.method)
            .field("scope", self.context.scope())
            .field("level", &self.sandbox.level())
            .finish()
    }
}

/// Third-party extension. Implementations must tolerate being retried by
/// their caller.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn id(&self) -> &str;

    fn access(&self) -> PluginAccess {
        PluginAccess::default()
    }

    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Async
    }

    async fn execute(&self, _env: &PluginEnv, _args: Value) -> Result<Value, PluginError> {
        Err(PluginError::Unsupported("async"))
    }

    /// Runs on a blocking worker; poll `env.cancel` between units of work.
    fn execute_blocking(&self, _env: &PluginEnv, _args: Value) -> Result<Value, PluginError> {
        Err(PluginError::Unsupported("blocking"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failure,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failure => "failure",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }

    fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        match self {
            ExecutionStatus::Pending => matches!(
                next,
                ExecutionStatus::Running | ExecutionStatus::Failure | ExecutionStatus::Cancelled
            ),
            ExecutionStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub peak_memory_bytes: Option<u64>,
    /// Process CPU time consumed while the session was open.
    #[serde(default)]
    pub cpu_time_ms: Option<u64>,
    #[serde(default)]
    pub peak_threads: Option<u32>,
    pub wall_time_ms: u64,
    pub samples: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub plugin_id: String,
    pub invocation_id: InvocationId,
    pub method: String,
    pub scope: Scope,
    pub status: ExecutionStatus,
    pub security_level: SecurityLevel,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub execution_ms: u64,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub resource_usage: ResourceUsage,
    pub violations: Vec<Violation>,
}

impl ExecutionResult {
    pub fn pending(
        plugin_id: impl Into<String>,
        invocation_id: InvocationId,
        method: impl Into<String>,
        scope: Scope,
        security_level: SecurityLevel,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            invocation_id,
            method: method.into(),
            scope,
            status: ExecutionStatus::Pending,
            security_level,
            started_at: None,
            finished_at: None,
            execution_ms: 0,
            result: None,
            error: None,
            resource_usage: ResourceUsage::default(),
            violations: Vec::new(),
        }
    }

    /// Guarded status change; terminal states never move again.
    pub fn transition(&mut self, next: ExecutionStatus) -> Result<(), IsolationError> {
        if !self.status.can_transition_to(next) {
            return Err(IsolationError::Configuration(format!(
                "invocation {} cannot move from {} to {}",
                self.invocation_id, self.status, next
            )));
        }
        let now = Utc::now();
        if next == ExecutionStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
            if let Some(started) = self.started_at {
                self.execution_ms = (now - started).num_milliseconds().max(0) as u64;
            }
        }
        self.status = next;
        Ok(())
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

/// Counters kept by the executor across invocations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutorStats {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub timeout_executions: u64,
    pub cancelled_executions: u64,
    pub total_execution_ms: u64,
    pub success_rate: f64,
    pub average_execution_ms: f64,
    pub running: usize,
}

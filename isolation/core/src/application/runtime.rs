// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Runtime
//!
//! Explicitly constructed owner of every isolation component. Callers build a
//! `Runtime`, pass it by handle (usually `Arc<Runtime>`), and tear it down with
//! [`Runtime::shutdown`]. Nothing here is process-global, so tests build a
//! fresh runtime per case.
//!
//! | Component | Role |
//! |-----------|------|
//! | [`ContextRegistry`] | one live context per scope |
//! | [`EventRouter`] | scope-aware dispatch, retry and cancellation |
//! | [`ResultStore`] | delivery outcomes by scope |
//! | [`PluginExecutor`] | sandboxed plugin invocations |
//! | [`PolicyRegistry`] | sandbox tier presets and custom policies |
//! | [`ViolationLog`] | sandbox violation history |
//! | [`EventBus`] | lifecycle events for observers |

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::application::context_registry::{
    ContextRegistry, RegistryConfig, RegistryStatistics,
};
use crate::application::event_router::{CancelReport, EventRouter, PublishReceipt, RouterConfig};
use crate::application::maintenance::{MaintenanceConfig, MaintenanceLoop};
use crate::application::plugin_executor::{ExecutorConfig, PluginExecutor};
use crate::application::policy_registry::PolicyRegistry;
use crate::application::result_store::{ResultStore, ResultStoreConfig};
use crate::application::violation_log::ViolationLog;
use crate::domain::collaborators::CollaboratorFactories;
use crate::domain::context::{Context, ContextInfo};
use crate::domain::error::IsolationError;
use crate::domain::event::{EventEnvelope, EventId, EventPriority};
use crate::domain::handler::{EventFilter, EventHandler, HandlerId};
use crate::domain::plugin::{ExecutionResult, ExecutorStats, Plugin};
use crate::domain::result::{AggregateBy, AggregateStats, ResultStoreStatistics};
use crate::domain::runtime_config::RuntimeConfigSpec;
use crate::domain::sandbox::SandboxPolicy;
use crate::domain::scope::{Scope, ScopeOverrides};
use crate::domain::violation::{ViolationFilter, ViolationStats};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::sandbox::{ProcResourceProbe, Sandbox};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// Runtime-wide health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub hostname: Option<String>,
    pub uptime_secs: u64,
    pub contexts: RegistryStatistics,
    pub handlers: usize,
    pub running_handler_tasks: usize,
    pub stored_results: usize,
    pub executor: ExecutorStats,
    pub violations_last_day: usize,
    pub event_subscribers: usize,
    pub checked_at: DateTime<Utc>,
}

/// Everything the runtime knows about one scope lineage.
#[derive(Debug, Clone, Serialize)]
pub struct ScopeStatistics {
    pub scope: Scope,
    pub context: Option<ContextInfo>,
    pub child_contexts: usize,
    pub results: ResultStoreStatistics,
    pub by_event_type: BTreeMap<String, AggregateStats>,
    pub violations: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub handler_tasks: CancelReport,
    pub plugins_still_running: usize,
    pub contexts_destroyed: usize,
}

pub struct Runtime {
    config: RuntimeConfigSpec,
    contexts: Arc<ContextRegistry>,
    router: EventRouter,
    results: Arc<ResultStore>,
    executor: PluginExecutor,
    policies: PolicyRegistry,
    violations: Arc<ViolationLog>,
    event_bus: EventBus,
    maintenance_token: Mutex<Option<CancellationToken>>,
    started: Instant,
}

impl Runtime {
    /// Runtime with in-memory collaborators and the procfs memory probe.
    pub fn new(config: RuntimeConfigSpec) -> Self {
        let sandbox = Sandbox::new(Arc::new(ProcResourceProbe), config.sandbox.poll_interval);
        Self::with_components(config, CollaboratorFactories::default(), sandbox)
    }

    pub fn with_components(
        config: RuntimeConfigSpec,
        factories: CollaboratorFactories,
        sandbox: Sandbox,
    ) -> Self {
        let event_bus = EventBus::new(config.events.bus_capacity);
        let results = Arc::new(ResultStore::new(ResultStoreConfig::from(&config.results)));
        let violations = Arc::new(ViolationLog::default());
        let contexts = Arc::new(ContextRegistry::new(
            RegistryConfig::from(&config.contexts),
            factories,
            event_bus.clone(),
        ));
        let router = EventRouter::new(
            RouterConfig::from(&config.events),
            results.clone(),
            event_bus.clone(),
        );
        let executor = PluginExecutor::new(
            ExecutorConfig::from(&config.sandbox),
            sandbox,
            violations.clone(),
            event_bus.clone(),
        );
        let policies = PolicyRegistry::new(
            config.sandbox.default_level,
            config.sandbox.custom_policies.clone(),
        );

        info!(
            max_contexts = config.contexts.max_contexts,
            default_level = %config.sandbox.default_level,
            "Enclave runtime initialized"
        );

        Self {
            config,
            contexts,
            router,
            results,
            executor,
            policies,
            violations,
            event_bus,
            maintenance_token: Mutex::new(None),
            started: Instant::now(),
        }
    }

    pub fn config(&self) -> &RuntimeConfigSpec {
        &self.config
    }

    pub fn contexts(&self) -> &ContextRegistry {
        &self.contexts
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    pub fn results(&self) -> &ResultStore {
        &self.results
    }

    pub fn executor(&self) -> &PluginExecutor {
        &self.executor
    }

    pub fn policies(&self) -> &PolicyRegistry {
        &self.policies
    }

    pub fn violations(&self) -> &ViolationLog {
        &self.violations
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Context for the given dimensions; empty tenant or agent is a
    /// configuration error.
    pub fn resolve_context(
        &self,
        tenant_id: &str,
        agent_id: &str,
        platform: Option<&str>,
        conversation_id: Option<&str>,
    ) -> Result<Arc<Context>, IsolationError> {
        let scope = Scope::new(
            tenant_id,
            agent_id,
            platform.map(String::from),
            conversation_id.map(String::from),
        )?;
        Ok(self.contexts.resolve(&scope))
    }

    pub fn narrow_context(
        &self,
        parent: &Context,
        overrides: &ScopeOverrides,
    ) -> Result<Arc<Context>, IsolationError> {
        self.contexts.narrow(parent, overrides)
    }

    /// Builds an envelope with the configured retry budget and routes it.
    pub async fn publish_event(
        &self,
        event_type: &str,
        payload: Value,
        scope: Scope,
        priority: Option<EventPriority>,
    ) -> EventId {
        let envelope = self.envelope(event_type, payload, scope, priority);
        self.router.publish(envelope).await.event_id
    }

    /// Envelope carrying the runtime's defaults.
    pub fn envelope(
        &self,
        event_type: &str,
        payload: Value,
        scope: Scope,
        priority: Option<EventPriority>,
    ) -> EventEnvelope {
        EventEnvelope::new(event_type, scope, payload)
            .with_priority(priority.unwrap_or_default())
            .with_max_attempts(self.config.events.default_max_attempts)
    }

    pub async fn publish(&self, envelope: EventEnvelope) -> PublishReceipt {
        self.router.publish(envelope).await
    }

    pub fn subscribe<I, S>(
        &self,
        handler: Arc<dyn EventHandler>,
        event_types: I,
        scope: Scope,
        filters: Vec<EventFilter>,
        priority: i32,
    ) -> HandlerId
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.router.subscribe(handler, event_types, scope, filters, priority)
    }

    pub async fn cancel_handler(&self, handler_id: HandlerId) -> CancelReport {
        self.router.cancel(handler_id).await
    }

    /// Runs `plugin` in `context`, under `policy` or the default tier.
    pub async fn execute_plugin(
        &self,
        plugin: Arc<dyn Plugin>,
        method: &str,
        context: Arc<Context>,
        policy: Option<SandboxPolicy>,
        args: Value,
    ) -> ExecutionResult {
        let policy = policy.unwrap_or_else(|| self.policies.default_policy());
        self.executor.execute(plugin, method, context, policy, args).await
    }

    pub fn get_system_health(&self) -> SystemHealth {
        let contexts = self.contexts.statistics();
        let executor = self.executor.stats();
        let saturated = contexts.total_contexts >= contexts.max_contexts;
        let failing = executor.total_executions > 0 && executor.success_rate < 0.5;

        SystemHealth {
            status: if saturated || failing {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            },
            hostname: hostname::get().ok().and_then(|h| h.into_string().ok()),
            uptime_secs: self.started.elapsed().as_secs(),
            contexts,
            handlers: self.router.handler_count(None),
            running_handler_tasks: self.router.running_tasks(None),
            stored_results: self.results.len(),
            executor,
            violations_last_day: self.violations.stats(1).total_violations,
            event_subscribers: self.event_bus.subscriber_count(),
            checked_at: Utc::now(),
        }
    }

    pub fn get_statistics(&self, scope: &Scope) -> ScopeStatistics {
        let context = self.contexts.lookup(scope);
        ScopeStatistics {
            scope: scope.clone(),
            child_contexts: context.as_ref().map_or(0, |c| c.children().len()),
            context: context.map(|c| c.info()),
            results: self.results.statistics(Some(scope)),
            by_event_type: self.results.aggregate(scope, AggregateBy::EventType, None),
            violations: self
                .violations
                .history(&ViolationFilter {
                    tenant_id: Some(scope.tenant_id().to_string()),
                    ..Default::default()
                })
                .iter()
                .filter(|v| v.scope.is_within(scope))
                .count(),
        }
    }

    pub fn get_violation_stats(&self, days: u32) -> ViolationStats {
        self.violations.stats(days)
    }

    /// Starts the background sweep/purge loop. Calling it again replaces the
    /// previous loop.
    pub fn start_maintenance(&self) -> JoinHandle<()> {
        let maintenance = Arc::new(MaintenanceLoop::new(
            self.contexts.clone(),
            self.results.clone(),
            self.violations.clone(),
            MaintenanceConfig::from(&self.config),
        ));
        if let Some(previous) = self
            .maintenance_token
            .lock()
            .replace(maintenance.shutdown_token())
        {
            previous.cancel();
        }
        maintenance.start()
    }

    /// Stops maintenance, cancels handler tasks and plugin invocations, then
    /// destroys every context.
    pub async fn shutdown(&self) -> ShutdownReport {
        if let Some(token) = self.maintenance_token.lock().take() {
            token.cancel();
        }
        let grace = self.config.events.cancel_grace;
        let handler_tasks = self.router.shutdown(grace).await;
        let plugins_still_running = self.executor.shutdown(grace).await;
        let contexts_destroyed = self.contexts.shutdown();

        info!(
            cancelled = handler_tasks.cancelled,
            forced = handler_tasks.forced,
            plugins_still_running,
            contexts_destroyed,
            "Enclave runtime shut down"
        );
        ShutdownReport {
            handler_tasks,
            plugins_still_running,
            contexts_destroyed,
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfigSpec::default())
    }
}

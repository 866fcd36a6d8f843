// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Plugin Executor
//!
//! Runs one plugin invocation bound to a [`Context`] inside a sandbox session
//! and always yields a structured [`ExecutionResult`].
//!
//! ## Invocation lifecycle
//!
//! ```text
//! PENDING ──access denied──▶ FAILURE
//!    │
//!    ▼
//! RUNNING ──▶ SUCCESS | FAILURE | TIMEOUT | CANCELLED
//! ```
//!
//! | Mode | Runs on | Bounded by |
//! |------|---------|------------|
//! | `Async` | the calling task | wall-time deadline, cancellation token |
//! | `Blocking` | `spawn_blocking` behind a semaphore | same, plus worker permits |
//!
//! The sandbox session is finished on every exit path. A blocking plugin that
//! overruns its deadline is reported as `TIMEOUT` immediately, but its worker
//! permit is only returned once the thread itself returns. Invocations are
//! never retried here.

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::violation_log::ViolationLog;
use crate::domain::context::Context;
use crate::domain::error::IsolationError;
use crate::domain::events::{ExecutionEvent, ViolationEvent};
use crate::domain::plugin::{
    ExecutionMode, ExecutionResult, ExecutionStatus, ExecutorStats, InvocationId, Plugin,
    PluginEnv, PluginError,
};
use crate::domain::runtime_config::SandboxConfig;
use crate::domain::sandbox::SandboxPolicy;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::sandbox::Sandbox;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Concurrent blocking invocations.
    pub worker_threads: usize,
    pub history_limit: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from(&SandboxConfig::default())
    }
}

impl From<&SandboxConfig> for ExecutorConfig {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            worker_threads: config.worker_threads.max(1),
            history_limit: config.history_limit.max(1),
        }
    }
}

struct RunningInvocation {
    cancel: CancellationToken,
    snapshot: ExecutionResult,
}

enum Outcome {
    Completed(Result<Value, PluginError>),
    TimedOut,
    Cancelled,
}

pub struct PluginExecutor {
    sandbox: Sandbox,
    workers: Arc<Semaphore>,
    running: Mutex<HashMap<InvocationId, RunningInvocation>>,
    history: Mutex<VecDeque<ExecutionResult>>,
    stats: Mutex<ExecutorStats>,
    violations: Arc<ViolationLog>,
    event_bus: EventBus,
    config: ExecutorConfig,
    shutdown_token: CancellationToken,
}

impl PluginExecutor {
    pub fn new(
        config: ExecutorConfig,
        sandbox: Sandbox,
        violations: Arc<ViolationLog>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            sandbox,
            workers: Arc::new(Semaphore::new(config.worker_threads)),
            running: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            stats: Mutex::new(ExecutorStats::default()),
            violations,
            event_bus,
            config,
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Free blocking worker permits.
    pub fn available_workers(&self) -> usize {
        self.workers.available_permits()
    }

    /// Runs `plugin` for `context` under `policy`.
    pub async fn execute(
        &self,
        plugin: Arc<dyn Plugin>,
        method: &str,
        context: Arc<Context>,
        policy: SandboxPolicy,
        args: Value,
    ) -> ExecutionResult {
        let invocation_id = InvocationId::new();
        let scope = context.scope().clone();
        let plugin_id = plugin.id().to_string();
        let mut result =
            ExecutionResult::pending(&plugin_id, invocation_id, method, scope.clone(), policy.level);

        let admitted = plugin.access().check(&plugin_id, &scope).and_then(|_| {
            if context.is_live() {
                Ok(())
            } else {
                Err(IsolationError::Configuration(format!(
                    "context for {scope} is no longer live"
                )))
            }
        });
        if let Err(error) = admitted {
            warn!(
                plugin_id = %plugin_id,
                scope = %scope,
                error = %error,
                "Plugin invocation refused"
            );
            self.event_bus.publish_execution_event(ExecutionEvent::Denied {
                invocation_id,
                plugin_id: plugin_id.clone(),
                scope: scope.clone(),
                reason: error.to_string(),
                denied_at: Utc::now(),
            });
            result.error = Some(error.to_string());
            return self.finalize(result, ExecutionStatus::Failure);
        }

        let cancel = self.shutdown_token.child_token();
        self.running.lock().insert(
            invocation_id,
            RunningInvocation {
                cancel: cancel.clone(),
                snapshot: result.clone(),
            },
        );
        let _untrack = scopeguard::guard(invocation_id, |id| {
            self.running.lock().remove(&id);
        });

        let mode = plugin.mode();
        let permit = match mode {
            ExecutionMode::Blocking => match self.acquire_worker(&cancel).await {
                Ok(permit) => Some(permit),
                Err(error) => {
                    result.error = Some(error.to_string());
                    let status = match error {
                        IsolationError::Cancelled(_) => ExecutionStatus::Cancelled,
                        _ => ExecutionStatus::Failure,
                    };
                    return self.finalize(result, status);
                }
            },
            ExecutionMode::Async => None,
        };

        advance(&mut result, ExecutionStatus::Running);
        if let Some(running) = self.running.lock().get_mut(&invocation_id) {
            running.snapshot = result.clone();
        }
        self.event_bus.publish_execution_event(ExecutionEvent::Started {
            invocation_id,
            plugin_id: plugin_id.clone(),
            scope: scope.clone(),
            started_at: Utc::now(),
        });
        debug!(
            invocation_id = %invocation_id,
            plugin_id = %plugin_id,
            method,
            level = %policy.level,
            "Plugin invocation started"
        );

        let max_wall_time = policy.max_wall_time;
        let session = self.sandbox.enter(policy, scope, &plugin_id);
        let env = PluginEnv {
            invocation_id,
            method: method.to_string(),
            context,
            sandbox: Arc::new(session.capabilities()),
            cancel: cancel.clone(),
        };
        let deadline = session.deadline();

        let outcome = match (mode, permit) {
            (ExecutionMode::Blocking, Some(permit)) => {
                run_blocking(plugin, env, args, permit, &cancel, &deadline, max_wall_time).await
            }
            _ => run_async(plugin.as_ref(), &env, args, &cancel, &deadline, max_wall_time).await,
        };

        if !matches!(outcome, Outcome::Completed(_)) {
            // Let cooperative plugin code, notably blocking workers, observe the stop.
            cancel.cancel();
        }
        if matches!(outcome, Outcome::TimedOut) {
            session.record_time_violation();
        }
        let report = session.finish();
        result.resource_usage = report.resource_usage;
        result.violations = report.violations;
        for violation in &result.violations {
            self.violations.record(violation.clone());
            self.event_bus.publish_violation_event(ViolationEvent {
                invocation_id,
                violation: violation.clone(),
            });
        }

        let status = match outcome {
            Outcome::Completed(Ok(value)) => {
                result.result = Some(value);
                ExecutionStatus::Success
            }
            Outcome::Completed(Err(PluginError::Cancelled)) | Outcome::Cancelled => {
                result.error = Some(IsolationError::Cancelled(format!("invocation {invocation_id}")).to_string());
                ExecutionStatus::Cancelled
            }
            Outcome::Completed(Err(error)) => {
                result.error = Some(error.to_string());
                ExecutionStatus::Failure
            }
            Outcome::TimedOut => {
                result.error = Some(
                    IsolationError::Timeout(format!(
                        "plugin '{plugin_id}' exceeded wall time of {max_wall_time:?}"
                    ))
                    .to_string(),
                );
                ExecutionStatus::Timeout
            }
        };
        self.finalize(result, status)
    }

    /// Trips the cancellation token of a running invocation.
    pub fn cancel_execution(&self, invocation_id: InvocationId) -> bool {
        match self.running.lock().get(&invocation_id) {
            Some(running) => {
                info!(invocation_id = %invocation_id, "Cancelling plugin invocation");
                running.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Running snapshot or finished result.
    pub fn get_execution(&self, invocation_id: InvocationId) -> Option<ExecutionResult> {
        if let Some(running) = self.running.lock().get(&invocation_id) {
            return Some(running.snapshot.clone());
        }
        self.history
            .lock()
            .iter()
            .rev()
            .find(|r| r.invocation_id == invocation_id)
            .cloned()
    }

    pub fn running_invocations(&self) -> Vec<InvocationId> {
        self.running.lock().keys().copied().collect()
    }

    /// Finished results, newest first.
    pub fn execution_history(
        &self,
        limit: usize,
        status: Option<ExecutionStatus>,
    ) -> Vec<ExecutionResult> {
        self.history
            .lock()
            .iter()
            .rev()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Forgets results that finished more than `older_than` ago.
    pub fn clear_history(&self, older_than: ChronoDuration) -> usize {
        let cutoff = Utc::now() - older_than;
        let mut history = self.history.lock();
        let before = history.len();
        history.retain(|r| r.finished_at.map_or(true, |at| at >= cutoff));
        before - history.len()
    }

    pub fn stats(&self) -> ExecutorStats {
        let mut stats = self.stats.lock().clone();
        stats.running = self.running.lock().len();
        stats
    }

    /// Cancels every running invocation and waits up to `grace` for them to
    /// drain. Returns how many were still running afterwards.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.shutdown_token.cancel();
        self.workers.close();

        let deadline = Instant::now() + grace;
        loop {
            let remaining = self.running.lock().len();
            if remaining == 0 || Instant::now() >= deadline {
                info!(remaining, "Plugin executor shut down");
                return remaining;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn acquire_worker(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, IsolationError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(IsolationError::Cancelled(
                "cancelled while waiting for a worker".to_string(),
            )),
            permit = self.workers.clone().acquire_owned() => permit.map_err(|_| {
                IsolationError::Configuration("plugin worker pool is closed".to_string())
            }),
        }
    }

    fn finalize(&self, mut result: ExecutionResult, status: ExecutionStatus) -> ExecutionResult {
        advance(&mut result, status);

        {
            let mut stats = self.stats.lock();
            stats.total_executions += 1;
            match status {
                ExecutionStatus::Success => stats.successful_executions += 1,
                ExecutionStatus::Timeout => stats.timeout_executions += 1,
                ExecutionStatus::Cancelled => stats.cancelled_executions += 1,
                _ => stats.failed_executions += 1,
            }
            stats.total_execution_ms += result.execution_ms;
            stats.success_rate = stats.successful_executions as f64 / stats.total_executions as f64;
            stats.average_execution_ms =
                stats.total_execution_ms as f64 / stats.total_executions as f64;
        }
        {
            let mut history = self.history.lock();
            history.push_back(result.clone());
            while history.len() > self.config.history_limit {
                history.pop_front();
            }
        }

        metrics::counter!("enclave_plugin_executions_total", "status" => status.as_str()).increment(1);
        metrics::histogram!("enclave_plugin_execution_seconds")
            .record(result.execution_ms as f64 / 1000.0);
        self.event_bus.publish_execution_event(ExecutionEvent::Finished {
            invocation_id: result.invocation_id,
            plugin_id: result.plugin_id.clone(),
            status,
            execution_ms: result.execution_ms,
            finished_at: Utc::now(),
        });
        info!(
            invocation_id = %result.invocation_id,
            plugin_id = %result.plugin_id,
            scope = %result.scope,
            status = %status,
            execution_ms = result.execution_ms,
            violations = result.violations.len(),
            "Plugin invocation finished"
        );
        result
    }
}

fn advance(result: &mut ExecutionResult, next: ExecutionStatus) {
    if let Err(error) = result.transition(next) {
        warn!(invocation_id = %result.invocation_id, error = %error, "Ignoring invalid status change");
    }
}

async fn run_async(
    plugin: &dyn Plugin,
    env: &PluginEnv,
    args: Value,
    cancel: &CancellationToken,
    deadline: &CancellationToken,
    max_wall_time: Duration,
) -> Outcome {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Outcome::Cancelled,
        _ = deadline.cancelled() => Outcome::TimedOut,
        finished = tokio::time::timeout(max_wall_time, plugin.execute(env, args)) => match finished {
            Ok(result) => Outcome::Completed(result),
            Err(_) => Outcome::TimedOut,
        },
    }
}

async fn run_blocking(
    plugin: Arc<dyn Plugin>,
    env: PluginEnv,
    args: Value,
    permit: OwnedSemaphorePermit,
    cancel: &CancellationToken,
    deadline: &CancellationToken,
    max_wall_time: Duration,
) -> Outcome {
    let worker = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        plugin.execute_blocking(&env, args)
    });
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Outcome::Cancelled,
        _ = deadline.cancelled() => Outcome::TimedOut,
        finished = tokio::time::timeout(max_wall_time, worker) => match finished {
            Ok(Ok(result)) => Outcome::Completed(result),
            Ok(Err(join_error)) => Outcome::Completed(Err(PluginError::failed(format!(
                "plugin worker panicked: {join_error}"
            )))),
            Err(_) => Outcome::TimedOut,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::context_registry::{ContextRegistry, RegistryConfig};
    use crate::domain::plugin::PluginAccess;
    use crate::domain::sandbox::{SandboxAccess, SecurityLevel};
    use crate::domain::scope::Scope;
    use crate::infrastructure::collaborators::in_memory_factories;
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Plugin for Echo {
        fn id(&self) -> &str {
            "echo"
        }

        fn access(&self) -> PluginAccess {
            PluginAccess::default().deny_tenant("blocked")
        }

        async fn execute(&self, _env: &PluginEnv, args: Value) -> Result<Value, PluginError> {
            Ok(args)
        }
    }

    struct Importer;

    #[async_trait]
    impl Plugin for Importer {
        fn id(&self) -> &str {
            "importer"
        }

        async fn execute(&self, env: &PluginEnv, _args: Value) -> Result<Value, PluginError> {
            let denied = env.sandbox.require_module("subprocess").is_err();
            env.sandbox.require_module("json")?;
            Ok(json!({ "subprocess_denied": denied }))
        }
    }

    /// Steady memory, no CPU or thread readings.
    struct QuietProbe;

    impl crate::infrastructure::sandbox::ResourceProbe for QuietProbe {
        fn resident_bytes(&self) -> Option<u64> {
            Some(0)
        }
    }

    fn executor() -> (PluginExecutor, ContextRegistry) {
        let executor = PluginExecutor::new(
            ExecutorConfig {
                worker_threads: 2,
                history_limit: 10,
            },
            Sandbox::new(Arc::new(QuietProbe), Duration::from_millis(10)),
            Arc::new(ViolationLog::default()),
            EventBus::new(64),
        );
        let registry = ContextRegistry::new(RegistryConfig::default(), in_memory_factories(), EventBus::new(64));
        (executor, registry)
    }

    #[tokio::test]
    async fn test_success_roundtrip_and_history() {
        let (executor, registry) = executor();
        let context = registry.resolve(&Scope::agent("t1", "a1").unwrap());
        let result = executor
            .execute(Arc::new(Echo), "run", context, SandboxPolicy::default(), json!({"x": 1}))
            .await;
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.result, Some(json!({"x": 1})));
        assert!(result.started_at.is_some());
        assert_eq!(executor.execution_history(10, None).len(), 1);
        assert_eq!(executor.get_execution(result.invocation_id).unwrap().status, ExecutionStatus::Success);
        assert_eq!(executor.stats().successful_executions, 1);
        assert!(executor.running_invocations().is_empty());
    }

    #[tokio::test]
    async fn test_denied_plugin_never_starts() {
        let (executor, registry) = executor();
        let context = registry.resolve(&Scope::agent("blocked", "a1").unwrap());
        let result = executor
            .execute(Arc::new(Echo), "run", context, SandboxPolicy::default(), json!({}))
            .await;
        assert_eq!(result.status, ExecutionStatus::Failure);
        assert!(result.started_at.is_none());
        assert!(result.error.unwrap().contains("Permission denied"));
    }

    #[tokio::test]
    async fn test_module_denial_is_catchable_and_recorded() {
        let (executor, registry) = executor();
        let context = registry.resolve(&Scope::agent("t1", "a1").unwrap());
        let result = executor
            .execute(
                Arc::new(Importer),
                "run",
                context,
                SandboxPolicy::preset(SecurityLevel::High),
                json!({}),
            )
            .await;
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.result, Some(json!({"subprocess_denied": true})));
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].plugin_id, "importer");
    }

    #[tokio::test]
    async fn test_clear_history() {
        let (executor, registry) = executor();
        let context = registry.resolve(&Scope::agent("t1", "a1").unwrap());
        executor
            .execute(Arc::new(Echo), "run", context, SandboxPolicy::default(), json!({}))
            .await;
        assert_eq!(executor.clear_history(ChronoDuration::hours(1)), 0);
        assert_eq!(executor.clear_history(ChronoDuration::zero() - ChronoDuration::seconds(1)), 1);
    }
}

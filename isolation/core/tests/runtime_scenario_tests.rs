// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! End-to-end runtime scenarios: health, per-scope statistics, maintenance
//! and shutdown.

use async_trait::async_trait;
use enclave_core::application::runtime::HealthStatus;
use enclave_core::domain::event::EventEnvelope;
use enclave_core::domain::handler::{EventHandler, HandlerError, HandlerOutcome};
use enclave_core::domain::plugin::{ExecutionStatus, Plugin, PluginEnv, PluginError};
use enclave_core::domain::runtime_config::{RuntimeConfigManifest, RuntimeConfigSpec};
use enclave_core::domain::sandbox::SecurityLevel;
use enclave_core::domain::scope::{Scope, ScopeOverrides};
use enclave_core::Runtime;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

struct Answer {
    intercepting: bool,
    started: Arc<Notify>,
}

#[async_trait]
impl EventHandler for Answer {
    fn name(&self) -> &str {
        "answer"
    }

    fn intercepts(&self) -> bool {
        self.intercepting
    }

    async fn handle(
        &self,
        _event: &EventEnvelope,
        cancel: &CancellationToken,
    ) -> Result<HandlerOutcome, HandlerError> {
        self.started.notify_one();
        if self.intercepting {
            return Ok(HandlerOutcome::proceed().with_result(json!(42)));
        }
        cancel.cancelled().await;
        Err(HandlerError::Cancelled)
    }
}

struct Broken;

#[async_trait]
impl Plugin for Broken {
    fn id(&self) -> &str {
        "broken"
    }

    async fn execute(&self, _env: &PluginEnv, _args: Value) -> Result<Value, PluginError> {
        Err(PluginError::failed("always broken"))
    }
}

fn answer(intercepting: bool) -> (Arc<Answer>, Arc<Notify>) {
    let started = Arc::new(Notify::new());
    (
        Arc::new(Answer {
            intercepting,
            started: started.clone(),
        }),
        started,
    )
}

#[tokio::test]
async fn test_health_is_healthy_then_degraded_at_capacity() {
    let mut spec = RuntimeConfigSpec::default();
    spec.contexts.max_contexts = 2;
    let runtime = Runtime::new(spec);

    let health = runtime.get_system_health();
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.contexts.total_contexts, 0);

    runtime.resolve_context("t1", "a1", None, None).unwrap();
    runtime.resolve_context("t2", "a1", None, None).unwrap();
    let health = runtime.get_system_health();
    assert_eq!(health.status, HealthStatus::Degraded);
    assert_eq!(health.contexts.max_contexts, 2);
}

#[tokio::test]
async fn test_health_degrades_when_plugins_keep_failing() {
    let runtime = Runtime::default();
    let context = runtime.resolve_context("t1", "a1", None, None).unwrap();
    let result = runtime
        .execute_plugin(Arc::new(Broken), "run", context, None, json!({}))
        .await;
    assert_eq!(result.status, ExecutionStatus::Failure);

    let health = runtime.get_system_health();
    assert_eq!(health.executor.failed_executions, 1);
    assert_eq!(health.status, HealthStatus::Degraded);
}

#[tokio::test]
async fn test_statistics_cover_the_scope_lineage() {
    let runtime = Runtime::default();
    let agent = Scope::agent("t1", "a1").unwrap();
    let conversation = agent.clone().with_platform("qq").with_conversation("c1");
    let (handler, _) = answer(true);
    runtime.subscribe(handler, ["message"], agent.clone(), vec![], 0);

    let parent = runtime.resolve_context("t1", "a1", None, None).unwrap();
    let child = runtime
        .narrow_context(&parent, &ScopeOverrides::platform("qq"))
        .unwrap();
    runtime.publish_event("message", json!({}), conversation.clone(), None).await;
    runtime.publish_event("message", json!({}), agent.clone(), None).await;
    runtime
        .publish_event("message", json!({}), Scope::agent("t2", "a1").unwrap(), None)
        .await;

    let stats = runtime.get_statistics(&agent);
    assert_eq!(stats.results.total_results, 2);
    assert_eq!(stats.results.by_status.get("success"), Some(&2));
    assert_eq!(stats.by_event_type["message"].total, 2);
    assert!(stats.by_event_type["message"].handlers.contains("answer"));
    assert_eq!(stats.child_contexts, 1);
    assert_eq!(stats.context.map(|c| c.handle), Some(parent.handle()));

    let narrow = runtime.get_statistics(child.scope());
    assert_eq!(narrow.results.total_results, 1);
    assert_eq!(narrow.child_contexts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_maintenance_reclaims_idle_contexts() {
    let mut spec = RuntimeConfigSpec::default();
    spec.contexts.ttl = Duration::from_secs(2);
    spec.contexts.sweep_interval = Duration::from_secs(1);
    let runtime = Runtime::new(spec);

    let first = runtime.resolve_context("t1", "a1", None, None).unwrap();
    let maintenance = runtime.start_maintenance();
    tokio::time::sleep(Duration::from_secs(4)).await;

    assert_eq!(runtime.contexts().len(), 0);
    assert!(!first.is_live());

    runtime.shutdown().await;
    maintenance.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_cancels_background_work_and_destroys_contexts() {
    let runtime = Runtime::default();
    let scope = Scope::agent("t1", "a1").unwrap();
    let (handler, started) = answer(false);
    runtime.subscribe(handler, ["message"], scope.clone(), vec![], 0);
    runtime.resolve_context("t1", "a1", None, None).unwrap();
    runtime.resolve_context("t1", "a1", Some("qq"), None).unwrap();

    runtime.publish_event("message", json!({}), scope, None).await;
    started.notified().await;

    let report = runtime.shutdown().await;
    assert_eq!(report.handler_tasks.cancelled, 1);
    assert_eq!(report.handler_tasks.forced, 0);
    assert_eq!(report.plugins_still_running, 0);
    assert_eq!(report.contexts_destroyed, 2);
    assert!(runtime.contexts().is_empty());
}

#[tokio::test]
async fn test_runtime_from_yaml_manifest_exposes_custom_policy() {
    let yaml = r#"
apiVersion: enclave.dev/v1
kind: RuntimeConfig
metadata:
  name: scenario
spec:
  sandbox:
    default_level: high
    custom_policies:
      tight:
        level: maximum
        max_memory_mb: 32
        max_cpu_time: 1s
        max_wall_time: 2s
"#;
    let manifest = RuntimeConfigManifest::from_yaml_str(yaml).unwrap();
    let runtime = Runtime::new(manifest.spec);

    assert_eq!(runtime.policies().default_level(), SecurityLevel::High);
    let tight = runtime
        .policies()
        .get(SecurityLevel::Low, Some("tight"))
        .unwrap();
    assert_eq!(tight.max_memory_mb, 32);
    assert_eq!(tight.max_wall_time, Duration::from_secs(2));
    assert!(runtime.policies().get(SecurityLevel::Low, Some("missing")).is_err());
}

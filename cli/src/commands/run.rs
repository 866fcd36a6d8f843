// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Demo runtime
//!
//! Boots a [`Runtime`] from the effective configuration, registers a handful
//! of demo handlers and plugins, drives a short multi-tenant scenario and
//! prints health and per-scope statistics as JSON before shutting down.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use enclave_core::application::runtime::{ScopeStatistics, ShutdownReport, SystemHealth};
use enclave_core::domain::event::{event_types, EventEnvelope};
use enclave_core::domain::handler::{EventHandler, HandlerError, HandlerOutcome};
use enclave_core::domain::plugin::{ExecutionResult, Plugin, PluginEnv, PluginError};
use enclave_core::domain::runtime_config::RuntimeConfigManifest;
use enclave_core::domain::sandbox::{SandboxPolicy, SecurityLevel};
use enclave_core::domain::scope::Scope;
use enclave_core::domain::violation::ViolationStats;
use enclave_core::Runtime;

const MESSAGE: &str = "message";
const BLOCKED_PHRASES: &[&str] = &["rm -rf", "drop table"];

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[arg(long, default_value = "tenant-a")]
    pub tenant: String,

    #[arg(long, default_value = "assistant")]
    pub agent: String,

    #[arg(long, default_value = "qq")]
    pub platform: String,

    #[arg(long, default_value = "c1")]
    pub conversation: String,

    /// Ordinary messages published to the conversation
    #[arg(long, default_value_t = 3)]
    pub messages: usize,
}

/// What the demo observed, printed as JSON.
#[derive(Debug, Serialize)]
pub struct ScenarioReport {
    pub delivered_messages: usize,
    pub blocked_messages: usize,
    pub transcript_entries: usize,
    pub sibling_transcript_entries: usize,
    pub cross_tenant_alerts: usize,
    pub plugin_runs: Vec<ExecutionResult>,
    pub health: SystemHealth,
    pub conversation: ScopeStatistics,
    pub violations: ViolationStats,
    pub shutdown: Option<ShutdownReport>,
}

pub async fn execute(args: RunArgs, config_override: Option<PathBuf>) -> Result<()> {
    let manifest = RuntimeConfigManifest::load_or_default(config_override)
        .context("Failed to load configuration")?;
    manifest
        .validate()
        .context("Configuration validation failed")?;

    if let Some(port) = manifest.spec.observability.metrics_port {
        install_metrics_exporter(port)?;
    }

    let runtime = Runtime::new(manifest.spec);
    let maintenance = runtime.start_maintenance();

    let mut report = drive(&runtime, &args).await?;
    report.shutdown = Some(runtime.shutdown().await);
    maintenance.await.context("Maintenance task failed")?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    eprintln!("{}", "✓ Demo runtime shut down cleanly".green());
    Ok(())
}

fn install_metrics_exporter(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("Failed to install Prometheus exporter on {}", addr))?;
    info!(%addr, "Prometheus exporter listening");
    Ok(())
}

/// Runs the scenario against `runtime` without shutting it down.
pub async fn drive(runtime: &Runtime, args: &RunArgs) -> Result<ScenarioReport> {
    let conversation = Scope::new(
        args.tenant.as_str(),
        args.agent.as_str(),
        Some(args.platform.clone()),
        Some(args.conversation.clone()),
    )
    .context("Invalid demo scope")?;
    let sibling = Scope::new(
        args.tenant.as_str(),
        args.agent.as_str(),
        Some(args.platform.clone()),
        Some(format!("{}-sibling", args.conversation)),
    )?;
    let peer_tenant = Scope::agent(format!("{}-peer", args.tenant), args.agent.as_str())?;

    let transcript = Arc::new(AtomicUsize::new(0));
    let sibling_transcript = Arc::new(AtomicUsize::new(0));
    let alerts = Arc::new(AtomicUsize::new(0));

    let message_priority = event_types::default_priority(MESSAGE);
    runtime.subscribe(
        Arc::new(Moderator),
        [MESSAGE],
        conversation.clone(),
        vec![],
        message_priority + 10,
    );
    runtime.subscribe(
        Arc::new(Counter::new("transcript", &transcript)),
        [MESSAGE],
        conversation.clone(),
        vec![],
        message_priority,
    );
    runtime.subscribe(
        Arc::new(Counter::new("sibling-transcript", &sibling_transcript)),
        [MESSAGE],
        sibling.clone(),
        vec![],
        message_priority,
    );
    runtime.subscribe(
        Arc::new(Counter::new("security-auditor", &alerts)),
        [event_types::ON_SECURITY_ALERT],
        peer_tenant,
        vec![],
        event_types::default_priority(event_types::ON_SECURITY_ALERT),
    );

    let context = runtime.resolve_context(
        &args.tenant,
        &args.agent,
        Some(args.platform.as_str()),
        Some(args.conversation.as_str()),
    )?;

    let mut delivered = 0;
    let mut blocked = 0;
    let mut texts: Vec<String> = (0..args.messages).map(|i| format!("hello #{i}")).collect();
    texts.push("please run rm -rf /".to_string());
    for text in texts {
        let receipt = runtime
            .publish(runtime.envelope(MESSAGE, json!({ "text": text }), conversation.clone(), None))
            .await;
        let outcome = if receipt.continued {
            delivered += 1;
            "delivered"
        } else {
            blocked += 1;
            "blocked"
        };
        metrics::counter!("enclave_demo_messages_total", "outcome" => outcome).increment(1);
    }
    runtime
        .publish_event(
            event_types::ON_SECURITY_ALERT,
            json!({ "reason": "blocked phrase" }),
            conversation.clone(),
            None,
        )
        .await;

    wait_for_background_deliveries(runtime).await;
    metrics::gauge!("enclave_demo_background_tasks").set(runtime.router().running_tasks(None) as f64);

    let plugin_runs = vec![
        runtime
            .execute_plugin(Arc::new(Greeter), "greet", context.clone(), None, json!({}))
            .await,
        runtime
            .execute_plugin(
                Arc::new(NetworkProbe),
                "probe",
                context,
                Some(SandboxPolicy::preset(SecurityLevel::High)),
                json!({ "host": "example.com" }),
            )
            .await,
    ];

    Ok(ScenarioReport {
        delivered_messages: delivered,
        blocked_messages: blocked,
        transcript_entries: transcript.load(Ordering::SeqCst),
        sibling_transcript_entries: sibling_transcript.load(Ordering::SeqCst),
        cross_tenant_alerts: alerts.load(Ordering::SeqCst),
        plugin_runs,
        health: runtime.get_system_health(),
        conversation: runtime.get_statistics(&conversation),
        violations: runtime.get_violation_stats(1),
        shutdown: None,
    })
}

async fn wait_for_background_deliveries(runtime: &Runtime) {
    if !runtime.router().settle(Duration::from_secs(1)).await {
        warn!(
            running = runtime.router().running_tasks(None),
            "Background deliveries still running"
        );
    }
}

/// Halts messages carrying a blocked phrase and tags the rest.
struct Moderator;

#[async_trait]
impl EventHandler for Moderator {
    fn name(&self) -> &str {
        "moderator"
    }

    fn intercepts(&self) -> bool {
        true
    }

    async fn handle(
        &self,
        event: &EventEnvelope,
        _cancel: &CancellationToken,
    ) -> Result<HandlerOutcome, HandlerError> {
        let text = event.payload["text"].as_str().unwrap_or_default().to_lowercase();
        if let Some(phrase) = BLOCKED_PHRASES.iter().find(|p| text.contains(*p)) {
            return Ok(HandlerOutcome::halt(format!("blocked phrase '{phrase}'")));
        }
        let mut payload = event.payload.clone();
        payload["moderated"] = Value::Bool(true);
        Ok(HandlerOutcome::rewrite(payload))
    }
}

struct Counter {
    name: String,
    count: Arc<AtomicUsize>,
}

impl Counter {
    fn new(name: &str, count: &Arc<AtomicUsize>) -> Self {
        Self {
            name: name.to_string(),
            count: count.clone(),
        }
    }
}

#[async_trait]
impl EventHandler for Counter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(
        &self,
        _event: &EventEnvelope,
        _cancel: &CancellationToken,
    ) -> Result<HandlerOutcome, HandlerError> {
        let seen = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(HandlerOutcome::proceed().with_result(json!({ "seen": seen })))
    }
}

/// Counts greetings in the conversation's memory.
struct Greeter;

#[async_trait]
impl Plugin for Greeter {
    fn id(&self) -> &str {
        "greeter"
    }

    async fn execute(&self, env: &PluginEnv, _args: Value) -> Result<Value, PluginError> {
        let memory = env
            .context
            .memory()
            .map_err(|e| PluginError::failed(e.to_string()))?;
        let greetings = memory
            .recall("greetings")
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
            + 1;
        memory.remember("greetings", json!(greetings));
        Ok(json!({ "greeting": format!("hello {}", env.scope()), "greetings": greetings }))
    }
}

/// Tries to reach the network; refused under the stricter tiers.
struct NetworkProbe;

#[async_trait]
impl Plugin for NetworkProbe {
    fn id(&self) -> &str {
        "network-probe"
    }

    async fn execute(&self, env: &PluginEnv, args: Value) -> Result<Value, PluginError> {
        env.sandbox.require_module("socket")?;
        let host = args["host"].as_str().unwrap_or("localhost");
        env.sandbox.connect(host)?;
        Ok(json!({ "reached": host }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> RunArgs {
        RunArgs {
            tenant: "tenant-a".to_string(),
            agent: "assistant".to_string(),
            platform: "qq".to_string(),
            conversation: "c1".to_string(),
            messages: 2,
        }
    }

    #[tokio::test]
    async fn test_demo_scenario_keeps_scopes_apart() {
        let runtime = Runtime::default();
        let report = drive(&runtime, &args()).await.unwrap();

        assert_eq!(report.delivered_messages, 2);
        assert_eq!(report.blocked_messages, 1);
        assert_eq!(report.transcript_entries, 2);
        assert_eq!(report.sibling_transcript_entries, 0);
        assert_eq!(report.cross_tenant_alerts, 1);
        assert!(report.plugin_runs[0].is_success());
        assert!(!report.plugin_runs[1].is_success());
        assert_eq!(report.violations.by_kind.get("network"), Some(&1));
        assert!(report.violations.by_plugin.contains_key("network-probe"));

        let shutdown = runtime.shutdown().await;
        assert_eq!(shutdown.contexts_destroyed, 1);
    }

    #[test]
    fn test_demo_counts_message_outcomes() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap()
                .block_on(async {
                    let runtime = Runtime::default();
                    drive(&runtime, &args()).await.unwrap();
                    runtime.shutdown().await;
                })
        });

        let rendered = handle.render();
        assert!(rendered.contains(r#"enclave_demo_messages_total{outcome="delivered"} 2"#));
        assert!(rendered.contains(r#"enclave_demo_messages_total{outcome="blocked"} 1"#));
    }
}

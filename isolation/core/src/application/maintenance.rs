// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Maintenance Loop - Background reclamation of idle runtime state
//!
//! Periodically sweeps expired contexts from the registry, purges results past
//! their retention window and drops old violations.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Keep long-running runtimes bounded without callers having
//!   to invoke `sweep`/`purge` themselves

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::application::context_registry::ContextRegistry;
use crate::application::result_store::ResultStore;
use crate::application::violation_log::ViolationLog;
use crate::domain::runtime_config::RuntimeConfigSpec;

/// Configuration for the maintenance loop
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// How often expired contexts are swept
    pub sweep_interval: Duration,

    /// How often results and violations are purged
    pub purge_interval: Duration,

    /// Violations older than this many days are dropped
    pub violation_retention_days: u32,

    pub enabled: bool,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self::from(&RuntimeConfigSpec::default())
    }
}

impl From<&RuntimeConfigSpec> for MaintenanceConfig {
    fn from(spec: &RuntimeConfigSpec) -> Self {
        Self {
            sweep_interval: spec.contexts.sweep_interval,
            purge_interval: spec.results.purge_interval,
            violation_retention_days: spec.sandbox.violation_retention_days,
            enabled: true,
        }
    }
}

/// What one purge cycle removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub results_purged: usize,
    pub violations_removed: usize,
}

/// Background reclamation task
pub struct MaintenanceLoop {
    contexts: Arc<ContextRegistry>,
    results: Arc<ResultStore>,
    violations: Arc<ViolationLog>,
    config: MaintenanceConfig,
    shutdown_token: CancellationToken,
}

impl MaintenanceLoop {
    pub fn new(
        contexts: Arc<ContextRegistry>,
        results: Arc<ResultStore>,
        violations: Arc<ViolationLog>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            contexts,
            results,
            violations,
            config,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Get a handle to trigger shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Start the loop as a background task
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        if !self.config.enabled {
            info!("Maintenance loop is disabled");
            return;
        }

        info!(
            sweep_interval_ms = self.config.sweep_interval.as_millis() as u64,
            purge_interval_ms = self.config.purge_interval.as_millis() as u64,
            violation_retention_days = self.config.violation_retention_days,
            "Starting maintenance background task"
        );

        let mut sweep_tick = interval(self.config.sweep_interval.max(Duration::from_millis(1)));
        let mut purge_tick = interval(self.config.purge_interval.max(Duration::from_millis(1)));
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        purge_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = sweep_tick.tick() => {
                    let swept = self.sweep_cycle();
                    debug!(swept, "Context sweep cycle completed");
                }
                _ = purge_tick.tick() => {
                    let report = self.purge_cycle();
                    debug!(
                        results_purged = report.results_purged,
                        violations_removed = report.violations_removed,
                        "Purge cycle completed"
                    );
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received, stopping maintenance loop");
                    break;
                }
            }
        }

        info!("Maintenance background task stopped");
    }

    /// Removes expired and invalidated contexts.
    pub fn sweep_cycle(&self) -> usize {
        self.contexts.sweep()
    }

    /// Drops results past retention and violations past their window.
    pub fn purge_cycle(&self) -> PurgeReport {
        PurgeReport {
            results_purged: self.results.purge_expired(Utc::now()),
            violations_removed: self.violations.cleanup(self.config.violation_retention_days),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::context_registry::RegistryConfig;
    use crate::application::result_store::ResultStoreConfig;
    use crate::domain::scope::Scope;
    use crate::infrastructure::collaborators::in_memory_factories;
    use crate::infrastructure::event_bus::EventBus;

    fn maintenance(ttl: Duration) -> (Arc<MaintenanceLoop>, Arc<ContextRegistry>) {
        let contexts = Arc::new(ContextRegistry::new(
            RegistryConfig {
                max_contexts: 10,
                default_ttl: ttl,
            },
            in_memory_factories(),
            EventBus::new(16),
        ));
        let maintenance = Arc::new(MaintenanceLoop::new(
            contexts.clone(),
            Arc::new(ResultStore::new(ResultStoreConfig::default())),
            Arc::new(ViolationLog::default()),
            MaintenanceConfig {
                sweep_interval: Duration::from_secs(1),
                purge_interval: Duration::from_secs(60),
                violation_retention_days: 30,
                enabled: true,
            },
        ));
        (maintenance, contexts)
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_reclaims_idle_contexts() {
        let (maintenance, contexts) = maintenance(Duration::from_secs(5));
        contexts.resolve(&Scope::agent("t1", "a1").unwrap());

        let token = maintenance.shutdown_token();
        let handle = maintenance.clone().start();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(contexts.len(), 1);
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(contexts.len(), 0);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_purge_cycle_on_empty_state() {
        let (maintenance, _) = maintenance(Duration::from_secs(5));
        assert_eq!(maintenance.purge_cycle(), PurgeReport::default());
    }
}

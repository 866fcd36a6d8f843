// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Violation Log
//!
//! Runtime-wide history of sandbox violations, newest last.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Filtered history, windowed statistics and age-based cleanup
//!   of every violation recorded by plugin executions

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use std::collections::VecDeque;

use crate::domain::violation::{Violation, ViolationFilter, ViolationStats};

pub struct ViolationLog {
    entries: RwLock<VecDeque<Violation>>,
    capacity: usize,
}

impl ViolationLog {
    /// `capacity` bounds memory; the oldest entries are dropped first.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, violation: Violation) {
        let mut entries = self.entries.write();
        entries.push_back(violation);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    pub fn extend<I: IntoIterator<Item = Violation>>(&self, violations: I) {
        for violation in violations {
            self.record(violation);
        }
    }

    /// Matching violations, newest first.
    pub fn history(&self, filter: &ViolationFilter) -> Vec<Violation> {
        self.entries
            .read()
            .iter()
            .rev()
            .filter(|v| filter.matches(v))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Counts over the trailing `days`.
    pub fn stats(&self, days: u32) -> ViolationStats {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(days));
        let mut stats = ViolationStats {
            time_range_days: days,
            ..Default::default()
        };
        for violation in self.entries.read().iter().filter(|v| v.timestamp >= cutoff) {
            stats.total_violations += 1;
            *stats
                .by_kind
                .entry(violation.kind.as_str().to_string())
                .or_default() += 1;
            *stats.by_plugin.entry(violation.plugin_id.clone()).or_default() += 1;
            *stats
                .by_tenant
                .entry(violation.scope.tenant_id().to_string())
                .or_default() += 1;
        }
        stats
    }

    /// Drops violations older than `days`; returns how many were removed.
    pub fn cleanup(&self, days: u32) -> usize {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(days));
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|v| v.timestamp >= cutoff);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ViolationLog {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::scope::Scope;
    use crate::domain::violation::ViolationKind;

    fn violation(tenant: &str, plugin: &str, kind: ViolationKind) -> Violation {
        Violation::new(kind, "test", Scope::agent(tenant, "a1").unwrap(), plugin)
    }

    #[test]
    fn test_history_filters_and_orders_newest_first() {
        let log = ViolationLog::default();
        log.record(violation("t1", "p1", ViolationKind::Memory));
        log.record(violation("t2", "p1", ViolationKind::Module));
        log.record(violation("t1", "p2", ViolationKind::Time));

        let t1 = log.history(&ViolationFilter {
            tenant_id: Some("t1".into()),
            ..Default::default()
        });
        assert_eq!(t1.len(), 2);
        assert_eq!(t1[0].kind, ViolationKind::Time);

        let limited = log.history(&ViolationFilter {
            limit: Some(1),
            ..Default::default()
        });
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_stats_and_cleanup() {
        let log = ViolationLog::default();
        log.record(violation("t1", "p1", ViolationKind::Memory));
        let mut old = violation("t1", "p1", ViolationKind::Module);
        old.timestamp = Utc::now() - ChronoDuration::days(40);
        log.record(old);

        let stats = log.stats(7);
        assert_eq!(stats.total_violations, 1);
        assert_eq!(stats.by_kind.get("memory"), Some(&1));
        assert_eq!(stats.time_range_days, 7);

        assert_eq!(log.cleanup(30), 1);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let log = ViolationLog::new(2);
        log.record(violation("t1", "first", ViolationKind::File));
        log.record(violation("t1", "second", ViolationKind::File));
        log.record(violation("t1", "third", ViolationKind::File));
        let all = log.history(&ViolationFilter::default());
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].plugin_id, "second");
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Result Store
//!
//! Bounded in-memory record of handler delivery outcomes, queryable by scope.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Store, query and aggregate `EventResult`s without letting one
//!   scope read another scope's records
//! - **Storage:** global insertion order (`VecDeque`) plus per-scope deques of
//!   ids; eviction of the oldest record is amortized O(1)

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tracing::debug;

use crate::domain::result::{
    AggregateBy, AggregateStats, EventResult, ResultId, ResultQuery, ResultStoreStatistics,
    TimeRange,
};
use crate::domain::runtime_config::ResultsConfig;
use crate::domain::scope::Scope;

#[derive(Debug, Clone)]
pub struct ResultStoreConfig {
    pub max_size: usize,
    pub retention: Duration,
    pub purge_interval: Duration,
}

impl Default for ResultStoreConfig {
    fn default() -> Self {
        Self::from(&ResultsConfig::default())
    }
}

impl From<&ResultsConfig> for ResultStoreConfig {
    fn from(config: &ResultsConfig) -> Self {
        Self {
            max_size: config.max_size.max(1),
            retention: config.retention,
            purge_interval: config.purge_interval,
        }
    }
}

struct StoreInner {
    order: VecDeque<ResultId>,
    by_id: HashMap<ResultId, EventResult>,
    by_scope: HashMap<Scope, VecDeque<ResultId>>,
    last_purge: DateTime<Utc>,
}

impl StoreInner {
    fn remove(&mut self, id: &ResultId) -> Option<EventResult> {
        let result = self.by_id.remove(id)?;
        if let Some(ids) = self.by_scope.get_mut(&result.scope) {
            ids.retain(|i| i != id);
            if ids.is_empty() {
                self.by_scope.remove(&result.scope);
            }
        }
        Some(result)
    }

    /// Drops the oldest record.
    fn evict_oldest(&mut self) -> bool {
        while let Some(id) = self.order.pop_front() {
            if let Some(result) = self.by_id.remove(&id) {
                if let Some(ids) = self.by_scope.get_mut(&result.scope) {
                    if ids.front() == Some(&id) {
                        ids.pop_front();
                    } else {
                        ids.retain(|i| *i != id);
                    }
                    if ids.is_empty() {
                        self.by_scope.remove(&result.scope);
                    }
                }
                return true;
            }
        }
        false
    }

    fn purge_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let doomed: Vec<ResultId> = self
            .by_id
            .values()
            .filter(|r| r.created_at < cutoff)
            .map(|r| r.id)
            .collect();
        for id in &doomed {
            self.remove(id);
        }
        self.compact();
        doomed.len()
    }

    fn compact(&mut self) {
        let by_id = &self.by_id;
        self.order.retain(|id| by_id.contains_key(id));
    }
}

pub struct ResultStore {
    inner: Mutex<StoreInner>,
    config: ResultStoreConfig,
}

impl ResultStore {
    pub fn new(config: ResultStoreConfig) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                order: VecDeque::new(),
                by_id: HashMap::new(),
                by_scope: HashMap::new(),
                last_purge: Utc::now(),
            }),
            config,
        }
    }

    pub fn config(&self) -> &ResultStoreConfig {
        &self.config
    }

    /// Records `result`, evicting the oldest records past `max_size`.
    pub fn store(&self, result: EventResult) -> ResultId {
        let id = result.id;
        let now = Utc::now();
        let mut inner = self.inner.lock();

        let due = ChronoDuration::from_std(self.config.purge_interval)
            .map_or(false, |interval| now - inner.last_purge >= interval);
        if due {
            let purged = inner.purge_before(retention_cutoff(now, self.config.retention));
            inner.last_purge = now;
            if purged > 0 {
                debug!(purged, "Purged results past retention");
            }
        }

        inner.by_scope.entry(result.scope.clone()).or_default().push_back(id);
        inner.order.push_back(id);
        inner.by_id.insert(id, result);

        while inner.by_id.len() > self.config.max_size {
            if !inner.evict_oldest() {
                break;
            }
        }
        id
    }

    pub fn get(&self, id: &ResultId) -> Option<EventResult> {
        self.inner.lock().by_id.get(id).cloned()
    }

    pub fn delete(&self, id: &ResultId) -> bool {
        let mut inner = self.inner.lock();
        if inner.remove(id).is_none() {
            return false;
        }
        if let Some(position) = inner.order.iter().position(|i| i == id) {
            inner.order.remove(position);
        }
        true
    }

    /// Results matching `query`, newest first. An unknown scope yields an
    /// empty vector.
    pub fn query(&self, query: &ResultQuery) -> Vec<EventResult> {
        let inner = self.inner.lock();
        let limit = query.limit.unwrap_or(usize::MAX);

        let mut results: Vec<EventResult> = if query.lineage {
            inner
                .by_scope
                .iter()
                .filter(|(scope, _)| scope.is_within(&query.scope))
                .flat_map(|(_, ids)| ids.iter())
                .filter_map(|id| inner.by_id.get(id))
                .filter(|r| query.matches(r))
                .cloned()
                .collect()
        } else {
            match inner.by_scope.get(&query.scope) {
                Some(ids) => ids
                    .iter()
                    .rev()
                    .filter_map(|id| inner.by_id.get(id))
                    .filter(|r| query.matches(r))
                    .take(limit)
                    .cloned()
                    .collect(),
                None => Vec::new(),
            }
        };

        results.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        results.truncate(limit);
        results
    }

    /// Groups a scope's results (lineage included) inside `range`, default the
    /// last 24 hours.
    pub fn aggregate(
        &self,
        scope: &Scope,
        by: AggregateBy,
        range: Option<TimeRange>,
    ) -> BTreeMap<String, AggregateStats> {
        let range = range.unwrap_or_else(|| TimeRange::last(ChronoDuration::hours(24)));
        let results = self.query(&ResultQuery::for_scope(scope.clone()).lineage().time_range(range));

        let mut groups: BTreeMap<String, Vec<&EventResult>> = BTreeMap::new();
        for result in &results {
            let key = match by {
                AggregateBy::TimeBucket(bucket) => bucket.label(result.created_at),
                AggregateBy::EventType => result.event_type.clone(),
            };
            groups.entry(key).or_default().push(result);
        }
        groups
            .into_iter()
            .map(|(key, group)| (key, AggregateStats::from_results(group)))
            .collect()
    }

    pub fn clear_scope(&self, scope: &Scope) -> usize {
        let mut inner = self.inner.lock();
        let Some(ids) = inner.by_scope.remove(scope) else {
            return 0;
        };
        for id in &ids {
            inner.by_id.remove(id);
        }
        inner.compact();
        ids.len()
    }

    pub fn clear_tenant(&self, tenant_id: &str) -> usize {
        let mut inner = self.inner.lock();
        let scopes: Vec<Scope> = inner
            .by_scope
            .keys()
            .filter(|s| s.tenant_id() == tenant_id)
            .cloned()
            .collect();
        let mut removed = 0;
        for scope in scopes {
            if let Some(ids) = inner.by_scope.remove(&scope) {
                for id in &ids {
                    inner.by_id.remove(id);
                }
                removed += ids.len();
            }
        }
        inner.compact();
        removed
    }

    /// Removes every record older than the retention window as of `now`.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock();
        inner.last_purge = now;
        inner.purge_before(retention_cutoff(now, self.config.retention))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Totals over the whole store, or over one scope lineage.
    pub fn statistics(&self, scope: Option<&Scope>) -> ResultStoreStatistics {
        let inner = self.inner.lock();
        let mut stats = ResultStoreStatistics::default();
        for result in inner
            .by_id
            .values()
            .filter(|r| scope.map_or(true, |s| r.scope.is_within(s)))
        {
            stats.total_results += 1;
            *stats
                .by_status
                .entry(result.status.as_str().to_string())
                .or_default() += 1;
            *stats.by_event_type.entry(result.event_type.clone()).or_default() += 1;
            *stats.by_scope.entry(result.scope.to_string()).or_default() += 1;
        }
        stats
    }
}

fn retention_cutoff(now: DateTime<Utc>, retention: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(retention)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::EventEnvelope;
    use crate::domain::handler::HandlerId;
    use crate::domain::result::{ResultStatus, TimeBucket};
    use serde_json::json;

    fn store(max_size: usize) -> ResultStore {
        ResultStore::new(ResultStoreConfig {
            max_size,
            retention: Duration::from_secs(3600),
            purge_interval: Duration::from_secs(300),
        })
    }

    fn result(scope: &Scope, event_type: &str, status: ResultStatus) -> EventResult {
        let envelope = EventEnvelope::new(event_type, scope.clone(), json!({}));
        EventResult::for_delivery(&envelope, HandlerId::new(), "h", status)
    }

    #[test]
    fn test_query_is_scope_filtered() {
        let store = store(100);
        let a = Scope::agent("t1", "a1").unwrap();
        let b = Scope::agent("t2", "a1").unwrap();
        store.store(result(&a, "on_message", ResultStatus::Success));
        store.store(result(&b, "on_message", ResultStatus::Success));

        let found = store.query(&ResultQuery::for_scope(a.clone()));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].scope, a);
        assert!(store
            .query(&ResultQuery::for_scope(Scope::agent("t3", "a1").unwrap()))
            .is_empty());
    }

    #[test]
    fn test_lineage_query_includes_narrower_scopes() {
        let store = store(100);
        let root = Scope::agent("t1", "a1").unwrap();
        store.store(result(&root, "on_message", ResultStatus::Success));
        store.store(result(&root.clone().with_platform("qq"), "on_message", ResultStatus::Failure));

        assert_eq!(store.query(&ResultQuery::for_scope(root.clone())).len(), 1);
        assert_eq!(store.query(&ResultQuery::for_scope(root.clone()).lineage()).len(), 2);
        let failed = store.query(
            &ResultQuery::for_scope(root)
                .lineage()
                .status(ResultStatus::Failure),
        );
        assert_eq!(failed.len(), 1);
    }

    #[test]
    fn test_max_size_evicts_oldest() {
        let store = store(3);
        let scope = Scope::agent("t1", "a1").unwrap();
        let first = store.store(result(&scope, "e1", ResultStatus::Success));
        for i in 0..3 {
            store.store(result(&scope, &format!("e{}", i + 2), ResultStatus::Success));
        }
        assert_eq!(store.len(), 3);
        assert!(store.get(&first).is_none());
    }

    #[test]
    fn test_delete_unlinks_from_eviction_order() {
        let store = store(2);
        let scope = Scope::agent("t1", "a1").unwrap();
        let first = store.store(result(&scope, "e1", ResultStatus::Success));
        let second = store.store(result(&scope, "e2", ResultStatus::Success));
        assert!(store.delete(&first));
        assert!(!store.delete(&first));
        assert_eq!(store.inner.lock().order, VecDeque::from([second]));

        store.store(result(&scope, "e3", ResultStatus::Success));
        assert!(store.get(&second).is_some());
        store.store(result(&scope, "e4", ResultStatus::Success));
        assert_eq!(store.len(), 2);
        assert!(store.get(&second).is_none());
    }

    #[test]
    fn test_aggregate_by_event_type() {
        let store = store(100);
        let scope = Scope::agent("t1", "a1").unwrap();
        store.store(result(&scope, "on_message", ResultStatus::Success));
        store.store(result(&scope, "on_message", ResultStatus::Timeout));
        store.store(result(&scope, "on_memory_update", ResultStatus::Success));

        let groups = store.aggregate(&scope, AggregateBy::EventType, None);
        let messages = &groups["on_message"];
        assert_eq!(messages.total, 2);
        assert_eq!(messages.failure, 1);
        assert!((messages.success_rate - 0.5).abs() < f64::EPSILON);

        let buckets = store.aggregate(&scope, AggregateBy::TimeBucket(TimeBucket::Day), None);
        assert_eq!(buckets.values().map(|s| s.total).sum::<usize>(), 3);
    }

    #[test]
    fn test_purge_expired_and_clear_tenant() {
        let store = store(100);
        let scope = Scope::agent("t1", "a1").unwrap();
        store.store(result(&scope, "on_message", ResultStatus::Success));
        assert_eq!(store.purge_expired(Utc::now()), 0);
        assert_eq!(store.purge_expired(Utc::now() + ChronoDuration::hours(2)), 1);

        store.store(result(&scope, "on_message", ResultStatus::Success));
        store.store(result(&scope.clone().with_platform("qq"), "on_message", ResultStatus::Success));
        assert_eq!(store.clear_tenant("t1"), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn test_statistics_counts_by_status() {
        let store = store(100);
        let scope = Scope::agent("t1", "a1").unwrap();
        store.store(result(&scope, "on_message", ResultStatus::Success));
        store.store(result(&scope, "on_message", ResultStatus::Failure));
        let stats = store.statistics(Some(&scope));
        assert_eq!(stats.total_results, 2);
        assert_eq!(stats.by_status.get("success"), Some(&1));
        assert_eq!(store.clear_scope(&scope), 2);
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Handler delivery results and the query vocabulary of the result store

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

use crate::domain::event::{EventEnvelope, EventId, EventStatus};
use crate::domain::handler::HandlerId;
use crate::domain::scope::Scope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultId(pub Uuid);

impl ResultId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ResultId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ResultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Failure,
    Timeout,
    Cancelled,
    Partial,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Success => "success",
            ResultStatus::Failure => "failure",
            ResultStatus::Timeout => "timeout",
            ResultStatus::Cancelled => "cancelled",
            ResultStatus::Partial => "partial",
        }
    }

    pub fn from_event_status(status: EventStatus) -> Self {
        match status {
            EventStatus::Done => ResultStatus::Success,
            EventStatus::Timeout => ResultStatus::Timeout,
            EventStatus::Cancelled => ResultStatus::Cancelled,
            EventStatus::Failed | EventStatus::Pending | EventStatus::Running => {
                ResultStatus::Failure
            }
        }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one handler delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventResult {
    pub id: ResultId,
    pub event_id: EventId,
    pub event_type: String,
    pub scope: Scope,
    pub status: ResultStatus,
    pub result_data: Option<Value>,
    pub error_message: Option<String>,
    pub handler_id: Option<HandlerId>,
    pub handler_name: String,
    pub attempts: u32,
    pub execution_ms: u64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub trace_id: String,
    pub correlation_id: Option<String>,
    pub tags: Vec<String>,
}

impl EventResult {
    /// Result for `envelope` as delivered to one handler.
    pub fn for_delivery(
        envelope: &EventEnvelope,
        handler_id: HandlerId,
        handler_name: impl Into<String>,
        status: ResultStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ResultId::new(),
            event_id: envelope.id,
            event_type: envelope.event_type.clone(),
            scope: envelope.scope.clone(),
            status,
            result_data: None,
            error_message: None,
            handler_id: Some(handler_id),
            handler_name: handler_name.into(),
            attempts: envelope.attempts(),
            execution_ms: 0,
            created_at: now,
            completed_at: Some(now),
            trace_id: envelope.trace_id.clone(),
            correlation_id: envelope.correlation_id.clone(),
            tags: envelope.tags.clone(),
        }
    }

    pub fn with_data(mut self, data: Option<Value>) -> Self {
        self.result_data = data;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }

    pub fn with_execution_ms(mut self, execution_ms: u64) -> Self {
        self.execution_ms = execution_ms;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.status, ResultStatus::Failure | ResultStatus::Timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The trailing window ending now.
    pub fn last(window: ChronoDuration) -> Self {
        let end = Utc::now();
        Self {
            start: end - window,
            end,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}

/// Scope-filtered result lookup. `lineage` widens the match from the exact
/// scope to every scope within it.
#[derive(Debug, Clone)]
pub struct ResultQuery {
    pub scope: Scope,
    pub lineage: bool,
    pub event_type: Option<String>,
    pub time_range: Option<TimeRange>,
    pub status: Option<ResultStatus>,
    pub limit: Option<usize>,
}

impl ResultQuery {
    pub fn for_scope(scope: Scope) -> Self {
        Self {
            scope,
            lineage: false,
            event_type: None,
            time_range: None,
            status: None,
            limit: None,
        }
    }

    pub fn lineage(mut self) -> Self {
        self.lineage = true;
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn time_range(mut self, range: TimeRange) -> Self {
        self.time_range = Some(range);
        self
    }

    pub fn status(mut self, status: ResultStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, result: &EventResult) -> bool {
        let scope_ok = if self.lineage {
            result.scope.is_within(&self.scope)
        } else {
            result.scope == self.scope
        };
        scope_ok
            && self
                .event_type
                .as_deref()
                .map_or(true, |t| result.event_type == t)
            && self.status.map_or(true, |s| result.status == s)
            && self
                .time_range
                .map_or(true, |range| range.contains(result.created_at))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeBucket {
    Minute,
    Hour,
    Day,
}

impl TimeBucket {
    pub fn label(&self, at: DateTime<Utc>) -> String {
        let format = match self {
            TimeBucket::Minute => "%Y-%m-%d %H:%M",
            TimeBucket::Hour => "%Y-%m-%d %H:00",
            TimeBucket::Day => "%Y-%m-%d",
        };
        at.format(format).to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateBy {
    TimeBucket(TimeBucket),
    EventType,
}

/// Monitoring-only rollup of a group of results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub total: usize,
    pub success: usize,
    pub failure: usize,
    pub success_rate: f64,
    pub avg_execution_ms: f64,
    pub handlers: BTreeSet<String>,
}

impl AggregateStats {
    pub fn from_results<'a, I: IntoIterator<Item = &'a EventResult>>(results: I) -> Self {
        let mut stats = AggregateStats::default();
        let mut total_ms: u64 = 0;
        for result in results {
            stats.total += 1;
            if result.is_success() {
                stats.success += 1;
            }
            if result.is_failure() {
                stats.failure += 1;
            }
            total_ms += result.execution_ms;
            stats.handlers.insert(result.handler_name.clone());
        }
        if stats.total > 0 {
            stats.success_rate = stats.success as f64 / stats.total as f64;
            stats.avg_execution_ms = total_ms as f64 / stats.total as f64;
        }
        stats
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultStoreStatistics {
    pub total_results: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_event_type: BTreeMap<String, usize>,
    pub by_scope: BTreeMap<String, usize>,
}

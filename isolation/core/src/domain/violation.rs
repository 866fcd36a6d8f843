// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Sandbox violations
//!
//! A [`Violation`] is a recorded crossing of a sandbox policy threshold. It is
//! attached to the [`ExecutionResult`](crate::domain::plugin::ExecutionResult)
//! of the invocation that caused it and appended to the runtime's violation
//! log, even when the invocation itself still succeeds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::domain::scope::Scope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    Memory,
    Cpu,
    Time,
    File,
    Network,
    Module,
    Process,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::Memory => "memory",
            ViolationKind::Cpu => "cpu",
            ViolationKind::Time => "time",
            ViolationKind::File => "file",
            ViolationKind::Network => "network",
            ViolationKind::Module => "module",
            ViolationKind::Process => "process",
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub scope: Scope,
    pub plugin_id: String,
}

impl Violation {
    pub fn new(
        kind: ViolationKind,
        description: impl Into<String>,
        scope: Scope,
        plugin_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            description: description.into(),
            timestamp: Utc::now(),
            scope,
            plugin_id: plugin_id.into(),
        }
    }
}

/// Optional predicates for violation history lookups.
#[derive(Debug, Clone, Default)]
pub struct ViolationFilter {
    pub plugin_id: Option<String>,
    pub tenant_id: Option<String>,
    pub kind: Option<ViolationKind>,
    pub limit: Option<usize>,
}

impl ViolationFilter {
    pub fn matches(&self, violation: &Violation) -> bool {
        self.plugin_id
            .as_deref()
            .map_or(true, |p| violation.plugin_id == p)
            && self
                .tenant_id
                .as_deref()
                .map_or(true, |t| violation.scope.tenant_id() == t)
            && self.kind.map_or(true, |k| violation.kind == k)
    }
}

/// Windowed violation counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViolationStats {
    pub total_violations: usize,
    pub by_kind: BTreeMap<String, usize>,
    pub by_plugin: BTreeMap<String, usize>,
    pub by_tenant: BTreeMap<String, usize>,
    pub time_range_days: u32,
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Context Registry
//!
//! Owns every live [`Context`]. Structural state sits behind one
//! `parking_lot::Mutex`, which makes resolution linearizable: two concurrent
//! `resolve` calls for the same scope always observe the same instance.
//!
//! ## Storage
//!
//! | Structure | Role |
//! |-----------|------|
//! | slab `Vec<Slot>` + free list | owns contexts; slot generation invalidates stale handles |
//! | `LruCache<Scope, ContextHandle>` | scope index and recency order |
//!
//! ## Reclamation
//!
//! - **Idle TTL**: a context untouched for longer than its ttl is removed by
//!   the next `sweep`, or replaced by the next `resolve` of its scope.
//! - **Capacity**: inserting at `max_contexts` first evicts the least
//!   recently used context, whatever its ttl.
//! - **Invalidation**: marks a context and its narrowed descendants
//!   `Expiring`; they are treated as absent from then on.
//!
//! No lock is held while lifecycle events are broadcast.

use chrono::Utc;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::domain::collaborators::CollaboratorFactories;
use crate::domain::context::{Context, ContextHandle, ContextInfo, ContextState};
use crate::domain::error::IsolationError;
use crate::domain::events::{ContextEvent, EvictionReason};
use crate::domain::runtime_config::ContextsConfig;
use crate::domain::scope::{Scope, ScopeOverrides};
use crate::infrastructure::event_bus::EventBus;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub max_contexts: usize,
    pub default_ttl: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from(&ContextsConfig::default())
    }
}

impl From<&ContextsConfig> for RegistryConfig {
    fn from(config: &ContextsConfig) -> Self {
        Self {
            max_contexts: config.max_contexts.max(1),
            default_ttl: config.ttl,
        }
    }
}

/// Per-resolve overrides.
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
}

impl ContextOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            tags: Vec::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// A context with its direct relatives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextHierarchy {
    pub context: ContextInfo,
    pub parent: Option<ContextInfo>,
    pub children: Vec<ContextInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryStatistics {
    pub total_contexts: usize,
    pub active_contexts: usize,
    pub expiring_contexts: usize,
    /// Active but idle past ttl, waiting for the next sweep.
    pub expired_contexts: usize,
    pub max_contexts: usize,
    pub by_tenant: BTreeMap<String, usize>,
    pub by_platform: BTreeMap<String, usize>,
    pub average_use_count: f64,
    pub oldest_age_secs: Option<i64>,
    pub newest_age_secs: Option<i64>,
}

struct Slot {
    generation: u32,
    entry: Option<Arc<Context>>,
}

struct RegistryInner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_scope: LruCache<Scope, ContextHandle>,
}

impl RegistryInner {
    fn get(&self, handle: ContextHandle) -> Option<Arc<Context>> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.clone()
    }

    fn live(&self) -> impl Iterator<Item = &Arc<Context>> {
        self.slots.iter().filter_map(|slot| slot.entry.as_ref())
    }

    fn allocate(&mut self) -> ContextHandle {
        if let Some(index) = self.free.pop() {
            let generation = self.slots[index as usize].generation;
            return ContextHandle { index, generation };
        }
        self.slots.push(Slot {
            generation: 0,
            entry: None,
        });
        ContextHandle {
            index: (self.slots.len() - 1) as u32,
            generation: 0,
        }
    }

    /// Removes the context at `handle`, bumps its slot generation and severs
    /// its tree links.
    fn destroy(
        &mut self,
        handle: ContextHandle,
        reason: EvictionReason,
        events: &mut Vec<ContextEvent>,
    ) -> bool {
        let Some(slot) = self.slots.get_mut(handle.index as usize) else {
            return false;
        };
        if slot.generation != handle.generation {
            return false;
        }
        let Some(context) = slot.entry.take() else {
            return false;
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);

        if self.by_scope.peek(context.scope()) == Some(&handle) {
            self.by_scope.pop(context.scope());
        }
        if let Some(parent) = context.parent().and_then(|p| self.get(p)) {
            parent.remove_child(handle);
        }
        for child in context.take_children() {
            if let Some(child) = self.get(child) {
                child.clear_parent();
            }
        }
        context.clear_parent();
        context.set_state(ContextState::Destroyed);
        context.clear_cache();

        metrics::counter!("enclave_contexts_evicted_total", "reason" => reason.as_str()).increment(1);
        metrics::gauge!("enclave_contexts_live").set(self.by_scope.len() as f64);
        debug!(handle = %handle, scope = %context.scope(), reason = reason.as_str(), "Destroyed context");
        events.push(ContextEvent::Destroyed {
            handle,
            scope: context.scope().clone(),
            reason,
            destroyed_at: Utc::now(),
        });
        true
    }
}

pub struct ContextRegistry {
    inner: Mutex<RegistryInner>,
    config: RegistryConfig,
    factories: CollaboratorFactories,
    event_bus: EventBus,
}

impl ContextRegistry {
    pub fn new(config: RegistryConfig, factories: CollaboratorFactories, event_bus: EventBus) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                slots: Vec::new(),
                free: Vec::new(),
                by_scope: LruCache::unbounded(),
            }),
            config,
            factories,
            event_bus,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Returns the live context for `scope`, creating it when absent.
    pub fn resolve(&self, scope: &Scope) -> Arc<Context> {
        self.resolve_with(scope, ContextOptions::default())
    }

    /// `resolve` with a context-specific ttl and tags. Options only shape a
    /// newly created context; tags are also merged into an existing one.
    pub fn resolve_with(&self, scope: &Scope, options: ContextOptions) -> Arc<Context> {
        let mut events = Vec::new();
        let context = {
            let mut inner = self.inner.lock();
            self.resolve_locked(&mut inner, scope, options, None, &mut events)
        };
        self.publish(events);
        context
    }

    /// Derives a child of `parent` narrowed by `overrides` and registers the
    /// parent→child edge used by cascading invalidation.
    pub fn narrow(
        &self,
        parent: &Context,
        overrides: &ScopeOverrides,
    ) -> Result<Arc<Context>, IsolationError> {
        let child_scope = parent.scope().narrow(overrides)?;

        let mut events = Vec::new();
        let child = {
            let mut inner = self.inner.lock();
            let parent = inner
                .get(parent.handle())
                .filter(|p| p.is_live())
                .ok_or_else(|| {
                    IsolationError::Configuration(format!(
                        "cannot narrow from {}: context is no longer live",
                        parent.scope()
                    ))
                })?;

            if child_scope == *parent.scope() {
                inner.by_scope.promote(parent.scope());
                parent.touch(Instant::now());
                parent
            } else {
                let options = ContextOptions {
                    ttl: Some(parent.ttl()),
                    tags: Vec::new(),
                };
                self.resolve_locked(&mut inner, &child_scope, options, Some(&parent), &mut events)
            }
        };
        self.publish(events);
        Ok(child)
    }

    /// Marks the context for `scope` and all its descendants `Expiring`.
    /// Returns how many contexts were marked.
    pub fn invalidate(&self, scope: &Scope) -> usize {
        let (root, marked) = {
            let inner = self.inner.lock();
            let Some(root) = inner.by_scope.peek(scope).and_then(|h| inner.get(*h)) else {
                return 0;
            };

            let mut marked: usize = 0;
            let mut seen = BTreeSet::new();
            let mut queue = VecDeque::from([root.clone()]);
            while let Some(context) = queue.pop_front() {
                if !seen.insert(context.handle()) {
                    continue;
                }
                if context.state() == ContextState::Active {
                    context.set_state(ContextState::Expiring);
                    marked += 1;
                }
                queue.extend(context.children().into_iter().filter_map(|h| inner.get(h)));
            }
            (root.handle(), marked)
        };

        info!(scope = %scope, marked, "Invalidated context tree");
        self.event_bus.publish_context_event(ContextEvent::Invalidated {
            handle: root,
            scope: scope.clone(),
            cascaded: marked.saturating_sub(1),
            invalidated_at: Utc::now(),
        });
        marked
    }

    /// Resets the idle timer, bumps `use_count` and promotes in LRU order.
    pub fn touch(&self, scope: &Scope) -> bool {
        let mut inner = self.inner.lock();
        let Some(handle) = inner.by_scope.get(scope).copied() else {
            return false;
        };
        match inner.get(handle).filter(|c| c.is_live()) {
            Some(context) => {
                context.touch(Instant::now());
                true
            }
            None => false,
        }
    }

    /// Removes every context idle past its ttl or no longer active.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut events = Vec::new();
        let removed = {
            let mut inner = self.inner.lock();
            let doomed: Vec<(ContextHandle, EvictionReason)> = inner
                .live()
                .filter(|c| c.is_expired(now))
                .map(|c| (c.handle(), reason_for(c)))
                .collect();
            doomed
                .into_iter()
                .filter(|(handle, reason)| inner.destroy(*handle, *reason, &mut events))
                .count()
        };
        if removed > 0 {
            info!(removed, "Context sweep reclaimed expired contexts");
        }
        self.publish(events);
        removed
    }

    pub fn get(&self, handle: ContextHandle) -> Option<Arc<Context>> {
        self.inner.lock().get(handle)
    }

    /// Live context for `scope` without creating one or touching it.
    pub fn lookup(&self, scope: &Scope) -> Option<Arc<Context>> {
        let inner = self.inner.lock();
        inner
            .by_scope
            .peek(scope)
            .and_then(|h| inner.get(*h))
            .filter(|c| c.is_live())
    }

    pub fn children(&self, scope: &Scope) -> Vec<Arc<Context>> {
        let inner = self.inner.lock();
        let Some(context) = inner.by_scope.peek(scope).and_then(|h| inner.get(*h)) else {
            return Vec::new();
        };
        context
            .children()
            .into_iter()
            .filter_map(|h| inner.get(h))
            .collect()
    }

    pub fn hierarchy(&self, scope: &Scope) -> Option<ContextHierarchy> {
        let inner = self.inner.lock();
        let context = inner.by_scope.peek(scope).and_then(|h| inner.get(*h))?;
        Some(ContextHierarchy {
            context: context.info(),
            parent: context.parent().and_then(|h| inner.get(h)).map(|p| p.info()),
            children: context
                .children()
                .into_iter()
                .filter_map(|h| inner.get(h))
                .map(|c| c.info())
                .collect(),
        })
    }

    pub fn find_by_tag(&self, tag: &str) -> Vec<Arc<Context>> {
        let inner = self.inner.lock();
        inner
            .live()
            .filter(|c| c.is_live() && c.has_tag(tag))
            .cloned()
            .collect()
    }

    pub fn add_tags<I, S>(&self, scope: &Scope, tags: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        match self.lookup(scope) {
            Some(context) => {
                context.add_tags(tags.into_iter().map(Into::into));
                true
            }
            None => false,
        }
    }

    pub fn extend_ttl(&self, scope: &Scope, extra: Duration) -> bool {
        match self.lookup(scope) {
            Some(context) => {
                context.extend_ttl(extra);
                true
            }
            None => false,
        }
    }

    /// Destroys every context belonging to `tenant_id`.
    pub fn clear_tenant(&self, tenant_id: &str) -> usize {
        self.destroy_where(EvictionReason::TenantCleared, |c| c.scope().tenant_id() == tenant_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_scope.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn statistics(&self) -> RegistryStatistics {
        let now = Instant::now();
        let wall_now = Utc::now();
        let inner = self.inner.lock();
        let mut stats = RegistryStatistics {
            max_contexts: self.config.max_contexts,
            ..Default::default()
        };
        let mut total_uses: u64 = 0;
        for context in inner.live() {
            stats.total_contexts += 1;
            match context.state() {
                ContextState::Active if context.is_expired(now) => stats.expired_contexts += 1,
                ContextState::Active => stats.active_contexts += 1,
                ContextState::Expiring => stats.expiring_contexts += 1,
                ContextState::Destroyed => {}
            }
            *stats
                .by_tenant
                .entry(context.scope().tenant_id().to_string())
                .or_default() += 1;
            if let Some(platform) = context.scope().platform() {
                *stats.by_platform.entry(platform.to_string()).or_default() += 1;
            }
            total_uses += context.use_count();
            let age = (wall_now - context.created_at()).num_seconds();
            stats.oldest_age_secs = Some(stats.oldest_age_secs.map_or(age, |a| a.max(age)));
            stats.newest_age_secs = Some(stats.newest_age_secs.map_or(age, |a| a.min(age)));
        }
        if stats.total_contexts > 0 {
            stats.average_use_count = total_uses as f64 / stats.total_contexts as f64;
        }
        stats
    }

    /// Destroys every context.
    pub fn shutdown(&self) -> usize {
        let removed = self.destroy_where(EvictionReason::Shutdown, |_| true);
        info!(removed, "Context registry shut down");
        removed
    }

    fn destroy_where<F>(&self, reason: EvictionReason, predicate: F) -> usize
    where
        F: Fn(&Context) -> bool,
    {
        let mut events = Vec::new();
        let removed = {
            let mut inner = self.inner.lock();
            let doomed: Vec<ContextHandle> = inner
                .live()
                .filter(|c| predicate(c))
                .map(|c| c.handle())
                .collect();
            doomed
                .into_iter()
                .filter(|handle| inner.destroy(*handle, reason, &mut events))
                .count()
        };
        self.publish(events);
        removed
    }

    fn resolve_locked(
        &self,
        inner: &mut RegistryInner,
        scope: &Scope,
        options: ContextOptions,
        parent: Option<&Arc<Context>>,
        events: &mut Vec<ContextEvent>,
    ) -> Arc<Context> {
        let now = Instant::now();

        if let Some(handle) = inner.by_scope.get(scope).copied() {
            match inner.get(handle) {
                Some(existing) if !existing.is_expired(now) => {
                    existing.touch(now);
                    if !options.tags.is_empty() {
                        existing.add_tags(options.tags);
                    }
                    if let Some(parent) = parent {
                        if existing.set_parent_if_absent(parent.handle()) {
                            parent.add_child(existing.handle());
                        }
                    }
                    return existing;
                }
                Some(stale) => {
                    let reason = reason_for(&stale);
                    inner.destroy(handle, reason, events);
                }
                None => {
                    inner.by_scope.pop(scope);
                }
            }
        }

        // The parent of a context being narrowed is pinned; at capacity one
        // the registry briefly holds both.
        while inner.by_scope.len() >= self.config.max_contexts {
            let Some(lru) = inner.by_scope.peek_lru().map(|(_, h)| *h) else {
                break;
            };
            if let Some(parent) = parent.filter(|p| p.handle() == lru) {
                if inner.by_scope.len() == 1 {
                    break;
                }
                inner.by_scope.promote(parent.scope());
                continue;
            }
            if !inner.destroy(lru, EvictionReason::CapacityLru, events) {
                inner.by_scope.pop_lru();
            }
        }

        let handle = inner.allocate();
        let context = Arc::new(Context::new(
            handle,
            scope.clone(),
            options.ttl.unwrap_or(self.config.default_ttl),
            options.tags.into_iter().collect(),
            parent.map(|p| p.handle()),
            self.factories.clone(),
        ));
        context.touch(now);
        inner.slots[handle.index as usize].entry = Some(context.clone());
        inner.by_scope.put(scope.clone(), handle);
        if let Some(parent) = parent {
            parent.add_child(handle);
        }

        metrics::counter!("enclave_contexts_created_total").increment(1);
        metrics::gauge!("enclave_contexts_live").set(inner.by_scope.len() as f64);
        debug!(handle = %handle, scope = %scope, "Created context");
        events.push(ContextEvent::Created {
            handle,
            scope: scope.clone(),
            parent: parent.map(|p| p.handle()),
            created_at: Utc::now(),
        });
        context
    }

    fn publish(&self, events: Vec<ContextEvent>) {
        for event in events {
            self.event_bus.publish_context_event(event);
        }
    }
}

fn reason_for(context: &Context) -> EvictionReason {
    match context.state() {
        ContextState::Active => EvictionReason::Expired,
        _ => EvictionReason::Invalidated,
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Isolation Context
//!
//! A [`Context`] is the live handle bound to one [`Scope`]. It is owned by the
//! [`ContextRegistry`](crate::application::context_registry::ContextRegistry),
//! which stores it in a slab and hands out `Arc<Context>` clones together
//! with a [`ContextHandle`] `(index, generation)` pair. Evicting a context bumps
//! the slot generation, so stale handles stop resolving without any weak
//! references.
//!
//! ## Lifecycle
//! | State | Meaning |
//! |-------|---------|
//! | `Active` | live and reusable |
//! | `Expiring` | invalidated, removed on next sweep or resolve |
//! | `Destroyed` | removed from the registry, tree links severed |

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::domain::collaborators::{
    ChatProvider, CollaboratorFactories, CollaboratorKind, ConfigProvider, MemoryProvider,
};
use crate::domain::error::IsolationError;
use crate::domain::scope::Scope;

/// Generation-checked slab index of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextHandle {
    pub index: u32,
    pub generation: u32,
}

impl fmt::Display for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextState {
    Active,
    Expiring,
    Destroyed,
}

#[derive(Default)]
struct CollaboratorCache {
    config: Option<Arc<dyn ConfigProvider>>,
    memory: Option<Arc<dyn MemoryProvider>>,
    chat: Option<Arc<dyn ChatProvider>>,
}

struct ContextMeta {
    last_used: Instant,
    ttl: Duration,
    state: ContextState,
    parent: Option<ContextHandle>,
    children: BTreeSet<ContextHandle>,
    tags: BTreeSet<String>,
    data: HashMap<String, Value>,
}

/// Point-in-time view of a context for statistics and the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextInfo {
    pub handle: ContextHandle,
    pub scope: Scope,
    pub state: ContextState,
    pub created_at: DateTime<Utc>,
    pub use_count: u64,
    pub idle_for_ms: u64,
    pub ttl_ms: u64,
    pub parent: Option<ContextHandle>,
    pub children: usize,
    pub tags: Vec<String>,
}

pub struct Context {
    handle: ContextHandle,
    scope: Scope,
    created_at: DateTime<Utc>,
    use_count: AtomicU64,
    meta: Mutex<ContextMeta>,
    factories: CollaboratorFactories,
    collaborators: Mutex<CollaboratorCache>,
}

impl Context {
    pub(crate) fn new(
        handle: ContextHandle,
        scope: Scope,
        ttl: Duration,
        tags: BTreeSet<String>,
        parent: Option<ContextHandle>,
        factories: CollaboratorFactories,
    ) -> Self {
        Self {
            handle,
            scope,
            created_at: Utc::now(),
            use_count: AtomicU64::new(0),
            meta: Mutex::new(ContextMeta {
                last_used: Instant::now(),
                ttl,
                state: ContextState::Active,
                parent,
                children: BTreeSet::new(),
                tags,
                data: HashMap::new(),
            }),
            factories,
            collaborators: Mutex::new(CollaboratorCache::default()),
        }
    }

    pub fn handle(&self) -> ContextHandle {
        self.handle
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn use_count(&self) -> u64 {
        self.use_count.load(Ordering::Relaxed)
    }

    pub fn last_used(&self) -> Instant {
        self.meta.lock().last_used
    }

    pub fn ttl(&self) -> Duration {
        self.meta.lock().ttl
    }

    pub fn state(&self) -> ContextState {
        self.meta.lock().state
    }

    pub fn is_live(&self) -> bool {
        self.state() == ContextState::Active
    }

    pub fn parent(&self) -> Option<ContextHandle> {
        self.meta.lock().parent
    }

    pub fn children(&self) -> Vec<ContextHandle> {
        self.meta.lock().children.iter().copied().collect()
    }

    pub fn tags(&self) -> Vec<String> {
        self.meta.lock().tags.iter().cloned().collect()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.meta.lock().tags.contains(tag)
    }

    pub fn set_data(&self, key: impl Into<String>, value: Value) {
        self.meta.lock().data.insert(key.into(), value);
    }

    pub fn get_data(&self, key: &str) -> Option<Value> {
        self.meta.lock().data.get(key).cloned()
    }

    /// Scope-bound configuration, built on first use.
    pub fn config(&self) -> Result<Arc<dyn ConfigProvider>, IsolationError> {
        self.ensure_live()?;
        let mut cache = self.collaborators.lock();
        let provider = cache
            .config
            .get_or_insert_with(|| (self.factories.config)(&self.scope));
        Ok(provider.clone())
    }

    /// Scope-bound memory, built on first use.
    pub fn memory(&self) -> Result<Arc<dyn MemoryProvider>, IsolationError> {
        self.ensure_live()?;
        let mut cache = self.collaborators.lock();
        let provider = cache
            .memory
            .get_or_insert_with(|| (self.factories.memory)(&self.scope));
        Ok(provider.clone())
    }

    /// Scope-bound chat registry, built on first use.
    pub fn chat(&self) -> Result<Arc<dyn ChatProvider>, IsolationError> {
        self.ensure_live()?;
        let mut cache = self.collaborators.lock();
        let provider = cache
            .chat
            .get_or_insert_with(|| (self.factories.chat)(&self.scope));
        Ok(provider.clone())
    }

    /// Drops every cached collaborator; the next access rebuilds it.
    pub fn clear_cache(&self) {
        *self.collaborators.lock() = CollaboratorCache::default();
    }

    pub fn cached_kinds(&self) -> Vec<CollaboratorKind> {
        let cache = self.collaborators.lock();
        let mut kinds = Vec::new();
        if cache.config.is_some() {
            kinds.push(CollaboratorKind::Config);
        }
        if cache.memory.is_some() {
            kinds.push(CollaboratorKind::Memory);
        }
        if cache.chat.is_some() {
            kinds.push(CollaboratorKind::Chat);
        }
        kinds
    }

    pub fn info(&self) -> ContextInfo {
        let meta = self.meta.lock();
        ContextInfo {
            handle: self.handle,
            scope: self.scope.clone(),
            state: meta.state,
            created_at: self.created_at,
            use_count: self.use_count(),
            idle_for_ms: Instant::now()
                .saturating_duration_since(meta.last_used)
                .as_millis() as u64,
            ttl_ms: meta.ttl.as_millis() as u64,
            parent: meta.parent,
            children: meta.children.len(),
            tags: meta.tags.iter().cloned().collect(),
        }
    }

    fn ensure_live(&self) -> Result<(), IsolationError> {
        match self.state() {
            ContextState::Destroyed => Err(IsolationError::Configuration(format!(
                "context {} for scope {} has been destroyed",
                self.handle, self.scope
            ))),
            _ => Ok(()),
        }
    }

    // Registry-side mutations. Callers hold the registry lock.

    pub(crate) fn touch(&self, now: Instant) {
        self.meta.lock().last_used = now;
        self.use_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        let meta = self.meta.lock();
        meta.state != ContextState::Active
            || now.saturating_duration_since(meta.last_used) > meta.ttl
    }

    pub(crate) fn set_state(&self, state: ContextState) {
        self.meta.lock().state = state;
    }

    pub(crate) fn extend_ttl(&self, extra: Duration) {
        let mut meta = self.meta.lock();
        meta.ttl = meta.ttl.saturating_add(extra);
    }

    pub(crate) fn add_tags<I: IntoIterator<Item = String>>(&self, tags: I) {
        self.meta.lock().tags.extend(tags);
    }

    pub(crate) fn add_child(&self, child: ContextHandle) {
        self.meta.lock().children.insert(child);
    }

    pub(crate) fn remove_child(&self, child: ContextHandle) {
        self.meta.lock().children.remove(&child);
    }

    /// Adopts `parent` when no parent is set. Returns whether `parent` is the
    /// context's parent afterwards.
    pub(crate) fn set_parent_if_absent(&self, parent: ContextHandle) -> bool {
        *self.meta.lock().parent.get_or_insert(parent) == parent
    }

    pub(crate) fn clear_parent(&self) {
        self.meta.lock().parent = None;
    }

    pub(crate) fn take_children(&self) -> Vec<ContextHandle> {
        std::mem::take(&mut self.meta.lock().children)
            .into_iter()
            .collect()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("handle", &self.handle)
            .field("scope", &self.scope)
            .field("state", &self.state())
            .field("use_count", &self.use_count())
            .finish()
    }
}

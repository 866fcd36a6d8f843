// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Scope-bound collaborator interfaces
//!
//! The runtime never implements configuration, memory or chat registries
//! itself. It caches whatever the injected factories return, one instance per
//! interface per context.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Closed set of capability interfaces a `Context` can hand out

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::domain::scope::Scope;

/// Scope-resolved configuration (agent persona, platform settings, ...).
pub trait ConfigProvider: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value);
}

/// Scope-partitioned conversational memory.
pub trait MemoryProvider: Send + Sync {
    fn remember(&self, key: &str, value: Value);
    fn recall(&self, key: &str) -> Option<Value>;
    fn forget(&self, key: &str) -> bool;
}

/// Registry of chat streams reachable from a scope.
pub trait ChatProvider: Send + Sync {
    fn register_stream(&self, stream_id: &str);
    fn streams(&self) -> Vec<String>;
}

/// Interface identifiers used for cache bookkeeping and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CollaboratorKind {
    Config,
    Memory,
    Chat,
}

impl fmt::Display for CollaboratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollaboratorKind::Config => f.write_str("config"),
            CollaboratorKind::Memory => f.write_str("memory"),
            CollaboratorKind::Chat => f.write_str("chat"),
        }
    }
}

pub type ConfigFactory = Arc<dyn Fn(&Scope) -> Arc<dyn ConfigProvider> + Send + Sync>;
pub type MemoryFactory = Arc<dyn Fn(&Scope) -> Arc<dyn MemoryProvider> + Send + Sync>;
pub type ChatFactory = Arc<dyn Fn(&Scope) -> Arc<dyn ChatProvider> + Send + Sync>;

/// Factories injected into the context registry.
#[derive(Clone)]
pub struct CollaboratorFactories {
    pub config: ConfigFactory,
    pub memory: MemoryFactory,
    pub chat: ChatFactory,
}

impl fmt::Debug for CollaboratorFactories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollaboratorFactories").finish_non_exhaustive()
    }
}

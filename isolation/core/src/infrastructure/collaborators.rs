// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! In-memory collaborator providers
//!
//! Default factories used when the embedding application injects nothing.
//! Each provider instance is bound to one scope and keeps its state in
//! process memory only.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::domain::collaborators::{
    ChatProvider, CollaboratorFactories, ConfigProvider, MemoryProvider,
};
use crate::domain::scope::{generate_isolated_id, Scope};

/// Configuration map seeded with the scope's own dimensions.
pub struct InMemoryConfigProvider {
    values: RwLock<HashMap<String, Value>>,
}

impl InMemoryConfigProvider {
    pub fn for_scope(scope: &Scope) -> Self {
        let mut values = HashMap::new();
        values.insert("tenant_id".to_string(), Value::from(scope.tenant_id()));
        values.insert("agent_id".to_string(), Value::from(scope.agent_id()));
        if let Some(platform) = scope.platform() {
            values.insert("platform".to_string(), Value::from(platform));
        }
        if let Some(conversation) = scope.conversation_id() {
            values.insert("conversation_id".to_string(), Value::from(conversation));
        }
        Self {
            values: RwLock::new(values),
        }
    }
}

impl ConfigProvider for InMemoryConfigProvider {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        self.values.write().insert(key.to_string(), value);
    }
}

/// Memory store whose keys are namespaced by the scope hash.
pub struct InMemoryMemoryProvider {
    scope: Scope,
    entries: RwLock<HashMap<String, Value>>,
}

impl InMemoryMemoryProvider {
    pub fn for_scope(scope: &Scope) -> Self {
        Self {
            scope: scope.clone(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn key(&self, key: &str) -> String {
        generate_isolated_id("memory", &self.scope, key)
    }
}

impl MemoryProvider for InMemoryMemoryProvider {
    fn remember(&self, key: &str, value: Value) {
        self.entries.write().insert(self.key(key), value);
    }

    fn recall(&self, key: &str) -> Option<Value> {
        self.entries.read().get(&self.key(key)).cloned()
    }

    fn forget(&self, key: &str) -> bool {
        self.entries.write().remove(&self.key(key)).is_some()
    }
}

#[derive(Default)]
pub struct InMemoryChatProvider {
    streams: RwLock<BTreeSet<String>>,
}

impl ChatProvider for InMemoryChatProvider {
    fn register_stream(&self, stream_id: &str) {
        self.streams.write().insert(stream_id.to_string());
    }

    fn streams(&self) -> Vec<String> {
        self.streams.read().iter().cloned().collect()
    }
}

pub fn in_memory_factories() -> CollaboratorFactories {
    CollaboratorFactories {
        config: Arc::new(|scope: &Scope| {
            Arc::new(InMemoryConfigProvider::for_scope(scope)) as Arc<dyn ConfigProvider>
        }),
        memory: Arc::new(|scope: &Scope| {
            Arc::new(InMemoryMemoryProvider::for_scope(scope)) as Arc<dyn MemoryProvider>
        }),
        chat: Arc::new(|_scope: &Scope| {
            Arc::new(InMemoryChatProvider::default()) as Arc<dyn ChatProvider>
        }),
    }
}

impl Default for CollaboratorFactories {
    fn default() -> Self {
        in_memory_factories()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_seeded_from_scope() {
        let scope = Scope::agent("acme", "bot").unwrap().with_platform("qq");
        let config = InMemoryConfigProvider::for_scope(&scope);
        assert_eq!(config.get("tenant_id"), Some(json!("acme")));
        assert_eq!(config.get("platform"), Some(json!("qq")));
        assert_eq!(config.get("conversation_id"), None);
        config.set("persona", json!("friendly"));
        assert_eq!(config.get("persona"), Some(json!("friendly")));
    }

    #[test]
    fn test_memory_roundtrip() {
        let memory = InMemoryMemoryProvider::for_scope(&Scope::agent("acme", "bot").unwrap());
        memory.remember("likes", json!(["tea"]));
        assert_eq!(memory.recall("likes"), Some(json!(["tea"])));
        assert!(memory.forget("likes"));
        assert!(!memory.forget("likes"));
    }

    #[test]
    fn test_factories_build_independent_instances() {
        let factories = in_memory_factories();
        let a = Scope::agent("t1", "a1").unwrap();
        let b = Scope::agent("t2", "a1").unwrap();
        let mem_a = (factories.memory)(&a);
        let mem_b = (factories.memory)(&b);
        mem_a.remember("k", json!(1));
        assert_eq!(mem_b.recall("k"), None);
    }
}

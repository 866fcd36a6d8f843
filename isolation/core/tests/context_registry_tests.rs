// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Integration tests for context lifecycle: singleton resolution, narrowing,
//! idle expiry and LRU eviction.

use enclave_core::application::context_registry::{ContextOptions, ContextRegistry, RegistryConfig};
use enclave_core::domain::context::ContextState;
use enclave_core::domain::error::IsolationError;
use enclave_core::domain::events::{ContextEvent, EvictionReason};
use enclave_core::domain::scope::{Scope, ScopeOverrides};
use enclave_core::infrastructure::collaborators::in_memory_factories;
use enclave_core::infrastructure::event_bus::{DomainEvent, EventBus};
use enclave_core::Runtime;
use std::sync::Arc;
use std::time::Duration;

fn registry(max_contexts: usize, ttl: Duration, event_bus: EventBus) -> Arc<ContextRegistry> {
    Arc::new(ContextRegistry::new(
        RegistryConfig {
            max_contexts,
            default_ttl: ttl,
        },
        in_memory_factories(),
        event_bus,
    ))
}

fn scope(tenant: &str) -> Scope {
    Scope::agent(tenant, "a1").unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resolve_yields_single_context() {
    let registry = registry(100, Duration::from_secs(60), EventBus::new(256));
    let target = scope("t1").with_platform("qq").with_conversation("c1");

    let mut handles = Vec::new();
    for _ in 0..32 {
        let registry = registry.clone();
        let target = target.clone();
        handles.push(tokio::spawn(async move { registry.resolve(&target) }));
    }

    let mut contexts = Vec::new();
    for handle in handles {
        contexts.push(handle.await.unwrap());
    }
    let first = &contexts[0];
    assert!(contexts.iter().all(|c| Arc::ptr_eq(c, first)));
    assert_eq!(first.use_count(), 32);
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_narrow_sets_only_overridden_field() {
    let registry = registry(10, Duration::from_secs(60), EventBus::new(16));
    let parent = registry.resolve(&scope("t1").with_platform("qq"));
    let child = registry
        .narrow(&parent, &ScopeOverrides::conversation("c9"))
        .unwrap();

    assert_eq!(child.scope().tenant_id(), "t1");
    assert_eq!(child.scope().agent_id(), "a1");
    assert_eq!(child.scope().platform(), Some("qq"));
    assert_eq!(child.scope().conversation_id(), Some("c9"));
    assert_eq!(child.parent(), Some(parent.handle()));
    assert_eq!(parent.children(), vec![child.handle()]);
}

#[tokio::test]
async fn test_narrow_conflicting_override_is_configuration_error() {
    let registry = registry(10, Duration::from_secs(60), EventBus::new(16));
    let parent = registry.resolve(&scope("t1").with_platform("qq"));
    let err = registry
        .narrow(&parent, &ScopeOverrides::platform("discord"))
        .unwrap_err();
    assert!(matches!(err, IsolationError::Configuration(_)));
}

#[tokio::test(start_paused = true)]
async fn test_idle_context_is_swept_and_replaced() {
    let registry = registry(10, Duration::from_secs(60), EventBus::new(16));
    let first = registry.resolve(&scope("t1"));

    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(registry.sweep(), 0);

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(registry.sweep(), 1);
    assert_eq!(first.state(), ContextState::Destroyed);

    let second = registry.resolve(&scope("t1"));
    assert!(!Arc::ptr_eq(&first, &second));
    assert_ne!(first.handle(), second.handle());
}

#[tokio::test(start_paused = true)]
async fn test_touch_keeps_context_alive() {
    let registry = registry(10, Duration::from_secs(60), EventBus::new(16));
    let first = registry.resolve(&scope("t1"));

    for _ in 0..3 {
        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(registry.touch(&scope("t1")));
    }
    assert_eq!(registry.sweep(), 0);
    assert!(Arc::ptr_eq(&first, &registry.resolve(&scope("t1"))));
}

#[tokio::test(start_paused = true)]
async fn test_expired_context_is_replaced_on_resolve_without_sweep() {
    let registry = registry(10, Duration::from_secs(5), EventBus::new(16));
    let first = registry.resolve_with(&scope("t1"), ContextOptions::ttl(Duration::from_secs(1)));
    tokio::time::advance(Duration::from_secs(2)).await;

    let second = registry.resolve(&scope("t1"));
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_capacity_evicts_exactly_least_recently_used() {
    let event_bus = EventBus::new(64);
    let mut events = event_bus.subscribe();
    let registry = registry(3, Duration::from_secs(3600), event_bus);

    registry.resolve(&scope("t1"));
    registry.resolve(&scope("t2"));
    registry.resolve(&scope("t3"));
    assert!(registry.touch(&scope("t1")));
    registry.resolve(&scope("t4"));

    assert_eq!(registry.len(), 3);
    assert!(registry.lookup(&scope("t2")).is_none());
    for tenant in ["t1", "t3", "t4"] {
        assert!(registry.lookup(&scope(tenant)).is_some(), "{tenant} should survive");
    }

    let mut evicted = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let DomainEvent::Context(ContextEvent::Destroyed { scope, reason, .. }) = event {
            evicted.push((scope, reason));
        }
    }
    assert_eq!(evicted, vec![(scope("t2"), EvictionReason::CapacityLru)]);
}

#[tokio::test]
async fn test_narrow_at_capacity_keeps_parent_and_evicts_another() {
    let registry = registry(2, Duration::from_secs(3600), EventBus::new(16));
    let parent = registry.resolve(&scope("t1"));
    registry.resolve(&scope("t2"));

    let child = registry
        .narrow(&parent, &ScopeOverrides::platform("qq"))
        .unwrap();

    assert_eq!(parent.state(), ContextState::Active);
    assert!(registry.lookup(parent.scope()).is_some());
    assert!(registry.lookup(&scope("t2")).is_none());
    assert_eq!(registry.len(), 2);
    assert_eq!(child.parent(), Some(parent.handle()));

    assert_eq!(registry.invalidate(parent.scope()), 2);
    assert_eq!(child.state(), ContextState::Expiring);
}

#[tokio::test]
async fn test_narrow_at_capacity_one_holds_parent_and_child() {
    let registry = registry(1, Duration::from_secs(3600), EventBus::new(16));
    let parent = registry.resolve(&scope("t1"));
    let child = registry
        .narrow(&parent, &ScopeOverrides::platform("qq"))
        .unwrap();

    assert_eq!(parent.state(), ContextState::Active);
    assert_eq!(child.parent(), Some(parent.handle()));
    assert_eq!(registry.len(), 2);

    // The next unrelated insert restores the bound.
    registry.resolve(&scope("t2"));
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_narrow_into_existing_child_keeps_its_parent() {
    let registry = registry(10, Duration::from_secs(3600), EventBus::new(16));
    let by_platform = registry.resolve(&scope("t1").with_platform("qq"));
    let by_conversation = registry.resolve(&scope("t1").with_conversation("c1"));

    let child = registry
        .narrow(&by_platform, &ScopeOverrides::conversation("c1"))
        .unwrap();
    let again = registry
        .narrow(&by_conversation, &ScopeOverrides::platform("qq"))
        .unwrap();

    assert!(Arc::ptr_eq(&child, &again));
    assert_eq!(child.parent(), Some(by_platform.handle()));
    assert_eq!(by_platform.children(), vec![child.handle()]);
    assert!(by_conversation.children().is_empty());
}

#[tokio::test]
async fn test_runtime_rejects_blank_tenant() {
    let runtime = Runtime::default();
    let err = runtime.resolve_context("  ", "a1", None, None).unwrap_err();
    assert!(matches!(err, IsolationError::Configuration(_)));

    let ctx = runtime
        .resolve_context("t1", "a1", Some("qq"), Some(""))
        .unwrap();
    assert_eq!(ctx.scope().conversation_id(), None);
}

#[tokio::test]
async fn test_collaborators_are_isolated_per_scope() {
    let runtime = Runtime::default();
    let a = runtime.resolve_context("t1", "a1", None, None).unwrap();
    let b = runtime.resolve_context("t2", "a1", None, None).unwrap();

    a.memory().unwrap().remember("favourite", serde_json::json!("tea"));
    assert_eq!(b.memory().unwrap().recall("favourite"), None);
    assert_eq!(
        a.config().unwrap().get("tenant_id"),
        Some(serde_json::json!("t1"))
    );
}

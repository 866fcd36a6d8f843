// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Application layer: the stateful services that own contexts, route events,
//! store results and run plugins, wired together by [`runtime::Runtime`].

pub mod context_registry;
pub mod event_router;
pub mod maintenance;
pub mod plugin_executor;
pub mod policy_registry;
pub mod result_store;
pub mod runtime;
pub mod violation_log;

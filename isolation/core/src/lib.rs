// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Enclave core
//!
//! Isolation-scoping runtime for multi-tenant chat agents: scope identity,
//! context lifecycle, scope-aware event routing and sandboxed plugin
//! execution.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Owns every isolation component behind [`application::runtime::Runtime`]

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
pub use application::runtime::Runtime;

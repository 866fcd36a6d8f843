// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain model
//!
//! Scope identity, contexts, event envelopes, handler contracts, sandbox
//! policy and the plugin contract.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Pure types and rules shared by every runtime component

pub mod scope;
pub mod error;
pub mod violation;
pub mod collaborators;
pub mod context;
pub mod event;
pub mod handler;
pub mod result;
pub mod sandbox;
pub mod plugin;
pub mod events;
pub mod runtime_config;

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod event_bus;
pub mod sandbox;
pub mod collaborators;

pub use event_bus::{DomainEvent, EventBus, EventBusError, EventReceiver};
pub use sandbox::{ResourceProbe, ProcResourceProbe, Sandbox, SandboxCapabilities, SandboxSession};

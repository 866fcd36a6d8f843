// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Isolation Error Taxonomy
//!
//! Every component error converts into [`IsolationError`] at the runtime
//! boundary.
//!
//! | Variant | Raised by | Retried |
//! |---------|-----------|---------|
//! | `Configuration` | malformed scope, bad config | no, fatal to caller |
//! | `Permission` | plugin/handler not allowed in scope | no, never started |
//! | `ResourceLimit` | sandbox threshold crossed | no, invocation fails |
//! | `HandlerExecution` | handler returned an error | yes, up to `max_attempts` |
//! | `Timeout` | deadline exceeded | yes, same budget |
//! | `Cancelled` | caller-initiated | never |

use thiserror::Error;

use crate::domain::violation::ViolationKind;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum IsolationError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Resource limit violated ({kind}): {description}")]
    ResourceLimit {
        kind: ViolationKind,
        description: String,
    },

    #[error("Handler '{handler}' failed: {message}")]
    HandlerExecution { handler: String, message: String },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl IsolationError {
    /// Whether the router may resubmit work that failed with this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IsolationError::HandlerExecution { .. } | IsolationError::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(IsolationError::Timeout("x".into()).is_retryable());
        assert!(IsolationError::HandlerExecution {
            handler: "h".into(),
            message: "boom".into()
        }
        .is_retryable());
        assert!(!IsolationError::Cancelled("x".into()).is_retryable());
        assert!(!IsolationError::Permission("x".into()).is_retryable());
        assert!(!IsolationError::Configuration("x".into()).is_retryable());
    }
}

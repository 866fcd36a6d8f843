// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Sandbox policy lookup: tier presets plus named custom policies loaded from
//! configuration or registered at runtime.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::info;

use crate::domain::error::IsolationError;
use crate::domain::sandbox::{SandboxPolicy, SecurityLevel};

pub struct PolicyRegistry {
    default_level: SecurityLevel,
    custom: RwLock<BTreeMap<String, SandboxPolicy>>,
}

impl PolicyRegistry {
    pub fn new(default_level: SecurityLevel, custom: BTreeMap<String, SandboxPolicy>) -> Self {
        Self {
            default_level,
            custom: RwLock::new(custom),
        }
    }

    pub fn default_level(&self) -> SecurityLevel {
        self.default_level
    }

    pub fn preset(&self, level: SecurityLevel) -> SandboxPolicy {
        SandboxPolicy::preset(level)
    }

    pub fn default_policy(&self) -> SandboxPolicy {
        SandboxPolicy::preset(self.default_level)
    }

    pub fn register_custom(&self, name: impl Into<String>, policy: SandboxPolicy) {
        let name = name.into();
        info!(policy = %name, level = %policy.level, "Registered custom sandbox policy");
        self.custom.write().insert(name, policy);
    }

    pub fn remove_custom(&self, name: &str) -> bool {
        self.custom.write().remove(name).is_some()
    }

    /// Named custom policy when `custom` is given, otherwise the preset for
    /// `level`.
    pub fn get(&self, level: SecurityLevel, custom: Option<&str>) -> Result<SandboxPolicy, IsolationError> {
        match custom {
            Some(name) => self.custom.read().get(name).cloned().ok_or_else(|| {
                IsolationError::Configuration(format!("unknown sandbox policy '{name}'"))
            }),
            None => Ok(SandboxPolicy::preset(level)),
        }
    }

    pub fn custom_names(&self) -> Vec<String> {
        self.custom.read().keys().cloned().collect()
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new(SecurityLevel::default(), BTreeMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_get_preset_and_custom() {
        let registry = PolicyRegistry::default();
        assert_eq!(registry.default_level(), SecurityLevel::Medium);
        assert_eq!(
            registry.get(SecurityLevel::High, None).unwrap(),
            SandboxPolicy::preset(SecurityLevel::High)
        );

        let tight = SandboxPolicy::preset(SecurityLevel::Low).with_wall_time(Duration::from_secs(1));
        registry.register_custom("tight", tight.clone());
        assert_eq!(registry.get(SecurityLevel::High, Some("tight")).unwrap(), tight);
        assert_eq!(registry.custom_names(), vec!["tight".to_string()]);
        assert!(registry.remove_custom("tight"));
        assert!(registry.get(SecurityLevel::High, Some("tight")).is_err());
    }
}

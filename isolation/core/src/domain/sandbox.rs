// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Sandbox Policy
//!
//! Declarative resource and capability budget for one plugin invocation.
//!
//! | Tier | Memory | CPU | Wall | Network/Files | Modules |
//! |------|--------|-----|------|---------------|---------|
//! | `low` | 1024 MB | 30s | 120s | allowed | unrestricted |
//! | `medium` | 512 MB | 10s | 30s | denied | deny os, sys, subprocess, socket |
//! | `high` | 256 MB | 5s | 15s | denied | deny adds urllib, http, ftplib |
//! | `maximum` | 128 MB | 2s | 10s | denied | allow-list only |
//!
//! Every check evaluates the denied entries first; a denied entry beats an
//! allowed one on conflict. Interposition of module and file checks is only
//! switched on at `high` and `maximum`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::domain::violation::ViolationKind;

/// Modules refused at `high` and `maximum` regardless of the policy lists.
pub const DANGEROUS_MODULES: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "shutil",
    "tempfile",
    "glob",
    "socket",
    "urllib",
    "http",
    "ftplib",
    "smtplib",
    "ctypes",
    "threading",
    "multiprocessing",
    "asyncio",
    "pickle",
    "marshal",
    "importlib",
    "imp",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Low,
    #[default]
    Medium,
    High,
    Maximum,
}

impl SecurityLevel {
    pub const ALL: [SecurityLevel; 4] = [
        SecurityLevel::Low,
        SecurityLevel::Medium,
        SecurityLevel::High,
        SecurityLevel::Maximum,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityLevel::Low => "low",
            SecurityLevel::Medium => "medium",
            SecurityLevel::High => "high",
            SecurityLevel::Maximum => "maximum",
        }
    }

    /// Whether module and file interposition is active at this tier.
    pub fn interposes(&self) -> bool {
        matches!(self, SecurityLevel::High | SecurityLevel::Maximum)
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(SecurityLevel::Low),
            "medium" => Ok(SecurityLevel::Medium),
            "high" => Ok(SecurityLevel::High),
            "maximum" | "max" => Ok(SecurityLevel::Maximum),
            other => Err(format!("unknown security level '{other}'")),
        }
    }
}

/// Reason a capability request was refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyDenial {
    #[error("module '{module}' denied: {reason}")]
    Module { module: String, reason: String },

    #[error("path '{path}' denied: {reason}")]
    Path { path: String, reason: String },

    #[error("network access to '{host}' denied")]
    Network { host: String },
}

impl PolicyDenial {
    pub fn kind(&self) -> ViolationKind {
        match self {
            PolicyDenial::Module { .. } => ViolationKind::Module,
            PolicyDenial::Path { .. } => ViolationKind::File,
            PolicyDenial::Network { .. } => ViolationKind::Network,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxPolicy {
    pub level: SecurityLevel,
    pub max_memory_mb: u64,
    #[serde(with = "humantime_serde")]
    pub max_cpu_time: Duration,
    #[serde(with = "humantime_serde")]
    pub max_wall_time: Duration,
    #[serde(default)]
    pub allow_network: bool,
    #[serde(default)]
    pub allow_filesystem: bool,
    #[serde(default)]
    pub allowed_modules: BTreeSet<String>,
    #[serde(default)]
    pub denied_modules: BTreeSet<String>,
    #[serde(default)]
    pub allowed_paths: Vec<PathBuf>,
    #[serde(default)]
    pub denied_paths: Vec<PathBuf>,
    #[serde(default = "default_max_processes")]
    pub max_processes: u32,
    #[serde(default = "default_max_files")]
    pub max_files: u32,
}

fn default_max_processes() -> u32 {
    1
}

fn default_max_files() -> u32 {
    100
}

fn modules(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|m| m.to_string()).collect()
}

impl SandboxPolicy {
    pub fn preset(level: SecurityLevel) -> Self {
        match level {
            SecurityLevel::Low => Self {
                level,
                max_memory_mb: 1024,
                max_cpu_time: Duration::from_secs(30),
                max_wall_time: Duration::from_secs(120),
                allow_network: true,
                allow_filesystem: true,
                allowed_modules: BTreeSet::new(),
                denied_modules: BTreeSet::new(),
                allowed_paths: Vec::new(),
                denied_paths: Vec::new(),
                max_processes: 5,
                max_files: 100,
            },
            SecurityLevel::Medium => Self {
                level,
                max_memory_mb: 512,
                max_cpu_time: Duration::from_secs(10),
                max_wall_time: Duration::from_secs(30),
                allow_network: false,
                allow_filesystem: false,
                allowed_modules: BTreeSet::new(),
                denied_modules: modules(&["os", "sys", "subprocess", "socket"]),
                allowed_paths: Vec::new(),
                denied_paths: Vec::new(),
                max_processes: 1,
                max_files: 100,
            },
            SecurityLevel::High => Self {
                level,
                max_memory_mb: 256,
                max_cpu_time: Duration::from_secs(5),
                max_wall_time: Duration::from_secs(15),
                allow_network: false,
                allow_filesystem: false,
                allowed_modules: BTreeSet::new(),
                denied_modules: modules(&[
                    "os", "sys", "subprocess", "socket", "urllib", "http", "ftplib",
                ]),
                allowed_paths: Vec::new(),
                denied_paths: Vec::new(),
                max_processes: 1,
                max_files: 50,
            },
            SecurityLevel::Maximum => Self {
                level,
                max_memory_mb: 128,
                max_cpu_time: Duration::from_secs(2),
                max_wall_time: Duration::from_secs(10),
                allow_network: false,
                allow_filesystem: false,
                allowed_modules: modules(&["math", "random", "datetime", "json", "re"]),
                denied_modules: modules(&[
                    "os", "sys", "subprocess", "socket", "urllib", "http", "ftplib", "pickle",
                ]),
                allowed_paths: Vec::new(),
                denied_paths: Vec::new(),
                max_processes: 1,
                max_files: 10,
            },
        }
    }

    pub fn with_wall_time(mut self, max_wall_time: Duration) -> Self {
        self.max_wall_time = max_wall_time;
        self
    }

    pub fn with_memory_mb(mut self, max_memory_mb: u64) -> Self {
        self.max_memory_mb = max_memory_mb;
        self
    }

    pub fn allow_module(mut self, module: impl Into<String>) -> Self {
        self.allowed_modules.insert(module.into());
        self
    }

    pub fn deny_module(mut self, module: impl Into<String>) -> Self {
        self.denied_modules.insert(module.into());
        self
    }

    pub fn allow_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.allowed_paths.push(path.into());
        self
    }

    pub fn deny_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.denied_paths.push(path.into());
        self
    }

    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_mb.saturating_mul(1024 * 1024)
    }

    /// Module import check. A dotted name is judged by its root package.
    pub fn check_module(&self, name: &str) -> Result<(), PolicyDenial> {
        let root = name.split('.').next().unwrap_or(name);
        let deny = |reason: &str| PolicyDenial::Module {
            module: name.to_string(),
            reason: reason.to_string(),
        };

        if self.denied_modules.contains(name) || self.denied_modules.contains(root) {
            return Err(deny("listed in denied modules"));
        }
        if self.level.interposes() && DANGEROUS_MODULES.contains(&root) {
            return Err(deny(&format!("refused at {} security level", self.level)));
        }
        if !self.allowed_modules.is_empty()
            && !self.allowed_modules.contains(name)
            && !self.allowed_modules.contains(root)
        {
            return Err(deny("not in allowed modules"));
        }
        Ok(())
    }

    /// File access check. Paths containing `..` are refused outright.
    pub fn check_path(&self, path: &Path) -> Result<(), PolicyDenial> {
        let deny = |reason: &str| PolicyDenial::Path {
            path: path.display().to_string(),
            reason: reason.to_string(),
        };

        if path.components().any(|c| c == Component::ParentDir) {
            return Err(deny("path traversal"));
        }
        if self.denied_paths.iter().any(|denied| path.starts_with(denied)) {
            return Err(deny("under a denied path"));
        }
        if !self.allowed_paths.is_empty() {
            return if self.allowed_paths.iter().any(|allowed| path.starts_with(allowed)) {
                Ok(())
            } else {
                Err(deny("outside allowed paths"))
            };
        }
        if !self.allow_filesystem {
            return Err(deny("filesystem access disabled"));
        }
        Ok(())
    }

    pub fn check_network(&self, host: &str) -> Result<(), PolicyDenial> {
        if self.allow_network {
            Ok(())
        } else {
            Err(PolicyDenial::Network {
                host: host.to_string(),
            })
        }
    }
}

/// Error surfaced to plugin code when the sandbox refuses a request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SandboxError {
    #[error("sandbox denied request: {0}")]
    Denied(#[from] PolicyDenial),

    #[error("sandbox session is no longer active")]
    Inactive,

    #[error("I/O error: {0}")]
    Io(String),
}

/// Interposition surface handed to plugin code for the duration of one
/// invocation. Plugins route module loads, file opens and outbound
/// connections through it instead of reaching for the host directly.
///
/// These checks are cooperative. Native code that bypasses the trait is not
/// contained. Wall time, memory, CPU time and thread count are watched from
/// outside the plugin.
pub trait SandboxAccess: Send + Sync {
    fn level(&self) -> SecurityLevel;

    fn require_module(&self, module: &str) -> Result<(), SandboxError>;

    fn check_path(&self, path: &Path) -> Result<(), SandboxError>;

    fn open_file(&self, path: &Path) -> Result<std::fs::File, SandboxError>;

    fn connect(&self, host: &str) -> Result<(), SandboxError>;
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self::preset(SecurityLevel::Medium)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_tighten_monotonically() {
        let budgets: Vec<u64> = SecurityLevel::ALL
            .iter()
            .map(|l| SandboxPolicy::preset(*l).max_memory_mb)
            .collect();
        assert_eq!(budgets, vec![1024, 512, 256, 128]);
        let low = SandboxPolicy::preset(SecurityLevel::Low);
        assert!(low.allow_network && low.allow_filesystem);
        assert_eq!(low.max_processes, 5);
        assert_eq!(SandboxPolicy::preset(SecurityLevel::Maximum).max_files, 10);
    }

    #[test]
    fn test_denied_module_beats_allowed() {
        let policy = SandboxPolicy::preset(SecurityLevel::Low)
            .allow_module("requests")
            .deny_module("requests");
        assert!(matches!(
            policy.check_module("requests"),
            Err(PolicyDenial::Module { .. })
        ));
        assert!(policy.check_module("requests.adapters").is_err());
        assert!(policy.check_module("math").is_err());
    }

    #[test]
    fn test_high_refuses_dangerous_modules() {
        let high = SandboxPolicy::preset(SecurityLevel::High);
        assert!(high.check_module("pickle").is_err());
        assert!(high.check_module("os.path").is_err());
        assert!(high.check_module("json").is_ok());

        let medium = SandboxPolicy::preset(SecurityLevel::Medium);
        assert!(medium.check_module("pickle").is_ok());
        assert!(medium.check_module("os").is_err());
    }

    #[test]
    fn test_maximum_is_allow_list_only() {
        let max = SandboxPolicy::preset(SecurityLevel::Maximum);
        assert!(max.check_module("math").is_ok());
        assert!(max.check_module("yaml").is_err());
    }

    #[test]
    fn test_denied_path_beats_allowed_path() {
        let policy = SandboxPolicy::preset(SecurityLevel::High)
            .allow_path("/data")
            .deny_path("/data/secrets");
        assert!(policy.check_path(Path::new("/data/report.txt")).is_ok());
        assert!(policy.check_path(Path::new("/data/secrets/key")).is_err());
        assert!(policy.check_path(Path::new("/etc/passwd")).is_err());
        assert!(policy.check_path(Path::new("/data/../etc/passwd")).is_err());
    }

    #[test]
    fn test_filesystem_flag() {
        let low = SandboxPolicy::preset(SecurityLevel::Low);
        assert!(low.check_path(Path::new("/tmp/x")).is_ok());
        let medium = SandboxPolicy::preset(SecurityLevel::Medium);
        let denial = medium.check_path(Path::new("/tmp/x")).unwrap_err();
        assert_eq!(denial.kind(), ViolationKind::File);
    }

    #[test]
    fn test_network_flag() {
        assert!(SandboxPolicy::preset(SecurityLevel::Low)
            .check_network("example.com")
            .is_ok());
        assert_eq!(
            SandboxPolicy::preset(SecurityLevel::Medium)
                .check_network("example.com")
                .unwrap_err()
                .kind(),
            ViolationKind::Network
        );
    }

    #[test]
    fn test_policy_yaml_uses_humantime() {
        let yaml = serde_yaml::to_string(&SandboxPolicy::preset(SecurityLevel::High)).unwrap();
        assert!(yaml.contains("max_wall_time: 15s"));
        let back: SandboxPolicy = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, SandboxPolicy::preset(SecurityLevel::High));
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!("HIGH".parse::<SecurityLevel>().unwrap(), SecurityLevel::High);
        assert_eq!("max".parse::<SecurityLevel>().unwrap(), SecurityLevel::Maximum);
        assert!("extreme".parse::<SecurityLevel>().is_err());
    }
}

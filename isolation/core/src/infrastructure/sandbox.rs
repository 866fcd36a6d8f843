// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Sandbox Sessions
//!
//! [`Sandbox::enter`] opens a [`SandboxSession`] for one plugin invocation:
//!
//! - a monitor task samples wall clock, memory, CPU time and thread count at
//!   entry and every `poll_interval`. Growth past the memory, CPU or process
//!   budget records one `memory`, `cpu` or `process` violation per session;
//!   crossing `max_wall_time` records one `time` violation and trips the
//!   session deadline token.
//! - [`SandboxCapabilities`] is the interposition surface handed to plugin
//!   code. Module and file checks are live only at `high`/`maximum`; network
//!   checks always apply. Denials come back as [`SandboxError`] values the
//!   plugin may handle, and each one is recorded as a violation.
//!
//! `finish()` and `Drop` both stop the monitor and disable the capabilities,
//! so a plugin that stashes its handle cannot use it after the invocation.
//!
//! Resources are sampled process-wide, so concurrent invocations see each
//! other's growth. The checks are policy advice for cooperative plugins and
//! do not confine native code.

use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::plugin::ResourceUsage;
use crate::domain::sandbox::{PolicyDenial, SandboxAccess, SandboxError, SandboxPolicy, SecurityLevel};
use crate::domain::scope::Scope;
use crate::domain::violation::{Violation, ViolationKind};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Source of process resource readings. A reading the platform cannot
/// supply is `None` and its budget goes unchecked.
pub trait ResourceProbe: Send + Sync {
    fn resident_bytes(&self) -> Option<u64>;

    /// User plus system CPU time consumed by the process so far.
    fn cpu_time(&self) -> Option<Duration> {
        None
    }

    /// Threads currently alive in the process.
    fn thread_count(&self) -> Option<u32> {
        None
    }
}

/// Reads `/proc/self/{statm,stat,status}`. Yields `None` on platforms
/// without procfs.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcResourceProbe;

impl ProcResourceProbe {
    // statm reports pages; 4 KiB pages assumed.
    const PAGE_SIZE: u64 = 4096;
    // USER_HZ on every mainstream Linux build.
    const CLOCK_TICKS_PER_SEC: u64 = 100;
}

impl ResourceProbe for ProcResourceProbe {
    fn resident_bytes(&self) -> Option<u64> {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(resident_pages * Self::PAGE_SIZE)
    }

    fn cpu_time(&self) -> Option<Duration> {
        let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
        parse_cpu_ticks(&stat).map(|ticks| {
            Duration::from_millis(ticks * 1000 / Self::CLOCK_TICKS_PER_SEC)
        })
    }

    fn thread_count(&self) -> Option<u32> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        status
            .lines()
            .find_map(|line| line.strip_prefix("Threads:"))
            .and_then(|count| count.trim().parse().ok())
    }
}

/// utime + stime from a `/proc/<pid>/stat` line. The command name may hold
/// spaces, so fields are counted from its closing parenthesis.
fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    let (_, rest) = stat.rsplit_once(')')?;
    let mut fields = rest.split_whitespace().skip(11);
    let utime: u64 = fields.next()?.parse().ok()?;
    let stime: u64 = fields.next()?.parse().ok()?;
    Some(utime + stime)
}

struct SessionShared {
    policy: SandboxPolicy,
    scope: Scope,
    plugin_id: String,
    active: AtomicBool,
    deadline: CancellationToken,
    violations: Mutex<Vec<Violation>>,
    memory_flagged: AtomicBool,
    cpu_flagged: AtomicBool,
    process_flagged: AtomicBool,
    time_flagged: AtomicBool,
    baseline_bytes: Option<u64>,
    peak_bytes: AtomicU64,
    baseline_cpu: Option<Duration>,
    cpu_used_ms: AtomicU64,
    baseline_threads: Option<u32>,
    peak_threads: AtomicU32,
    samples: AtomicU32,
    files_opened: AtomicU32,
}

impl SessionShared {
    fn push_violation(&self, kind: ViolationKind, description: String) {
        warn!(
            plugin_id = %self.plugin_id,
            scope = %self.scope,
            kind = %kind,
            "Sandbox violation: {}",
            description
        );
        metrics::counter!("enclave_sandbox_violations_total", "kind" => kind.as_str()).increment(1);
        self.violations.lock().push(Violation::new(
            kind,
            description,
            self.scope.clone(),
            self.plugin_id.clone(),
        ));
    }

    fn record_time_violation(&self, elapsed: Duration) -> bool {
        if self.time_flagged.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.push_violation(
            ViolationKind::Time,
            format!(
                "wall time {:.2}s exceeds {:.2}s",
                elapsed.as_secs_f64(),
                self.policy.max_wall_time.as_secs_f64()
            ),
        );
        true
    }

    fn sample(&self, probe: &dyn ResourceProbe) {
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.sample_memory(probe);
        self.sample_cpu(probe);
        self.sample_threads(probe);
    }

    fn sample_memory(&self, probe: &dyn ResourceProbe) {
        let Some(current) = probe.resident_bytes() else {
            return;
        };
        self.peak_bytes.fetch_max(current, Ordering::Relaxed);
        let growth = current.saturating_sub(self.baseline_bytes.unwrap_or(0));
        if growth > self.policy.max_memory_bytes()
            && !self.memory_flagged.swap(true, Ordering::SeqCst)
        {
            self.push_violation(
                ViolationKind::Memory,
                format!(
                    "memory usage {:.2}MB exceeds {}MB",
                    growth as f64 / BYTES_PER_MB,
                    self.policy.max_memory_mb
                ),
            );
        }
    }

    fn sample_cpu(&self, probe: &dyn ResourceProbe) {
        let (Some(baseline), Some(current)) = (self.baseline_cpu, probe.cpu_time()) else {
            return;
        };
        let used = current.saturating_sub(baseline);
        self.cpu_used_ms
            .fetch_max(used.as_millis() as u64, Ordering::Relaxed);
        if used > self.policy.max_cpu_time && !self.cpu_flagged.swap(true, Ordering::SeqCst) {
            self.push_violation(
                ViolationKind::Cpu,
                format!(
                    "cpu time {:.2}s exceeds {:.2}s",
                    used.as_secs_f64(),
                    self.policy.max_cpu_time.as_secs_f64()
                ),
            );
        }
    }

    fn sample_threads(&self, probe: &dyn ResourceProbe) {
        let (Some(baseline), Some(current)) = (self.baseline_threads, probe.thread_count()) else {
            return;
        };
        self.peak_threads.fetch_max(current, Ordering::Relaxed);
        let started = current.saturating_sub(baseline);
        if started > self.policy.max_processes
            && !self.process_flagged.swap(true, Ordering::SeqCst)
        {
            self.push_violation(
                ViolationKind::Process,
                format!(
                    "{} threads started, limit is {}",
                    started, self.policy.max_processes
                ),
            );
        }
    }

    fn ensure_active(&self) -> Result<(), SandboxError> {
        if self.active.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SandboxError::Inactive)
        }
    }

    fn deny(&self, denial: PolicyDenial) -> SandboxError {
        self.push_violation(denial.kind(), denial.to_string());
        SandboxError::Denied(denial)
    }
}

/// Factory for per-invocation sandbox sessions.
#[derive(Clone)]
pub struct Sandbox {
    probe: Arc<dyn ResourceProbe>,
    poll_interval: Duration,
}

impl Sandbox {
    pub fn new(probe: Arc<dyn ResourceProbe>, poll_interval: Duration) -> Self {
        Self {
            probe,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Opens a session and starts its monitor. Must be called inside a tokio
    /// runtime.
    pub fn enter(
        &self,
        policy: SandboxPolicy,
        scope: Scope,
        plugin_id: impl Into<String>,
    ) -> SandboxSession {
        let baseline_bytes = self.probe.resident_bytes();
        let baseline_cpu = self.probe.cpu_time();
        let baseline_threads = self.probe.thread_count();
        let shared = Arc::new(SessionShared {
            policy,
            scope,
            plugin_id: plugin_id.into(),
            active: AtomicBool::new(true),
            deadline: CancellationToken::new(),
            violations: Mutex::new(Vec::new()),
            memory_flagged: AtomicBool::new(false),
            cpu_flagged: AtomicBool::new(false),
            process_flagged: AtomicBool::new(false),
            time_flagged: AtomicBool::new(false),
            baseline_bytes,
            peak_bytes: AtomicU64::new(baseline_bytes.unwrap_or(0)),
            baseline_cpu,
            cpu_used_ms: AtomicU64::new(0),
            baseline_threads,
            peak_threads: AtomicU32::new(baseline_threads.unwrap_or(0)),
            samples: AtomicU32::new(0),
            files_opened: AtomicU32::new(0),
        });
        let started = Instant::now();
        let stop = CancellationToken::new();

        debug!(
            plugin_id = %shared.plugin_id,
            scope = %shared.scope,
            level = %shared.policy.level,
            "Entering sandbox"
        );

        let monitor = tokio::spawn(run_monitor(
            shared.clone(),
            self.probe.clone(),
            self.poll_interval,
            started,
            stop.clone(),
        ));

        SandboxSession {
            shared,
            probe: self.probe.clone(),
            stop,
            monitor: Some(monitor),
            started,
        }
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new(Arc::new(ProcResourceProbe), Duration::from_millis(100))
    }
}

async fn run_monitor(
    shared: Arc<SessionShared>,
    probe: Arc<dyn ResourceProbe>,
    poll_interval: Duration,
    started: Instant,
    stop: CancellationToken,
) {
    let mut tick = tokio::time::interval(poll_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tick.tick() => {
                shared.sample(probe.as_ref());
                let elapsed = started.elapsed();
                if elapsed >= shared.policy.max_wall_time {
                    shared.record_time_violation(elapsed);
                    shared.deadline.cancel();
                    break;
                }
            }
        }
    }
}

/// Live sandbox for one invocation.
pub struct SandboxSession {
    shared: Arc<SessionShared>,
    probe: Arc<dyn ResourceProbe>,
    stop: CancellationToken,
    monitor: Option<JoinHandle<()>>,
    started: Instant,
}

/// What a finished session observed.
#[derive(Debug, Clone, Default)]
pub struct SandboxReport {
    pub violations: Vec<Violation>,
    pub resource_usage: ResourceUsage,
    pub time_exceeded: bool,
}

impl SandboxSession {
    pub fn capabilities(&self) -> SandboxCapabilities {
        SandboxCapabilities {
            shared: self.shared.clone(),
        }
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.shared.policy
    }

    /// Tripped by the monitor when `max_wall_time` is crossed.
    pub fn deadline(&self) -> CancellationToken {
        self.shared.deadline.clone()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Records the wall-clock overrun unless the monitor already did.
    pub fn record_time_violation(&self) -> bool {
        self.shared.record_time_violation(self.started.elapsed())
    }

    pub fn violation_count(&self) -> usize {
        self.shared.violations.lock().len()
    }

    /// Stops the monitor, disables the capabilities and returns what the
    /// session saw. A last sample is taken so short invocations are measured.
    pub fn finish(mut self) -> SandboxReport {
        self.shutdown();
        let shared = &self.shared;
        shared.sample(self.probe.as_ref());
        let peak = shared.peak_bytes.load(Ordering::Relaxed);
        SandboxReport {
            violations: std::mem::take(&mut *shared.violations.lock()),
            resource_usage: ResourceUsage {
                peak_memory_bytes: shared.baseline_bytes.map(|_| peak),
                cpu_time_ms: shared
                    .baseline_cpu
                    .map(|_| shared.cpu_used_ms.load(Ordering::Relaxed)),
                peak_threads: shared
                    .baseline_threads
                    .map(|_| shared.peak_threads.load(Ordering::Relaxed)),
                wall_time_ms: self.started.elapsed().as_millis() as u64,
                samples: shared.samples.load(Ordering::Relaxed),
            },
            time_exceeded: shared.time_flagged.load(Ordering::SeqCst),
        }
    }

    fn shutdown(&mut self) {
        self.shared.active.store(false, Ordering::SeqCst);
        self.stop.cancel();
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}

impl Drop for SandboxSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Interposition handle for plugin code.
#[derive(Clone)]
pub struct SandboxCapabilities {
    shared: Arc<SessionShared>,
}

impl SandboxCapabilities {
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }
}

impl SandboxAccess for SandboxCapabilities {
    fn level(&self) -> SecurityLevel {
        self.shared.policy.level
    }

    fn require_module(&self, module: &str) -> Result<(), SandboxError> {
        self.shared.ensure_active()?;
        if !self.shared.policy.level.interposes() {
            return Ok(());
        }
        self.shared
            .policy
            .check_module(module)
            .map_err(|denial| self.shared.deny(denial))
    }

    fn check_path(&self, path: &Path) -> Result<(), SandboxError> {
        self.shared.ensure_active()?;
        if !self.shared.policy.level.interposes() {
            return Ok(());
        }
        self.shared
            .policy
            .check_path(path)
            .map_err(|denial| self.shared.deny(denial))
    }

    fn open_file(&self, path: &Path) -> Result<std::fs::File, SandboxError> {
        self.check_path(path)?;
        if self.shared.policy.level.interposes() {
            let opened = self.shared.files_opened.fetch_add(1, Ordering::SeqCst) + 1;
            if opened > self.shared.policy.max_files {
                return Err(self.shared.deny(PolicyDenial::Path {
                    path: path.display().to_string(),
                    reason: format!("open file budget of {} exhausted", self.shared.policy.max_files),
                }));
            }
        }
        std::fs::File::open(path).map_err(|e| SandboxError::Io(e.to_string()))
    }

    fn connect(&self, host: &str) -> Result<(), SandboxError> {
        self.shared.ensure_active()?;
        self.shared
            .policy
            .check_network(host)
            .map_err(|denial| self.shared.deny(denial))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe(AtomicU64);

    impl ResourceProbe for FixedProbe {
        fn resident_bytes(&self) -> Option<u64> {
            Some(self.0.load(Ordering::SeqCst))
        }
    }

    fn scope() -> Scope {
        Scope::agent("t1", "a1").unwrap()
    }

    #[derive(Default)]
    struct BusyProbe {
        cpu_ms: AtomicU64,
        threads: AtomicU32,
    }

    impl ResourceProbe for BusyProbe {
        fn resident_bytes(&self) -> Option<u64> {
            Some(0)
        }

        fn cpu_time(&self) -> Option<Duration> {
            Some(Duration::from_millis(self.cpu_ms.load(Ordering::SeqCst)))
        }

        fn thread_count(&self) -> Option<u32> {
            Some(self.threads.load(Ordering::SeqCst))
        }
    }

    #[test]
    fn test_parse_cpu_ticks_skips_command_name() {
        let stat = "4242 (my (odd) cmd) S 1 4242 4242 0 -1 4194560 500 0 0 0 37 5 0 0 20 0 9 0";
        assert_eq!(parse_cpu_ticks(stat), Some(42));
        assert_eq!(parse_cpu_ticks("garbage"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cpu_and_thread_budgets_flagged_once() {
        let probe = Arc::new(BusyProbe::default());
        probe.cpu_ms.store(1_000, Ordering::SeqCst);
        probe.threads.store(8, Ordering::SeqCst);
        let sandbox = Sandbox::new(probe.clone(), Duration::from_millis(10));
        let mut policy = SandboxPolicy::preset(SecurityLevel::High);
        policy.max_cpu_time = Duration::from_millis(100);
        policy.max_processes = 1;
        let session = sandbox.enter(policy, scope(), "busy");

        probe.cpu_ms.store(1_500, Ordering::SeqCst);
        probe.threads.store(11, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(35)).await;
        probe.cpu_ms.store(2_000, Ordering::SeqCst);

        let report = session.finish();
        let count = |kind: ViolationKind| report.violations.iter().filter(|v| v.kind == kind).count();
        assert_eq!(count(ViolationKind::Cpu), 1);
        assert_eq!(count(ViolationKind::Process), 1);
        assert_eq!(report.resource_usage.cpu_time_ms, Some(1_000));
        assert_eq!(report.resource_usage.peak_threads, Some(11));
    }

    #[tokio::test]
    async fn test_budgets_unchecked_without_readings() {
        let sandbox = Sandbox::new(Arc::new(FixedProbe(AtomicU64::new(0))), Duration::from_millis(10));
        let mut policy = SandboxPolicy::preset(SecurityLevel::High);
        policy.max_cpu_time = Duration::ZERO;
        policy.max_processes = 0;
        let report = sandbox.enter(policy, scope(), "quiet").finish();
        assert!(report.violations.is_empty());
        assert_eq!(report.resource_usage.cpu_time_ms, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wall_time_trips_deadline_once() {
        let sandbox = Sandbox::new(Arc::new(FixedProbe(AtomicU64::new(0))), Duration::from_millis(50));
        let policy = SandboxPolicy::preset(SecurityLevel::Medium).with_wall_time(Duration::from_millis(200));
        let session = sandbox.enter(policy, scope(), "slow");

        session.deadline().cancelled().await;
        assert!(session.elapsed() >= Duration::from_millis(200));
        assert!(!session.record_time_violation());

        let report = session.finish();
        assert!(report.time_exceeded);
        let time: Vec<_> = report
            .violations
            .iter()
            .filter(|v| v.kind == ViolationKind::Time)
            .collect();
        assert_eq!(time.len(), 1);
        assert_eq!(time[0].plugin_id, "slow");
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_growth_flagged_once() {
        let probe = Arc::new(FixedProbe(AtomicU64::new(10 * 1024 * 1024)));
        let sandbox = Sandbox::new(probe.clone(), Duration::from_millis(10));
        let policy = SandboxPolicy::preset(SecurityLevel::Maximum).with_memory_mb(1);
        let session = sandbox.enter(policy, scope(), "hungry");

        probe.0.store(20 * 1024 * 1024, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(55)).await;

        let report = session.finish();
        let memory = report
            .violations
            .iter()
            .filter(|v| v.kind == ViolationKind::Memory)
            .count();
        assert_eq!(memory, 1);
        assert_eq!(report.resource_usage.peak_memory_bytes, Some(20 * 1024 * 1024));
        assert!(report.resource_usage.samples >= 2);
    }

    #[tokio::test]
    async fn test_interposition_only_at_high_and_maximum() {
        let sandbox = Sandbox::default();

        let medium = sandbox.enter(SandboxPolicy::preset(SecurityLevel::Medium), scope(), "p");
        assert!(medium.capabilities().require_module("pickle").is_ok());
        assert!(medium.capabilities().connect("example.com").is_err());
        let report = medium.finish();
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].kind, ViolationKind::Network);

        let high = sandbox.enter(SandboxPolicy::preset(SecurityLevel::High), scope(), "p");
        let caps = high.capabilities();
        let err = caps.require_module("subprocess").unwrap_err();
        assert!(matches!(err, SandboxError::Denied(PolicyDenial::Module { .. })));
        assert!(caps.require_module("json").is_ok());
        assert!(caps.check_path(Path::new("/etc/passwd")).is_err());
        let report = high.finish();
        let kinds: Vec<ViolationKind> = report.violations.iter().map(|v| v.kind).collect();
        assert_eq!(kinds, vec![ViolationKind::Module, ViolationKind::File]);
    }

    #[tokio::test]
    async fn test_capabilities_disabled_after_finish_and_drop() {
        let sandbox = Sandbox::default();
        let session = sandbox.enter(SandboxPolicy::preset(SecurityLevel::Low), scope(), "p");
        let caps = session.capabilities();
        assert!(caps.connect("example.com").is_ok());
        session.finish();
        assert!(!caps.is_active());
        assert_eq!(caps.connect("example.com"), Err(SandboxError::Inactive));

        let dropped = sandbox.enter(SandboxPolicy::preset(SecurityLevel::High), scope(), "p");
        let caps = dropped.capabilities();
        drop(dropped);
        assert_eq!(caps.require_module("json"), Err(SandboxError::Inactive));
    }

    #[tokio::test]
    async fn test_open_file_budget() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.txt");
        std::fs::write(&file, "x").unwrap();

        let mut policy = SandboxPolicy::preset(SecurityLevel::Maximum).allow_path(dir.path());
        policy.max_files = 1;
        let session = Sandbox::default().enter(policy, scope(), "reader");
        let caps = session.capabilities();
        assert!(caps.open_file(&file).is_ok());
        assert!(matches!(caps.open_file(&file), Err(SandboxError::Denied(_))));
        assert_eq!(session.violation_count(), 1);
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Event Router
//!
//! Scope-aware dispatch of [`EventEnvelope`]s to registered handlers.
//!
//! ## Matching
//!
//! A registration receives an event when it is enabled, lists the event type,
//! every filter holds, and the event scope equals or narrows the registration
//! scope. Cross-boundary types skip the scope check and reach every tenant.
//!
//! ## Ordering and delivery
//!
//! Matches are walked most specific scope first, then by descending priority,
//! then by registration order.
//!
//! | Mode | Execution | Can affect publisher |
//! |------|-----------|----------------------|
//! | non-intercepting | detached task per delivery, tracked per handler | no |
//! | intercepting | awaited in walk order | veto, payload rewrite, failure |
//!
//! A veto or a failed intercepting delivery stops the walk; handlers after it
//! are not delivered to.
//!
//! ## Retry
//!
//! Each delivery gets its own copy of the envelope and runs up to
//! `max_attempts`, every attempt bounded by the envelope timeout. The last
//! attempt's error class decides between `Failed` and `Timeout`. Cancellation
//! ends a delivery without retry. Every delivery outcome lands in the
//! [`ResultStore`].

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::result_store::ResultStore;
use crate::domain::error::IsolationError;
use crate::domain::event::{event_types, EnvelopeError, EventEnvelope, EventId, EventStatus};
use crate::domain::events::DispatchEvent;
use crate::domain::handler::{
    EventFilter, EventHandler, HandlerError, HandlerId, HandlerOutcome, HandlerRegistration,
};
use crate::domain::result::{EventResult, ResultStatus};
use crate::domain::runtime_config::EventsConfig;
use crate::domain::scope::Scope;
use crate::infrastructure::event_bus::EventBus;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Per-attempt bound when the envelope carries no timeout.
    pub default_timeout: Duration,
    /// How long `cancel` waits for cooperative exit before aborting.
    pub cancel_grace: Duration,
    pub cross_boundary_types: BTreeSet<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::from(&EventsConfig::default())
    }
}

impl From<&EventsConfig> for RouterConfig {
    fn from(config: &EventsConfig) -> Self {
        let cross_boundary_types = if config.cross_boundary_types.is_empty() {
            event_types::CROSS_BOUNDARY.iter().map(|t| t.to_string()).collect()
        } else {
            config.cross_boundary_types.iter().cloned().collect()
        };
        Self {
            default_timeout: config.default_timeout,
            cancel_grace: config.cancel_grace,
            cross_boundary_types,
        }
    }
}

/// What the publisher learns about one `publish` call.
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    pub event_id: EventId,
    /// False when an intercepting handler vetoed or failed.
    pub continued: bool,
    /// Payload after every intercepting rewrite.
    pub payload: Value,
    pub status: EventStatus,
    pub matched: usize,
    pub dispatched: usize,
    pub halted_by: Option<HandlerId>,
    pub error: Option<IsolationError>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CancelReport {
    /// Tasks that exited within the grace period.
    pub cancelled: usize,
    /// Tasks aborted after the grace period.
    pub forced: usize,
}

impl CancelReport {
    fn merge(&mut self, other: CancelReport) {
        self.cancelled += other.cancelled;
        self.forced += other.forced;
    }
}

struct TrackedTask {
    registration: HandlerRegistration,
    envelope: EventEnvelope,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Shared by the router and every delivery task.
#[derive(Clone)]
struct Deliverer {
    results: Arc<ResultStore>,
    event_bus: EventBus,
    default_timeout: Duration,
}

#[derive(Debug)]
struct DeliveryReport {
    status: EventStatus,
    outcome: Option<HandlerOutcome>,
    error: Option<String>,
}

enum Attempt {
    Done(HandlerOutcome),
    Failed(String),
    TimedOut,
    Cancelled,
}

impl Deliverer {
    async fn deliver(
        &self,
        registration: &HandlerRegistration,
        mut envelope: EventEnvelope,
        cancel: CancellationToken,
    ) -> DeliveryReport {
        let started = Instant::now();
        let report = match self.run_attempts(registration, &mut envelope, &cancel).await {
            Ok(report) => report,
            Err(error) => DeliveryReport {
                status: EventStatus::Failed,
                outcome: None,
                error: Some(error.to_string()),
            },
        };

        let status = ResultStatus::from_event_status(report.status);
        let mut result =
            EventResult::for_delivery(&envelope, registration.id, &registration.name, status)
                .with_data(report.outcome.as_ref().and_then(|o| o.result.clone()))
                .with_execution_ms(started.elapsed().as_millis() as u64);
        if let Some(error) = &report.error {
            result = result.with_error(error.clone());
        }
        self.results.store(result);

        metrics::counter!("enclave_handler_deliveries_total", "status" => status.as_str()).increment(1);
        self.event_bus.publish_dispatch_event(DispatchEvent::DeliveryCompleted {
            event_id: envelope.id,
            handler_id: registration.id,
            status,
            attempts: envelope.attempts(),
            completed_at: Utc::now(),
        });
        report
    }

    async fn run_attempts(
        &self,
        registration: &HandlerRegistration,
        envelope: &mut EventEnvelope,
        cancel: &CancellationToken,
    ) -> Result<DeliveryReport, EnvelopeError> {
        let timeout = envelope.timeout.unwrap_or(self.default_timeout);
        loop {
            if cancel.is_cancelled() {
                envelope.cancel()?;
                return Ok(cancelled_report());
            }
            envelope.start()?;

            let attempt =
                match tokio::time::timeout(timeout, registration.handler.handle(envelope, cancel)).await
                {
                    Ok(Ok(outcome)) => Attempt::Done(outcome),
                    Ok(Err(HandlerError::Cancelled)) => Attempt::Cancelled,
                    Ok(Err(HandlerError::Failed(message))) => Attempt::Failed(message),
                    Err(_) => Attempt::TimedOut,
                };
            let attempt = match attempt {
                Attempt::Failed(_) | Attempt::TimedOut if cancel.is_cancelled() => Attempt::Cancelled,
                other => other,
            };

            let error = match attempt {
                Attempt::Done(outcome) => {
                    envelope.complete()?;
                    return Ok(DeliveryReport {
                        status: EventStatus::Done,
                        outcome: Some(outcome),
                        error: None,
                    });
                }
                Attempt::Cancelled => {
                    envelope.cancel()?;
                    return Ok(cancelled_report());
                }
                Attempt::Failed(message) => {
                    envelope.fail()?;
                    message
                }
                Attempt::TimedOut => {
                    envelope.time_out()?;
                    format!("attempt exceeded {timeout:?}")
                }
            };

            if !envelope.can_retry() {
                warn!(
                    handler = %registration.name,
                    event_id = %envelope.id,
                    attempts = envelope.attempts(),
                    status = %envelope.status(),
                    error = %error,
                    "Delivery exhausted its retry budget"
                );
                return Ok(DeliveryReport {
                    status: envelope.status(),
                    outcome: None,
                    error: Some(error),
                });
            }
            debug!(
                handler = %registration.name,
                event_id = %envelope.id,
                attempt = envelope.attempts(),
                error = %error,
                "Retrying delivery"
            );
            envelope.resubmit()?;
        }
    }
}

fn cancelled_report() -> DeliveryReport {
    DeliveryReport {
        status: EventStatus::Cancelled,
        outcome: None,
        error: Some("delivery cancelled".to_string()),
    }
}

pub struct EventRouter {
    registrations: RwLock<Vec<HandlerRegistration>>,
    next_seq: AtomicU64,
    tasks: Mutex<HashMap<HandlerId, Vec<TrackedTask>>>,
    deliverer: Deliverer,
    config: RouterConfig,
    shutdown_token: CancellationToken,
}

impl EventRouter {
    pub fn new(config: RouterConfig, results: Arc<ResultStore>, event_bus: EventBus) -> Self {
        Self {
            registrations: RwLock::new(Vec::new()),
            next_seq: AtomicU64::new(0),
            tasks: Mutex::new(HashMap::new()),
            deliverer: Deliverer {
                results,
                event_bus,
                default_timeout: config.default_timeout,
            },
            config,
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn is_cross_boundary(&self, event_type: &str) -> bool {
        self.config.cross_boundary_types.contains(event_type)
    }

    /// Registers `handler` for `event_types` at `scope` granularity.
    pub fn subscribe<I, S>(
        &self,
        handler: Arc<dyn EventHandler>,
        event_types: I,
        scope: Scope,
        filters: Vec<EventFilter>,
        priority: i32,
    ) -> HandlerId
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let registration = HandlerRegistration {
            id: HandlerId::new(),
            name: handler.name().to_string(),
            event_types: event_types.into_iter().map(Into::into).collect(),
            scope,
            filters,
            priority,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            intercepting: handler.intercepts(),
            enabled: true,
            handler,
        };
        let id = registration.id;
        info!(
            handler_id = %id,
            handler = %registration.name,
            scope = %registration.scope,
            intercepting = registration.intercepting,
            priority,
            "Registered event handler"
        );
        self.registrations.write().push(registration);
        id
    }

    /// Removes the registration and stops tracking its tasks. Running
    /// deliveries are cancelled two-phase, as by `cancel`.
    pub async fn unsubscribe(&self, handler_id: HandlerId) -> bool {
        let removed = {
            let mut registrations = self.registrations.write();
            let before = registrations.len();
            registrations.retain(|r| r.id != handler_id);
            before != registrations.len()
        };
        let tasks = self.tasks.lock().remove(&handler_id).unwrap_or_default();
        if !tasks.is_empty() {
            let report = self.drain(tasks, self.config.cancel_grace).await;
            debug!(
                handler_id = %handler_id,
                cancelled = report.cancelled,
                forced = report.forced,
                "Stopped deliveries of unsubscribed handler"
            );
        }
        removed
    }

    pub fn set_enabled(&self, handler_id: HandlerId, enabled: bool) -> bool {
        match self.registrations.write().iter_mut().find(|r| r.id == handler_id) {
            Some(registration) => {
                registration.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Registered handlers, optionally only those listing `event_type`.
    pub fn handler_count(&self, event_type: Option<&str>) -> usize {
        self.registrations
            .read()
            .iter()
            .filter(|r| event_type.map_or(true, |t| r.event_types.contains(t)))
            .count()
    }

    /// Matching registrations in dispatch order.
    pub fn matching(&self, envelope: &EventEnvelope) -> Vec<HandlerRegistration> {
        let cross_boundary = self.is_cross_boundary(&envelope.event_type);
        let mut matched: Vec<HandlerRegistration> = self
            .registrations
            .read()
            .iter()
            .filter(|r| r.matches(envelope, cross_boundary))
            .cloned()
            .collect();
        matched.sort_by_key(|r| r.order_key());
        matched
    }

    /// Routes `envelope` to every matching handler. Always yields a receipt
    /// carrying the event id, even when nothing matched.
    pub async fn publish(&self, envelope: EventEnvelope) -> PublishReceipt {
        let matched = self.matching(&envelope);
        metrics::counter!("enclave_events_published_total").increment(1);
        debug!(
            event_id = %envelope.id,
            event_type = %envelope.event_type,
            scope = %envelope.scope,
            matched = matched.len(),
            "Publishing event"
        );
        self.deliverer.event_bus.publish_dispatch_event(DispatchEvent::Published {
            event_id: envelope.id,
            event_type: envelope.event_type.clone(),
            scope: envelope.scope.clone(),
            matched_handlers: matched.len(),
            published_at: Utc::now(),
        });

        let mut receipt = PublishReceipt {
            event_id: envelope.id,
            continued: true,
            payload: envelope.payload.clone(),
            status: EventStatus::Done,
            matched: matched.len(),
            dispatched: 0,
            halted_by: None,
            error: None,
        };
        let mut current = envelope;

        for registration in matched {
            receipt.dispatched += 1;
            if !registration.intercepting {
                self.spawn_delivery(registration, current.delivery_copy());
                continue;
            }

            let report = self
                .deliverer
                .deliver(&registration, current.delivery_copy(), self.shutdown_token.child_token())
                .await;

            match report.status {
                EventStatus::Done => {
                    let outcome = report.outcome.unwrap_or_default();
                    if let Some(payload) = outcome.payload {
                        current.payload = payload;
                    }
                    if !outcome.continue_processing {
                        info!(
                            event_id = %current.id,
                            handler = %registration.name,
                            message = outcome.message.as_deref().unwrap_or(""),
                            "Intercepting handler halted the chain"
                        );
                        receipt.continued = false;
                        receipt.halted_by = Some(registration.id);
                        self.deliverer.event_bus.publish_dispatch_event(DispatchEvent::ChainHalted {
                            event_id: current.id,
                            handler_id: registration.id,
                            halted_at: Utc::now(),
                        });
                        break;
                    }
                }
                status => {
                    let message = report.error.unwrap_or_default();
                    receipt.continued = false;
                    receipt.status = status;
                    receipt.halted_by = Some(registration.id);
                    receipt.error = Some(match status {
                        EventStatus::Timeout => IsolationError::Timeout(format!(
                            "handler '{}': {}",
                            registration.name, message
                        )),
                        EventStatus::Cancelled => IsolationError::Cancelled(format!(
                            "handler '{}' was cancelled",
                            registration.name
                        )),
                        _ => IsolationError::HandlerExecution {
                            handler: registration.name.clone(),
                            message,
                        },
                    });
                    break;
                }
            }
        }

        receipt.payload = current.payload;
        receipt
    }

    /// Trips the tokens of every running task owned by `handler_id`, waits
    /// up to the grace period, then aborts whatever is still running.
    pub async fn cancel(&self, handler_id: HandlerId) -> CancelReport {
        let tasks = self.tasks.lock().remove(&handler_id).unwrap_or_default();
        let report = self.drain(tasks, self.config.cancel_grace).await;
        info!(
            handler_id = %handler_id,
            cancelled = report.cancelled,
            forced = report.forced,
            "Cancelled handler tasks"
        );
        self.deliverer.event_bus.publish_dispatch_event(DispatchEvent::HandlerCancelled {
            handler_id,
            cancelled: report.cancelled,
            forced: report.forced,
            cancelled_at: Utc::now(),
        });
        report
    }

    /// Running non-intercepting tasks, for one handler or all of them.
    pub fn running_tasks(&self, handler_id: Option<HandlerId>) -> usize {
        let mut tasks = self.tasks.lock();
        tasks.values_mut().for_each(|t| t.retain(|task| !task.handle.is_finished()));
        tasks.retain(|_, t| !t.is_empty());
        match handler_id {
            Some(id) => tasks.get(&id).map_or(0, Vec::len),
            None => tasks.values().map(Vec::len).sum(),
        }
    }

    /// Waits for tracked tasks to finish on their own, up to `timeout`.
    /// Returns false when some were still running at the deadline.
    pub async fn settle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.running_tasks(None) == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Cancels every tracked task with two-phase grace-then-abort.
    pub async fn shutdown(&self, grace: Duration) -> CancelReport {
        self.shutdown_token.cancel();
        let all: Vec<TrackedTask> = self.tasks.lock().drain().flat_map(|(_, t)| t).collect();
        let report = self.drain(all, grace).await;
        info!(
            cancelled = report.cancelled,
            forced = report.forced,
            "Event router shut down"
        );
        report
    }

    fn spawn_delivery(&self, registration: HandlerRegistration, envelope: EventEnvelope) {
        let token = self.shutdown_token.child_token();
        let deliverer = self.deliverer.clone();

        let mut tasks = self.tasks.lock();
        let owned = tasks.entry(registration.id).or_default();
        owned.retain(|task| !task.handle.is_finished());

        let task_registration = registration.clone();
        let task_envelope = envelope.clone();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            deliverer
                .deliver(&task_registration, task_envelope, task_token)
                .await;
        });
        owned.push(TrackedTask {
            registration,
            envelope,
            token,
            handle,
        });
    }

    async fn drain(&self, tasks: Vec<TrackedTask>, grace: Duration) -> CancelReport {
        let running: Vec<TrackedTask> = tasks
            .into_iter()
            .filter(|t| !t.handle.is_finished())
            .collect();
        for task in &running {
            task.token.cancel();
        }

        let deadline = Instant::now() + grace;
        let mut report = CancelReport::default();
        for mut task in running {
            match tokio::time::timeout_at(deadline, &mut task.handle).await {
                Ok(_) => report.merge(CancelReport {
                    cancelled: 1,
                    forced: 0,
                }),
                Err(_) => {
                    task.handle.abort();
                    warn!(
                        handler = %task.registration.name,
                        event_id = %task.envelope.id,
                        "Handler ignored cancellation, aborting task"
                    );
                    self.deliverer.results.store(
                        EventResult::for_delivery(
                            &task.envelope,
                            task.registration.id,
                            &task.registration.name,
                            ResultStatus::Cancelled,
                        )
                        .with_error("aborted after grace period"),
                    );
                    report.merge(CancelReport {
                        cancelled: 0,
                        forced: 1,
                    });
                }
            }
        }
        report
    }
}

//! Shutdown coordination and operation draining.
//!
//! # Drain Sequence
//! ```text
//! drain() called
//!     → broadcast to background tasks, close admission
//!     → wait for critical operations (up to soft_timeout)
//!     → wait for normal operations (up to normal_timeout)
//!     → report: Clean (exit 0) or Forced (exit 1)
//! ```
//! The whole sequence is bounded by `hard_timeout`.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use uuid::Uuid;

use crate::admission::AdmissionController;
use crate::config::ShutdownConfig;
use crate::events::{AccessEvent, EventBus};
use crate::types::Priority;

/// Drain class of a registered operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationClass {
    Critical,
    Normal,
}

impl From<Priority> for OperationClass {
    fn from(priority: Priority) -> Self {
        match priority {
            Priority::Critical => OperationClass::Critical,
            Priority::Normal | Priority::Low => OperationClass::Normal,
        }
    }
}

#[derive(Debug, Clone)]
struct Operation {
    class: OperationClass,
    label: String,
    started: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Outstanding {
    critical: usize,
    normal: usize,
}

impl Outstanding {
    fn of(&self, class: OperationClass) -> usize {
        match class {
            OperationClass::Critical => self.critical,
            OperationClass::Normal => self.normal,
        }
    }

    fn slot(&mut self, class: OperationClass) -> &mut usize {
        match class {
            OperationClass::Critical => &mut self.critical,
            OperationClass::Normal => &mut self.normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DrainOutcome {
    Clean,
    Forced,
}

#[derive(Debug, Clone, Serialize)]
pub struct DrainReport {
    pub outcome: DrainOutcome,
    pub elapsed: Duration,
    pub outstanding_critical: usize,
    pub outstanding_normal: usize,
}

impl DrainReport {
    /// Process exit code: 0 for a clean drain, 1 when work was abandoned.
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            DrainOutcome::Clean => 0,
            DrainOutcome::Forced => 1,
        }
    }
}

#[derive(Debug)]
struct Inner {
    config: ShutdownConfig,
    operations: DashMap<Uuid, Operation>,
    outstanding: watch::Sender<Outstanding>,
    tx: broadcast::Sender<()>,
    draining: AtomicBool,
    events: Arc<EventBus>,
}

/// Coordinator for graceful shutdown.
///
/// Background tasks subscribe to a broadcast signal; in-flight work registers
/// operations that the drain waits for.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl ShutdownCoordinator {
    pub fn new(config: ShutdownConfig, events: Arc<EventBus>) -> Self {
        let (tx, _) = broadcast::channel(1);
        let (outstanding, _) = watch::channel(Outstanding::default());
        Self {
            inner: Arc::new(Inner {
                config,
                operations: DashMap::new(),
                outstanding,
                tx,
                draining: AtomicBool::new(false),
                events,
            }),
        }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.inner.tx.subscribe()
    }

    /// Signal background tasks without draining.
    pub fn trigger(&self) {
        let _ = self.inner.tx.send(());
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    /// Track an operation until the returned guard is dropped.
    pub fn register(&self, class: OperationClass, label: impl Into<String>) -> OperationGuard {
        let id = Uuid::new_v4();
        self.inner.operations.insert(
            id,
            Operation {
                class,
                label: label.into(),
                started: Instant::now(),
            },
        );
        self.inner
            .outstanding
            .send_modify(|o| *o.slot(class) += 1);
        OperationGuard {
            inner: self.inner.clone(),
            id,
            class,
        }
    }

    pub fn outstanding(&self, class: OperationClass) -> usize {
        self.inner.outstanding.borrow().of(class)
    }

    /// Close admission and wait for registered operations to finish.
    pub async fn drain(&self, admission: &AdmissionController) -> DrainReport {
        let started = Instant::now();
        let config = &self.inner.config;
        self.inner.draining.store(true, Ordering::Release);
        self.trigger();
        admission.close();

        let initial = *self.inner.outstanding.borrow();
        tracing::info!(
            critical = initial.critical,
            normal = initial.normal,
            "Shutdown initiated, draining operations"
        );
        self.inner.events.publish(AccessEvent::DrainStarted {
            critical: initial.critical,
            normal: initial.normal,
        });

        let phases = async {
            let critical = self
                .wait_for(OperationClass::Critical, config.soft_timeout())
                .await;
            if !critical {
                self.log_incomplete(OperationClass::Critical);
            }
            let normal = self
                .wait_for(OperationClass::Normal, config.normal_timeout())
                .await;
            if !normal {
                self.log_incomplete(OperationClass::Normal);
            }
            critical && normal
        };

        let clean = match time::timeout_at(started + config.hard_timeout(), phases).await {
            Ok(clean) => clean,
            Err(_) => {
                tracing::warn!("Hard shutdown timeout reached, forcing exit");
                false
            }
        };

        let remaining = *self.inner.outstanding.borrow();
        let report = DrainReport {
            outcome: if clean {
                DrainOutcome::Clean
            } else {
                DrainOutcome::Forced
            },
            elapsed: started.elapsed(),
            outstanding_critical: remaining.critical,
            outstanding_normal: remaining.normal,
        };
        tracing::info!(
            outcome = ?report.outcome,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Shutdown drain finished"
        );
        self.inner.events.publish(AccessEvent::DrainFinished {
            clean,
            elapsed_ms: report.elapsed.as_millis() as u64,
        });
        report
    }

    /// Wait until no operation of `class` is outstanding, or `limit` passes.
    async fn wait_for(&self, class: OperationClass, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        let mut rx = self.inner.outstanding.subscribe();
        let mut progress = time::interval(self.inner.config.progress_interval());
        progress.tick().await;

        loop {
            let remaining = rx.borrow_and_update().of(class);
            if remaining == 0 {
                return true;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                _ = progress.tick() => {
                    tracing::info!(?class, remaining, "Waiting for operations to drain");
                }
                _ = time::sleep_until(deadline) => {
                    return rx.borrow().of(class) == 0;
                }
            }
        }
    }

    fn log_incomplete(&self, class: OperationClass) {
        for op in self.inner.operations.iter().filter(|op| op.class == class) {
            tracing::warn!(
                id = %op.key(),
                ?class,
                label = %op.label,
                running_ms = op.started.elapsed().as_millis() as u64,
                "Operation did not complete before its drain timeout"
            );
        }
    }
}

/// Keeps an operation registered until dropped.
#[derive(Debug)]
pub struct OperationGuard {
    inner: Arc<Inner>,
    id: Uuid,
    class: OperationClass,
}

impl OperationGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.inner.operations.remove(&self.id);
        let class = self.class;
        self.inner
            .outstanding
            .send_modify(|o| {
                let slot = o.slot(class);
                *slot = slot.saturating_sub(1);
            });
    }
}

/// Await background tasks for at most `budget`, aborting whatever is left.
///
/// Returns `false` if any task had to be aborted.
pub async fn join_within(tasks: Vec<JoinHandle<()>>, budget: Duration) -> bool {
    let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
    let joined = time::timeout(budget, async {
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
    })
    .await;
    if joined.is_err() {
        tracing::warn!(
            budget_ms = budget.as_millis() as u64,
            "Background tasks outlived the shutdown budget, aborting"
        );
        for handle in aborts {
            handle.abort();
        }
        return false;
    }
    true
}

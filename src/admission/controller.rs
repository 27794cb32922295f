//! Backpressure by priority.
//!
//! Utilization is admitted-but-unfinished calls over `max_queue_size`:
//! ```text
//! util <  warning            admit everything
//! warning <= util < critical  reject low
//! util >= critical           admit critical only
//! in_flight == max           reject everything
//! ```
//! Admission is a compare-and-swap on the in-flight counter, so concurrent
//! admissions never push it past `max_queue_size`.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::AdmissionConfig;
use crate::error::RpcError;
use crate::observability::metrics;
use crate::types::Priority;

#[derive(Debug)]
struct Inner {
    config: AdmissionConfig,
    in_flight: AtomicUsize,
    accepting: AtomicBool,
    admitted: [AtomicU64; 3],
    rejected: [AtomicU64; 3],
}

#[derive(Debug, Clone)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PriorityCounts {
    pub low: u64,
    pub normal: u64,
    pub critical: u64,
}

impl PriorityCounts {
    fn load(counters: &[AtomicU64; 3]) -> Self {
        Self {
            low: counters[Priority::Low.index()].load(Ordering::Relaxed),
            normal: counters[Priority::Normal.index()].load(Ordering::Relaxed),
            critical: counters[Priority::Critical.index()].load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdmissionSnapshot {
    pub in_flight: usize,
    pub max_queue_size: usize,
    pub utilization: f64,
    pub accepting: bool,
    pub admitted: PriorityCounts,
    pub rejected: PriorityCounts,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                in_flight: AtomicUsize::new(0),
                accepting: AtomicBool::new(true),
                admitted: Default::default(),
                rejected: Default::default(),
            }),
        }
    }

    fn allows(&self, priority: Priority, utilization: f64) -> bool {
        let config = &self.inner.config;
        match priority {
            Priority::Critical => true,
            Priority::Normal => utilization < config.critical_threshold,
            Priority::Low => utilization < config.warning_threshold,
        }
    }

    /// Admit a call or shed it. The permit releases its slot on drop.
    pub fn try_admit(&self, priority: Priority) -> Result<AdmissionPermit, RpcError> {
        if !self.is_accepting() {
            return Err(RpcError::ShuttingDown);
        }
        let max = self.inner.config.max_queue_size;
        let mut current = self.inner.in_flight.load(Ordering::Acquire);
        loop {
            let utilization = current as f64 / max as f64;
            if current >= max || !self.allows(priority, utilization) {
                self.inner.rejected[priority.index()].fetch_add(1, Ordering::Relaxed);
                metrics::record_admission_rejected(priority);
                tracing::debug!(%priority, utilization, "Admission rejected");
                return Err(RpcError::BackpressureRejected {
                    priority,
                    utilization,
                });
            }
            match self.inner.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.inner.admitted[priority.index()].fetch_add(1, Ordering::Relaxed);
        metrics::record_admission_in_flight(current + 1);
        Ok(AdmissionPermit {
            inner: self.inner.clone(),
        })
    }

    /// Stop admitting; every later `try_admit` returns `ShuttingDown`.
    pub fn close(&self) {
        if self.inner.accepting.swap(false, Ordering::AcqRel) {
            tracing::info!("Admission closed");
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    pub fn utilization(&self) -> f64 {
        self.in_flight() as f64 / self.inner.config.max_queue_size as f64
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        AdmissionSnapshot {
            in_flight: self.in_flight(),
            max_queue_size: self.inner.config.max_queue_size,
            utilization: self.utilization(),
            accepting: self.is_accepting(),
            admitted: PriorityCounts::load(&self.inner.admitted),
            rejected: PriorityCounts::load(&self.inner.rejected),
        }
    }
}

/// Held for the lifetime of an admitted call.
#[derive(Debug)]
pub struct AdmissionPermit {
    inner: Arc<Inner>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let left = self.inner.in_flight.fetch_sub(1, Ordering::AcqRel) - 1;
        metrics::record_admission_in_flight(left);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(max: usize) -> AdmissionController {
        AdmissionController::new(AdmissionConfig {
            max_queue_size: max,
            warning_threshold: 0.6,
            critical_threshold: 0.8,
        })
    }

    #[test]
    fn test_thresholds_by_priority() {
        let ac = controller(10);
        let mut held: Vec<AdmissionPermit> =
            (0..6).map(|_| ac.try_admit(Priority::Low).unwrap()).collect();

        // 6/10 = warning: low shed, normal still admitted.
        assert!(matches!(
            ac.try_admit(Priority::Low),
            Err(RpcError::BackpressureRejected {
                priority: Priority::Low,
                ..
            })
        ));
        held.push(ac.try_admit(Priority::Normal).unwrap());
        held.push(ac.try_admit(Priority::Normal).unwrap());

        // 8/10 = critical: only critical.
        assert!(ac.try_admit(Priority::Normal).is_err());
        held.push(ac.try_admit(Priority::Critical).unwrap());
        held.push(ac.try_admit(Priority::Critical).unwrap());

        // Full: nothing fits.
        assert!(ac.try_admit(Priority::Critical).is_err());
        assert_eq!(ac.in_flight(), 10);

        drop(held);
        assert_eq!(ac.in_flight(), 0);
        let snap = ac.snapshot();
        assert_eq!(snap.rejected.low, 1);
        assert_eq!(snap.rejected.normal, 1);
        assert_eq!(snap.rejected.critical, 1);
    }

    #[test]
    fn test_closed_rejects_with_shutting_down() {
        let ac = controller(10);
        let permit = ac.try_admit(Priority::Normal).unwrap();
        ac.close();
        assert_eq!(ac.try_admit(Priority::Critical).unwrap_err(), RpcError::ShuttingDown);
        drop(permit);
        assert_eq!(ac.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admission_never_exceeds_max() {
        let ac = controller(50);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let ac = ac.clone();
            handles.push(tokio::spawn(async move {
                let mut held = Vec::new();
                for _ in 0..100 {
                    if let Ok(p) = ac.try_admit(Priority::Critical) {
                        assert!(ac.in_flight() <= 50);
                        held.push(p);
                    }
                    if held.len() > 3 {
                        held.remove(0);
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(ac.in_flight(), 0);
    }
}

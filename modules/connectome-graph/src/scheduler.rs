//! Hands classified delta batches to a background maintenance pool.
//!
//! `on_transaction_committed` runs on the committing task: it classifies
//! the batch, and when there is work it `try_send`s a task onto a bounded
//! queue and returns. It never touches the store and never waits.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use connectome_common::{ConnectomeError, EngineConfig};

use crate::classifier::DeltaClassifier;
use crate::delta::DeltaBatch;
use crate::maintainer::{AggregateMaintainer, MaintenanceTask};
use crate::store::{CommitListener, GraphStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    QueueFull,
    ShutDown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// The batch required no maintenance.
    NoOp,
    Scheduled(Uuid),
    Rejected(RejectReason),
}

#[derive(Debug, Default)]
struct Counters {
    scheduled: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub scheduled: u64,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
}

pub struct TriggerScheduler {
    classifier: RwLock<DeltaClassifier>,
    sender: Mutex<Option<mpsc::Sender<MaintenanceTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl TriggerScheduler {
    /// Spawn the worker pool. Must be called inside a Tokio runtime.
    pub fn start<S: GraphStore>(
        maintainer: Arc<AggregateMaintainer<S>>,
        classifier: DeltaClassifier,
        config: EngineConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<MaintenanceTask>(config.queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let counters = Arc::new(Counters::default());
        let worker_count = config.workers.max(1);

        let workers = (0..worker_count)
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    rx.clone(),
                    maintainer.clone(),
                    counters.clone(),
                ))
            })
            .collect();

        info!(
            workers = worker_count,
            queue_capacity = config.queue_capacity,
            partitions = ?classifier.partitions(),
            "Trigger scheduler started"
        );

        Arc::new(Self {
            classifier: RwLock::new(classifier),
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            counters,
        })
    }

    /// Make `dataset` visible to classification.
    pub fn register_partition(&self, dataset: &str) {
        let mut classifier = match self.classifier.write() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        if classifier.add_partition(dataset) {
            debug!(dataset, "Registered partition");
        }
    }

    pub fn on_transaction_committed(&self, batch: &DeltaBatch) -> TriggerOutcome {
        // Partitions created outside `Engine::load` are learned from their Meta node.
        for dataset in DeltaClassifier::announced_partitions(batch) {
            self.register_partition(&dataset);
        }
        let classification = {
            let classifier = match self.classifier.read() {
                Ok(c) => c,
                Err(poisoned) => poisoned.into_inner(),
            };
            classifier.classify(batch)
        };
        if classification.is_empty() {
            return TriggerOutcome::NoOp;
        }
        self.submit(MaintenanceTask::from(classification))
    }

    /// Queue a task without waiting for capacity.
    pub fn submit(&self, task: MaintenanceTask) -> TriggerOutcome {
        let sender = match self.sender.lock() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let Some(sender) = sender else {
            warn!(task_id = %task.id, "Scheduler is shut down, dropping maintenance task");
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return TriggerOutcome::Rejected(RejectReason::ShutDown);
        };

        let id = task.id;
        match sender.try_send(task) {
            Ok(()) => {
                self.counters.scheduled.fetch_add(1, Ordering::Relaxed);
                debug!(task_id = %id, "Maintenance task scheduled");
                TriggerOutcome::Scheduled(id)
            }
            Err(mpsc::error::TrySendError::Full(task)) => {
                warn!(task_id = %task.id, "Maintenance queue full, dropping task");
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                TriggerOutcome::Rejected(RejectReason::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(task)) => {
                warn!(task_id = %task.id, "Maintenance queue closed, dropping task");
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                TriggerOutcome::Rejected(RejectReason::ShutDown)
            }
        }
    }

    /// Stop accepting tasks, finish everything queued, then join the pool.
    pub async fn shutdown(&self) {
        let sender = match self.sender.lock() {
            Ok(mut s) => s.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);

        let workers = match self.workers.lock() {
            Ok(mut w) => std::mem::take(&mut *w),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "Maintenance worker ended abnormally");
            }
        }
        info!(stats = ?self.stats(), "Trigger scheduler stopped");
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            scheduled: self.counters.scheduled.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }
}

impl CommitListener for TriggerScheduler {
    fn after_commit(&self, batch: &DeltaBatch) {
        self.on_transaction_committed(batch);
    }
}

async fn worker_loop<S: GraphStore>(
    worker: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<MaintenanceTask>>>,
    maintainer: Arc<AggregateMaintainer<S>>,
    counters: Arc<Counters>,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(task) = next else {
            break;
        };

        // A failed or panicking task is logged and dropped; the next
        // mutation of the partition triggers a fresh re-scan.
        match AssertUnwindSafe(maintainer.run(&task)).catch_unwind().await {
            Ok(Ok(report)) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    worker,
                    task_id = %task.id,
                    timestamped = report.timestamped,
                    recomputed = report.recomputed.len(),
                    "Maintenance task completed"
                );
            }
            Ok(Err(e)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                let failure = ConnectomeError::MaintenanceTask {
                    task_id: task.id,
                    reason: e.to_string(),
                };
                error!(worker, error = %failure, "Maintenance task failed");
            }
            Err(panic) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                let failure = ConnectomeError::MaintenanceTask {
                    task_id: task.id,
                    reason,
                };
                error!(worker, error = %failure, "Maintenance task panicked");
            }
        }
    }
    debug!(worker, "Maintenance worker exiting");
}

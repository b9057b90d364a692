//! Worker pool driving runs off a bounded queue.
//!
//! The pool:
//! 1. Scans the store for unfinished runs immediately on startup (crash recovery)
//! 2. Re-scans periodically based on `resume_interval_ms`, which also retries
//!    runs whose last step failed
//! 3. Drives queued runs on `workers` tasks; a run is driven by one task at a
//!    time since `Orchestrator::drive` holds the per-run lock

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use pociv_core::{now_ms, RunId};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::orchestrator::Orchestrator;
use crate::PipelineError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    /// Interval between resume scans.
    pub resume_interval_ms: u64,
    /// Most unfinished runs enqueued per scan.
    pub scan_limit: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1_024,
            resume_interval_ms: 30_000,
            scan_limit: 256,
        }
    }
}

/// Counters shared between the pool tasks and the handle.
#[derive(Default)]
struct SharedWorkerMetrics {
    runs_driven: AtomicU64,
    runs_completed: AtomicU64,
    step_errors: AtomicU64,
    last_scan_ms: AtomicU64,
    workers_alive: AtomicU64,
    /// Runs sitting in the queue, so a scan does not enqueue them twice.
    queued: Mutex<HashSet<RunId>>,
}

impl SharedWorkerMetrics {
    fn mark_queued(&self, run_id: RunId) -> bool {
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run_id)
    }

    fn unmark_queued(&self, run_id: &RunId) {
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run_id);
    }

    fn queued_len(&self) -> usize {
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerSnapshot {
    pub runs_driven: u64,
    pub runs_completed: u64,
    pub step_errors: u64,
    /// Last resume scan (ms since epoch), 0 before the first scan.
    pub last_scan_ms: u64,
    pub workers_alive: u64,
    pub queued: usize,
}

/// Handle for the worker pool. Clones share the same pool.
#[derive(Clone)]
pub struct WorkerPoolHandle {
    cancel: Arc<watch::Sender<bool>>,
    queue: mpsc::Sender<RunId>,
    metrics: Arc<SharedWorkerMetrics>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl WorkerPoolHandle {
    /// Queue a run for driving. Already-queued runs are not queued twice.
    pub fn enqueue(&self, run_id: RunId) -> Result<(), PipelineError> {
        enqueue(&self.queue, &self.metrics, run_id)
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            runs_driven: self.metrics.runs_driven.load(Ordering::Relaxed),
            runs_completed: self.metrics.runs_completed.load(Ordering::Relaxed),
            step_errors: self.metrics.step_errors.load(Ordering::Relaxed),
            last_scan_ms: self.metrics.last_scan_ms.load(Ordering::Relaxed),
            workers_alive: self.metrics.workers_alive.load(Ordering::Relaxed),
            queued: self.metrics.queued_len(),
        }
    }

    /// Signal all tasks to stop and wait for them. Runs being driven finish
    /// their current step sequence first; queued runs stay unfinished in the
    /// store and are picked up by the next process's startup scan.
    pub async fn shutdown(&self) {
        let _ = self.cancel.send(true);
        let tasks: Vec<_> = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "worker task ended abnormally");
            }
        }
        info!("worker pool stopped");
    }
}

fn enqueue(
    queue: &mpsc::Sender<RunId>,
    metrics: &SharedWorkerMetrics,
    run_id: RunId,
) -> Result<(), PipelineError> {
    if !metrics.mark_queued(run_id) {
        return Ok(());
    }
    queue.try_send(run_id).map_err(|e| {
        metrics.unmark_queued(&run_id);
        match e {
            mpsc::error::TrySendError::Full(_) => PipelineError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => PipelineError::Stopped,
        }
    })
}

/// Spawn the scanner and `config.workers` driver tasks.
pub fn spawn_worker_pool(orchestrator: Arc<Orchestrator>, config: WorkerConfig) -> WorkerPoolHandle {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
    let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));
    let metrics = Arc::new(SharedWorkerMetrics::default());

    info!(
        workers = config.workers,
        queue_capacity = config.queue_capacity,
        resume_interval_ms = config.resume_interval_ms,
        "starting worker pool"
    );

    let mut tasks = Vec::with_capacity(config.workers.saturating_add(1));
    for worker in 0..config.workers.max(1) {
        metrics.workers_alive.fetch_add(1, Ordering::Relaxed);
        tasks.push(tokio::spawn(run_worker(
            worker,
            Arc::clone(&orchestrator),
            Arc::clone(&queue_rx),
            cancel_rx.clone(),
            Arc::clone(&metrics),
        )));
    }
    tasks.push(tokio::spawn(run_scanner(
        config,
        orchestrator,
        queue_tx.clone(),
        cancel_rx,
        Arc::clone(&metrics),
    )));

    WorkerPoolHandle {
        cancel: Arc::new(cancel_tx),
        queue: queue_tx,
        metrics,
        tasks: Arc::new(Mutex::new(tasks)),
    }
}

async fn run_worker(
    worker: usize,
    orchestrator: Arc<Orchestrator>,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<RunId>>>,
    mut cancel_rx: watch::Receiver<bool>,
    metrics: Arc<SharedWorkerMetrics>,
) {
    loop {
        let next = tokio::select! {
            item = async { queue.lock().await.recv().await } => item,
            _ = cancel_rx.changed() => {
                if *cancel_rx.borrow() {
                    break;
                }
                continue;
            }
        };
        let Some(run_id) = next else { break };
        metrics.unmark_queued(&run_id);
        metrics.runs_driven.fetch_add(1, Ordering::Relaxed);

        match orchestrator.drive(run_id).await {
            Ok(run) => {
                if run.is_finished() {
                    metrics.runs_completed.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) if e.is_fatal() => {
                metrics.step_errors.fetch_add(1, Ordering::Relaxed);
                error!(worker, run = %run_id, error = %e, "fatal pipeline error; worker stopping");
                break;
            }
            Err(e) if e.is_run_defect() => {
                metrics.step_errors.fetch_add(1, Ordering::Relaxed);
                warn!(worker, run = %run_id, error = %e, "run quarantined; worker continues");
            }
            Err(e) => {
                metrics.step_errors.fetch_add(1, Ordering::Relaxed);
                warn!(worker, run = %run_id, error = %e, "run step failed; will retry on next scan");
            }
        }
    }
    metrics.workers_alive.fetch_sub(1, Ordering::Relaxed);
    debug!(worker, "worker exiting");
}

async fn run_scanner(
    config: WorkerConfig,
    orchestrator: Arc<Orchestrator>,
    queue: mpsc::Sender<RunId>,
    mut cancel_rx: watch::Receiver<bool>,
    metrics: Arc<SharedWorkerMetrics>,
) {
    // Run once immediately on startup (crash recovery)
    scan(&config, &orchestrator, &queue, &metrics).await;

    let mut interval =
        tokio::time::interval(Duration::from_millis(config.resume_interval_ms.max(1)));
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => scan(&config, &orchestrator, &queue, &metrics).await,
            _ = cancel_rx.changed() => {
                if *cancel_rx.borrow() {
                    debug!("resume scanner shutting down");
                    break;
                }
            }
        }
    }
}

async fn scan(
    config: &WorkerConfig,
    orchestrator: &Orchestrator,
    queue: &mpsc::Sender<RunId>,
    metrics: &SharedWorkerMetrics,
) {
    metrics.last_scan_ms.store(now_ms(), Ordering::Relaxed);
    let ids = match orchestrator.unfinished_runs(config.scan_limit).await {
        Ok(ids) => ids,
        Err(e) => {
            warn!(error = %e, "resume scan failed");
            return;
        }
    };
    let mut queued = 0usize;
    for run_id in ids {
        match enqueue(queue, metrics, run_id) {
            Ok(()) => queued += 1,
            Err(PipelineError::QueueFull) => {
                debug!("queue full; remaining runs wait for the next scan");
                break;
            }
            Err(_) => return,
        }
    }
    if queued > 0 {
        info!(queued, "resume scan enqueued unfinished runs");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::SubmitRating;
    use crate::PipelineConfig;
    use pociv_core::chain::mock_client::MockAttestationChain;
    use pociv_core::payload::AttestationSettings;
    use pociv_core::{
        ChannelId, Hash32, MessageId, MetricRatings, RatingRequest, RunRecord, RunStep, UserId,
        WalletAddress,
    };
    use pociv_storage::Storage;
    use tempfile::TempDir;

    fn orchestrator() -> (TempDir, Arc<Storage>, Arc<Orchestrator>) {
        let dir = tempfile::tempdir().expect("tmpdir");
        let storage = Arc::new(Storage::open(dir.path()).expect("open"));
        let config = PipelineConfig::new(AttestationSettings::new(
            Hash32([3; 32]),
            WalletAddress::parse("0x4200000000000000000000000000000000000021").expect("addr"),
        ));
        let orchestrator = Arc::new(
            Orchestrator::new(
                storage.clone(),
                Arc::new(MockAttestationChain::new()),
                Arc::new(crate::LoggingNotifier),
                config,
            )
            .expect("orchestrator"),
        );
        (dir, storage, orchestrator)
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn startup_scan_drives_existing_runs() {
        let (_dir, storage, orchestrator) = orchestrator();

        let mut ids = Vec::new();
        for message in 0..3u64 {
            let ack = orchestrator
                .submit_rating(SubmitRating {
                    validator: UserId(1),
                    target: UserId(2),
                    channel: ChannelId(9),
                    message: MessageId(message),
                    metrics: vec![2, 2, 2, 2, 2],
                })
                .await
                .expect("submit");
            ids.push(ack.run_id);
        }

        let pool = spawn_worker_pool(
            Arc::clone(&orchestrator),
            WorkerConfig {
                workers: 2,
                queue_capacity: 8,
                resume_interval_ms: 60_000,
                scan_limit: 16,
            },
        );
        wait_for(|| pool.snapshot().runs_completed == 3).await;
        for id in &ids {
            let run = storage.get_run(id).expect("get").expect("run");
            assert_eq!(run.step, RunStep::Notified);
        }
        // Re-enqueueing a finished run is harmless.
        pool.enqueue(ids[0]).expect("enqueue");
        wait_for(|| pool.snapshot().runs_driven == 4).await;

        assert!(pool.snapshot().last_scan_ms > 0);
        pool.shutdown().await;
        assert_eq!(pool.snapshot().workers_alive, 0);
        assert!(matches!(
            pool.enqueue(ids[1]),
            Err(PipelineError::Stopped)
        ));
    }

    #[tokio::test]
    async fn inconsistent_run_is_quarantined_and_workers_keep_going() {
        let (_dir, storage, orchestrator) = orchestrator();

        // A run recorded as scored but carrying no score.
        let mut broken = RunRecord::new(
            RatingRequest {
                validator: UserId(1),
                target: UserId(2),
                channel: ChannelId(9),
                message: MessageId(77),
                metrics: MetricRatings::try_from_slice(&[3, 3, 3, 3, 3]).expect("metrics"),
            },
            1,
        );
        broken.step = RunStep::Scored;
        storage.create_run(&broken).expect("create");

        let good = orchestrator
            .submit_rating(SubmitRating {
                validator: UserId(1),
                target: UserId(2),
                channel: ChannelId(9),
                message: MessageId(78),
                metrics: vec![2, 2, 2, 2, 2],
            })
            .await
            .expect("submit");

        let pool = spawn_worker_pool(
            Arc::clone(&orchestrator),
            WorkerConfig {
                workers: 3,
                queue_capacity: 8,
                resume_interval_ms: 20,
                scan_limit: 16,
            },
        );
        wait_for(|| {
            storage
                .get_run(&good.run_id)
                .expect("get")
                .is_some_and(|r| r.step == RunStep::Notified)
        })
        .await;
        wait_for(|| {
            storage
                .get_run(&broken.run_id)
                .expect("get")
                .is_some_and(|r| r.quarantined)
        })
        .await;

        // Several more scans pass; the quarantined run is not retried.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.snapshot().workers_alive, 3);

        let parked = storage.get_run(&broken.run_id).expect("get").expect("run");
        assert_eq!(parked.step, RunStep::Scored);
        assert_eq!(parked.step_errors, 1);
        assert!(parked
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("no score")));
        assert!(orchestrator.unfinished_runs(16).await.expect("scan").is_empty());

        // New work is still accepted and driven.
        let later = orchestrator
            .submit_rating(SubmitRating {
                validator: UserId(1),
                target: UserId(2),
                channel: ChannelId(9),
                message: MessageId(79),
                metrics: vec![2, 2, 2, 2, 2],
            })
            .await
            .expect("submit");
        pool.enqueue(later.run_id).expect("enqueue");
        wait_for(|| {
            storage
                .get_run(&later.run_id)
                .expect("get")
                .is_some_and(|r| r.step == RunStep::Notified)
        })
        .await;
        assert_eq!(pool.snapshot().workers_alive, 3);
        pool.shutdown().await;
    }
}

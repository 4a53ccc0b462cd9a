// =============================================================================
// Ingestion Coordinator — priority queue, bounded workers, deadlines, retries
// =============================================================================
//
// One dispatcher task pops the most urgent QUEUED job whenever a worker slot
// is free and spawns a worker for it. Rate-limited jobs wait in a deferred
// list until their `not_before` instant and then rejoin the heap.
//
// Lifecycle:  QUEUED → RUNNING → COMPLETED | FAILED | TIMED_OUT | CANCELLED
//             RUNNING → QUEUED  (rate-limit backpressure only)
//
// Each RUNNING stint is bounded by `job_timeout_ms`; each adapter call inside
// it by `operation_timeout_ms`. Connection-class failures are retried inside
// the stint with exponential backoff, resuming after the last finished chunk.
// =============================================================================

use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::job::{IngestionJob, JobId, JobKind, JobStatus, QueueEntry};
use super::service::{
    CandleIngestionService, IngestionConfig, IngestionResult, OperationLimits, RangeFailure,
};
use super::stats::{MemorySampler, PerformanceStatistics, RollingStats};
use crate::errors::{BrokerError, RetryClass, SubmitError, TimeoutScope};
use crate::types::Timeframe;

/// Terminal jobs kept for `get_job` / `list_jobs`.
const JOB_HISTORY_LIMIT: usize = 1000;

// =============================================================================
// Configuration
// =============================================================================

fn default_max_concurrent_jobs() -> usize {
    4
}

fn default_job_timeout_ms() -> u64 {
    600_000
}

fn default_operation_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_rate_limit_delay_ms() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

fn default_max_batch_size() -> u32 {
    5_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// Budget of one RUNNING stint.
    #[serde(default = "default_job_timeout_ms")]
    pub job_timeout_ms: u64,
    /// Budget of one adapter call.
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Used when a rate-limit response carries no `Retry-After`.
    #[serde(default = "default_rate_limit_delay_ms")]
    pub default_rate_limit_delay_ms: u64,
    #[serde(default = "default_true")]
    pub enable_batch_processing: bool,
    /// Candles per backfill chunk.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            job_timeout_ms: default_job_timeout_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            default_rate_limit_delay_ms: default_rate_limit_delay_ms(),
            enable_batch_processing: true,
            max_batch_size: default_max_batch_size(),
        }
    }
}

impl CoordinatorConfig {
    /// Delay before retry number `attempt` (1-based): base · 2^(attempt−1), capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let ms = self
            .retry_base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.retry_max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Split a backfill scope into chunks of `max_batch_size` candles.
    pub fn plan_chunks(
        &self,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        if !self.enable_batch_processing {
            return vec![(from, to)];
        }
        let candles = self.max_batch_size.clamp(1, i32::MAX as u32) as i32;
        let Some(span) = timeframe.duration().checked_mul(candles) else {
            return vec![(from, to)];
        };

        let mut chunks = Vec::new();
        let mut cursor = from;
        while cursor < to {
            let end = cursor.checked_add_signed(span).map_or(to, |end| end.min(to));
            chunks.push((cursor, end));
            cursor = end;
        }
        chunks
    }
}

// =============================================================================
// Shared state
// =============================================================================

struct QueueState {
    heap: BinaryHeap<QueueEntry>,
    /// Rate-limited jobs and the instant they become eligible again.
    deferred: Vec<(Instant, QueueEntry)>,
    jobs: HashMap<JobId, IngestionJob>,
    running: usize,
    stats: RollingStats,
}

impl QueueState {
    fn prune_history(&mut self) {
        let terminal = self.jobs.values().filter(|j| j.status.is_terminal()).count();
        if terminal <= JOB_HISTORY_LIMIT {
            return;
        }
        let mut finished: Vec<(Option<DateTime<Utc>>, JobId)> = self
            .jobs
            .values()
            .filter(|j| j.status.is_terminal())
            .map(|j| (j.completed_at, j.id))
            .collect();
        finished.sort();
        for (_, id) in finished.into_iter().take(terminal - JOB_HISTORY_LIMIT) {
            self.jobs.remove(&id);
        }
    }
}

/// Attempts spent in the current stint.
struct RetryBudget {
    used: u32,
    limited_used: bool,
}

struct Shared {
    config: CoordinatorConfig,
    services: HashMap<String, Arc<CandleIngestionService>>,
    state: Mutex<QueueState>,
    wakeup: Notify,
    running_tx: watch::Sender<usize>,
    accepting: AtomicBool,
    stop: CancellationToken,
    next_seq: AtomicU64,
    memory: MemorySampler,
}

// =============================================================================
// IngestionCoordinator
// =============================================================================

pub struct IngestionCoordinator {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl IngestionCoordinator {
    /// Register one service per broker and spawn the dispatcher. Must be
    /// called from within a tokio runtime.
    pub fn start(config: CoordinatorConfig, services: Vec<Arc<CandleIngestionService>>) -> Self {
        let services: HashMap<String, Arc<CandleIngestionService>> = services
            .into_iter()
            .map(|svc| (broker_key(svc.broker_name()), svc))
            .collect();

        info!(
            brokers = ?services.keys().collect::<Vec<_>>(),
            max_concurrent_jobs = config.max_concurrent_jobs,
            job_timeout_ms = config.job_timeout_ms,
            operation_timeout_ms = config.operation_timeout_ms,
            "Ingestion coordinator starting"
        );

        let (running_tx, _) = watch::channel(0usize);
        let shared = Arc::new(Shared {
            config,
            services,
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                deferred: Vec::new(),
                jobs: HashMap::new(),
                running: 0,
                stats: RollingStats::default(),
            }),
            wakeup: Notify::new(),
            running_tx,
            accepting: AtomicBool::new(true),
            stop: CancellationToken::new(),
            next_seq: AtomicU64::new(0),
            memory: MemorySampler::new(),
        });

        let handle = tokio::spawn(dispatch_loop(shared.clone()));

        Self {
            shared,
            dispatcher: Mutex::new(Some(handle)),
        }
    }

    // -------------------------------------------------------------------------
    // Submission
    // -------------------------------------------------------------------------

    pub fn submit_backfill_job(
        &self,
        config: IngestionConfig,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        priority: u8,
    ) -> Result<JobId, SubmitError> {
        if from >= to {
            return Err(SubmitError::InvalidRange(format!("{from} is not before {to}")));
        }
        self.shared
            .enqueue(IngestionJob::backfill(config, from, to, priority))
    }

    pub fn submit_incremental_job(
        &self,
        config: IngestionConfig,
        priority: u8,
    ) -> Result<JobId, SubmitError> {
        self.shared.enqueue(IngestionJob::incremental(config, priority))
    }

    /// Cancel a job that has not started yet. Running jobs are bounded only by
    /// their deadlines.
    pub fn cancel_job(&self, id: JobId) -> bool {
        let mut guard = self.shared.state.lock();
        let st = &mut *guard;
        let Some(job) = st.jobs.get_mut(&id) else {
            return false;
        };
        if job.status != JobStatus::Queued || !job.transition(JobStatus::Cancelled) {
            return false;
        }
        st.stats.record_outcome(JobStatus::Cancelled, None);
        info!(job_id = %id, "job cancelled");
        true
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn get_job(&self, id: JobId) -> Option<IngestionJob> {
        self.shared.state.lock().jobs.get(&id).cloned()
    }

    /// All known jobs, oldest submission first.
    pub fn list_jobs(&self) -> Vec<IngestionJob> {
        let mut jobs: Vec<IngestionJob> = self.shared.state.lock().jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub fn get_performance_statistics(&self) -> PerformanceStatistics {
        let memory = self.shared.memory.resident_bytes();
        let st = self.shared.state.lock();
        let queued = st
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .count();
        st.stats.snapshot(queued, st.running, memory)
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    /// Stop accepting work, cancel everything still queued, wait for running
    /// jobs to reach a terminal state, then stop the dispatcher.
    pub async fn graceful_shutdown(&self) {
        let (cancelled, running) = {
            let mut guard = self.shared.state.lock();
            let st = &mut *guard;
            self.shared.accepting.store(false, Ordering::SeqCst);

            let mut cancelled = 0usize;
            for job in st.jobs.values_mut() {
                if job.status == JobStatus::Queued && job.transition(JobStatus::Cancelled) {
                    st.stats.record_outcome(JobStatus::Cancelled, None);
                    cancelled += 1;
                }
            }
            st.heap.clear();
            st.deferred.clear();
            (cancelled, st.running)
        };

        info!(cancelled, running, "Graceful shutdown — draining running jobs");

        let mut rx = self.shared.running_tx.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;

        self.shared.stop.cancel();
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        info!("Ingestion coordinator stopped");
    }
}

/// A chunk error that stops the whole job instead of being recorded against
/// the chunk: anything not worth retrying, and backpressure.
fn ends_job(err: &BrokerError) -> bool {
    matches!(err.retry_class(), RetryClass::Never | RetryClass::Backpressure)
}

fn broker_key(name: &str) -> String {
    name.trim().to_ascii_uppercase()
}

// =============================================================================
// Dispatcher
// =============================================================================

async fn dispatch_loop(shared: Arc<Shared>) {
    debug!("dispatcher running");
    loop {
        let (ready, next_deferred) = shared.take_ready();
        for id in ready {
            tokio::spawn(run_job(shared.clone(), id));
        }

        tokio::select! {
            _ = shared.stop.cancelled() => break,
            _ = shared.wakeup.notified() => {}
            _ = sleep_until_next(next_deferred) => {}
        }
    }
    debug!("dispatcher exited");
}

async fn sleep_until_next(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// =============================================================================
// Worker
// =============================================================================

/// Fails the job and frees its slot if the worker unwinds before the job
/// settled, so a panic cannot leave `running` stuck and wedge shutdown.
struct WorkerGuard {
    shared: Arc<Shared>,
    id: JobId,
    settled: bool,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if !self.settled {
            self.shared.finish(
                self.id,
                JobStatus::Failed,
                None,
                Some("worker stopped before the job settled".to_string()),
            );
        }
    }
}

async fn run_job(shared: Arc<Shared>, id: JobId) {
    let mut guard = WorkerGuard {
        shared: shared.clone(),
        id,
        settled: false,
    };
    drive_job(&shared, id).await;
    guard.settled = true;
}

async fn drive_job(shared: &Shared, id: JobId) {
    let Some(job) = shared.get_job(id) else {
        shared.release_slot();
        return;
    };
    let Some(service) = shared.service_for(&job.config.broker) else {
        shared.finish(
            id,
            JobStatus::Failed,
            None,
            Some(format!("no broker registered under '{}'", job.config.broker)),
        );
        return;
    };

    info!(
        job_id = %id,
        kind = ?job.kind,
        broker = %job.config.broker,
        pair = %job.config.pair,
        timeframe = %job.config.timeframe,
        priority = job.priority,
        "job started"
    );

    let cancel = CancellationToken::new();
    let job_timeout = Duration::from_millis(shared.config.job_timeout_ms);
    let outcome = tokio::time::timeout(job_timeout, shared.execute(&job, &service, cancel.clone())).await;
    cancel.cancel();

    match outcome {
        Ok(Ok(result)) => shared.finish(id, JobStatus::Completed, Some(result), None),
        Ok(Err(err)) if err.retry_class() == RetryClass::Backpressure => shared.defer(id, &err),
        Ok(Err(err)) => shared.finish(id, JobStatus::Failed, None, Some(err.to_string())),
        Err(_) => {
            let err = BrokerError::Timeout {
                scope: TimeoutScope::Job,
                elapsed_ms: shared.config.job_timeout_ms,
            };
            shared.finish(id, JobStatus::TimedOut, None, Some(err.to_string()));
        }
    }
}

impl Shared {
    fn service_for(&self, broker: &str) -> Option<Arc<CandleIngestionService>> {
        self.services.get(&broker_key(broker)).cloned()
    }

    fn get_job(&self, id: JobId) -> Option<IngestionJob> {
        self.state.lock().jobs.get(&id).cloned()
    }

    fn enqueue(&self, job: IngestionJob) -> Result<JobId, SubmitError> {
        if self.service_for(&job.config.broker).is_none() {
            return Err(SubmitError::UnknownBroker(job.config.broker.clone()));
        }

        let id = job.id;
        let entry = QueueEntry {
            priority: job.priority,
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            id,
        };

        {
            let mut st = self.state.lock();
            // Checked under the lock so shutdown cannot miss a late submission.
            if !self.accepting.load(Ordering::SeqCst) {
                return Err(SubmitError::ShuttingDown);
            }
            info!(
                job_id = %id,
                kind = ?job.kind,
                broker = %job.config.broker,
                pair = %job.config.pair,
                timeframe = %job.config.timeframe,
                priority = job.priority,
                "job queued"
            );
            st.jobs.insert(id, job);
            st.heap.push(entry);
        }

        self.wakeup.notify_one();
        Ok(id)
    }

    /// Promote due deferred jobs, then claim as many QUEUED jobs as there are
    /// free slots. Returns the claimed ids and the next deferred wake-up.
    fn take_ready(&self) -> (Vec<JobId>, Option<Instant>) {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let st = &mut *guard;

        let mut i = 0;
        while i < st.deferred.len() {
            if st.deferred[i].0 <= now {
                let (_, entry) = st.deferred.swap_remove(i);
                st.heap.push(entry);
            } else {
                i += 1;
            }
        }

        let mut ready = Vec::new();
        while st.running < self.config.max_concurrent_jobs.max(1) {
            let Some(entry) = st.heap.pop() else {
                break;
            };
            let Some(job) = st.jobs.get_mut(&entry.id) else {
                continue;
            };
            // Cancelled while waiting.
            if job.status != JobStatus::Queued {
                continue;
            }
            if job.transition(JobStatus::Running) {
                st.running += 1;
                ready.push(entry.id);
            }
        }

        self.running_tx.send_replace(st.running);
        let next = st.deferred.iter().map(|(at, _)| *at).min();
        (ready, next)
    }

    async fn execute(
        &self,
        job: &IngestionJob,
        service: &CandleIngestionService,
        cancel: CancellationToken,
    ) -> Result<IngestionResult, BrokerError> {
        let limits = OperationLimits::new(Duration::from_millis(self.config.operation_timeout_ms), cancel);
        let mut budget = RetryBudget {
            used: job.retry_count,
            limited_used: false,
        };
        let config = &job.config;
        let priority = job.priority;
        let limits = &limits;

        match job.kind {
            JobKind::Incremental => {
                self.with_retries(job.id, &mut budget, move || {
                    service.smart_incremental_update(config, priority, limits)
                })
                .await
            }
            JobKind::Backfill => {
                let (Some(from), Some(to)) = (job.from, job.to) else {
                    return Err(BrokerError::InvalidRequest("backfill job without a range".into()));
                };
                let chunks = self.config.plan_chunks(config.timeframe, from, to);
                self.set_chunks_total(job.id, chunks.len());

                let mut total = job.progress.clone();
                let mut failed = job.chunks_failed as usize;
                let mut last_failure = None;
                for &(start, end) in chunks.iter().skip(job.chunks_completed as usize) {
                    let outcome = self
                        .with_retries(job.id, &mut budget, move || {
                            service.backfill_historical_data(config, start, end, priority, limits)
                        })
                        .await;

                    match outcome {
                        Ok(part) => {
                            total.absorb(&part);
                            self.finish_chunk(job.id, &total, false);
                        }
                        Err(err) if ends_job(&err) => return Err(err),
                        Err(err) => {
                            warn!(
                                job_id = %job.id,
                                from = %start,
                                to = %end,
                                error = %err,
                                "chunk failed after retries, moving on"
                            );
                            total.errors.push(RangeFailure {
                                from: start,
                                to: end,
                                error: err.to_string(),
                            });
                            failed += 1;
                            self.finish_chunk(job.id, &total, true);
                            last_failure = Some(err);
                        }
                    }
                }

                match last_failure {
                    Some(err) if failed == chunks.len() => Err(err),
                    _ => Ok(total),
                }
            }
        }
    }

    async fn with_retries<F, Fut>(
        &self,
        id: JobId,
        budget: &mut RetryBudget,
        mut attempt: F,
    ) -> Result<IngestionResult, BrokerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<IngestionResult, BrokerError>>,
    {
        loop {
            let err = match attempt().await {
                Ok(result) => return Ok(result),
                Err(err) => err,
            };

            let class = err.retry_class();
            let allowed = match class {
                RetryClass::WithBackoff => budget.used < self.config.max_retries,
                RetryClass::Limited => !budget.limited_used && budget.used < self.config.max_retries,
                RetryClass::Never | RetryClass::Backpressure => false,
            };
            if !allowed {
                return Err(err);
            }
            if class == RetryClass::Limited {
                budget.limited_used = true;
            }
            budget.used += 1;

            let delay = self.config.backoff_delay(budget.used);
            self.note_retry(id, budget.used, &err);
            warn!(
                job_id = %id,
                attempt = budget.used,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after failure"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn note_retry(&self, id: JobId, retry_count: u32, err: &BrokerError) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if let Some(job) = st.jobs.get_mut(&id) {
            job.retry_count = retry_count;
            job.last_error = Some(err.to_string());
        }
        st.stats.retried += 1;
    }

    fn set_chunks_total(&self, id: JobId, total: usize) {
        if let Some(job) = self.state.lock().jobs.get_mut(&id) {
            job.chunks_total = total as u32;
        }
    }

    fn finish_chunk(&self, id: JobId, progress: &IngestionResult, failed: bool) {
        if let Some(job) = self.state.lock().jobs.get_mut(&id) {
            job.progress = progress.clone();
            job.chunks_completed += 1;
            if failed {
                job.chunks_failed += 1;
            }
            debug!(
                job_id = %id,
                chunk = job.chunks_completed,
                of = job.chunks_total,
                inserted = progress.total_inserted,
                "chunk finished"
            );
        }
    }

    /// Rate-limited: back to QUEUED until the delay elapses, or CANCELLED when
    /// the coordinator is draining.
    fn defer(&self, id: JobId, err: &BrokerError) {
        let delay = err
            .retry_after()
            .unwrap_or(Duration::from_millis(self.config.default_rate_limit_delay_ms));

        let mut guard = self.state.lock();
        let st = &mut *guard;
        if let Some(job) = st.jobs.get_mut(&id) {
            job.last_error = Some(err.to_string());

            if !self.accepting.load(Ordering::SeqCst) {
                if job.transition(JobStatus::Cancelled) {
                    st.stats.record_outcome(JobStatus::Cancelled, None);
                }
                info!(job_id = %id, "rate-limited job cancelled during shutdown");
            } else if job.transition(JobStatus::Queued) {
                let wait = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                job.not_before = Some(Utc::now() + wait);
                st.deferred.push((
                    Instant::now() + delay,
                    QueueEntry {
                        priority: job.priority,
                        seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
                        id,
                    },
                ));
                st.stats.deferrals += 1;
                warn!(
                    job_id = %id,
                    delay_ms = delay.as_millis() as u64,
                    "rate limited — job returned to queue"
                );
            }
        }

        st.running = st.running.saturating_sub(1);
        self.running_tx.send_replace(st.running);
        drop(guard);
        self.wakeup.notify_one();
    }

    fn finish(&self, id: JobId, status: JobStatus, result: Option<IngestionResult>, error: Option<String>) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if let Some(job) = st.jobs.get_mut(&id) {
            if let Some(result) = result {
                job.progress = result;
            }
            if error.is_some() {
                job.last_error = error;
            }
            if job.transition(status) {
                st.stats.record_outcome(status, job.processing_time_ms());
            }

            match status {
                JobStatus::Completed => info!(
                    job_id = %id,
                    inserted = job.progress.total_inserted,
                    skipped = job.progress.total_skipped,
                    filtered = job.progress.total_filtered,
                    errors = job.progress.errors.len(),
                    retries = job.retry_count,
                    "job completed"
                ),
                _ => warn!(
                    job_id = %id,
                    status = %status,
                    retries = job.retry_count,
                    error = job.last_error.as_deref().unwrap_or(""),
                    "job ended without completing"
                ),
            }
        }

        st.running = st.running.saturating_sub(1);
        self.running_tx.send_replace(st.running);
        st.prune_history();
        drop(guard);
        self.wakeup.notify_one();
    }

    fn release_slot(&self) {
        let mut st = self.state.lock();
        st.running = st.running.saturating_sub(1);
        self.running_tx.send_replace(st.running);
        drop(st);
        self.wakeup.notify_one();
    }
}

// =============================================================================
// Tests
// =============================================================================

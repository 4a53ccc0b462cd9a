// =============================================================================
// Ingestion jobs — records, lifecycle and queue ordering
// =============================================================================

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use super::service::{IngestionConfig, IngestionResult};

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    Backfill,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }

    /// Legal lifecycle edges. Running → Queued is the backpressure path.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Queued, Running) | (Queued, Cancelled) => true,
            (Running, Queued) => true,
            (Running, Completed) | (Running, Failed) | (Running, TimedOut) | (Running, Cancelled) => {
                true
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::TimedOut => "TIMED_OUT",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Coordinator-owned job record. Clones handed out by the coordinator are
/// snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionJob {
    pub id: JobId,
    pub kind: JobKind,
    pub config: IngestionConfig,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Lower is more urgent.
    pub priority: u8,
    pub retry_count: u32,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Not eligible for dispatch before this instant (rate-limit backpressure).
    pub not_before: Option<DateTime<Utc>>,
    /// Result accumulated over the chunks completed so far.
    pub progress: IngestionResult,
    pub chunks_completed: u32,
    /// Chunks that gave up after their retries; counted in `chunks_completed`.
    pub chunks_failed: u32,
    pub chunks_total: u32,
}

impl IngestionJob {
    fn new(kind: JobKind, config: IngestionConfig, priority: u8) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            config,
            from: None,
            to: None,
            priority,
            retry_count: 0,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_error: None,
            not_before: None,
            progress: IngestionResult::default(),
            chunks_completed: 0,
            chunks_failed: 0,
            chunks_total: 0,
        }
    }

    pub fn backfill(config: IngestionConfig, from: DateTime<Utc>, to: DateTime<Utc>, priority: u8) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
            ..Self::new(JobKind::Backfill, config, priority)
        }
    }

    pub fn incremental(config: IngestionConfig, priority: u8) -> Self {
        Self::new(JobKind::Incremental, config, priority)
    }

    /// Apply a status change. Illegal edges (anything out of a terminal state
    /// included) are refused and logged.
    pub fn transition(&mut self, next: JobStatus) -> bool {
        if !self.status.can_transition_to(next) {
            warn!(job_id = %self.id, from = %self.status, to = %next, "illegal job transition refused");
            return false;
        }
        let now = Utc::now();
        match next {
            JobStatus::Running => {
                self.started_at.get_or_insert(now);
                self.not_before = None;
            }
            s if s.is_terminal() => self.completed_at = Some(now),
            _ => {}
        }
        self.status = next;
        true
    }

    /// Wall time between first start and completion.
    pub fn processing_time_ms(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Queue ordering
// ---------------------------------------------------------------------------

/// Heap entry. `BinaryHeap` is a max-heap, so the ordering is reversed: the
/// "greatest" entry is the lowest priority number, ties broken by the earlier
/// submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub priority: u8,
    pub seq: u64,
    pub id: JobId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timeframe;
    use std::collections::BinaryHeap;

    fn cfg() -> IngestionConfig {
        IngestionConfig::new("MOCK", "EURUSD", Timeframe::M5)
    }

    #[test]
    fn heap_pops_most_urgent_then_oldest() {
        let mut heap = BinaryHeap::new();
        let entry = |priority, seq| QueueEntry {
            priority,
            seq,
            id: Uuid::new_v4(),
        };
        heap.push(entry(5, 0));
        heap.push(entry(1, 2));
        heap.push(entry(1, 1));
        heap.push(entry(3, 3));

        let order: Vec<(u8, u64)> = std::iter::from_fn(|| heap.pop())
            .map(|e| (e.priority, e.seq))
            .collect();
        assert_eq!(order, vec![(1, 1), (1, 2), (3, 3), (5, 0)]);
    }

    #[test]
    fn terminal_states_are_final() {
        let mut job = IngestionJob::incremental(cfg(), 1);
        assert!(job.transition(JobStatus::Running));
        assert!(job.transition(JobStatus::Completed));
        assert!(job.completed_at.is_some());

        for next in [JobStatus::Queued, JobStatus::Running, JobStatus::Failed, JobStatus::Cancelled] {
            assert!(!job.transition(next));
        }
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn backpressure_returns_running_job_to_queue() {
        let mut job = IngestionJob::incremental(cfg(), 1);
        job.transition(JobStatus::Running);
        let first_start = job.started_at;
        assert!(job.transition(JobStatus::Queued));
        assert!(job.completed_at.is_none());
        assert!(job.transition(JobStatus::Running));
        assert_eq!(job.started_at, first_start);
    }

    #[test]
    fn queued_job_cannot_complete_without_running() {
        let mut job = IngestionJob::incremental(cfg(), 1);
        assert!(!job.transition(JobStatus::Completed));
        assert!(job.transition(JobStatus::Cancelled));
    }

    #[test]
    fn status_serializes_screaming_snake() {
        assert_eq!(serde_json::to_string(&JobStatus::TimedOut).unwrap(), "\"TIMED_OUT\"");
        assert_eq!(JobStatus::TimedOut.to_string(), "TIMED_OUT");
    }
}

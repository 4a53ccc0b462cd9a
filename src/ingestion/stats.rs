// =============================================================================
// Coordinator statistics — rolling processing times and outcome counters
// =============================================================================

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{Pid, System};

use super::job::JobStatus;

/// Processing times kept for the rolling average.
pub const PROCESSING_WINDOW: usize = 100;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceStatistics {
    /// Queued plus running.
    pub active_jobs: usize,
    pub queued_jobs: usize,
    pub running_jobs: usize,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub timed_out_jobs: u64,
    pub cancelled_jobs: u64,
    pub retried_attempts: u64,
    pub rate_limit_deferrals: u64,
    pub avg_processing_time_ms: f64,
    /// completed / (completed + failed + timed out); 0 before any outcome.
    pub success_rate: f64,
    /// Resident set size in bytes, where the platform exposes it.
    pub memory_usage: Option<u64>,
}

#[derive(Debug, Default)]
pub(crate) struct RollingStats {
    processing_ms: VecDeque<u64>,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub retried: u64,
    pub deferrals: u64,
}

impl RollingStats {
    pub fn record_outcome(&mut self, status: JobStatus, processing_ms: Option<u64>) {
        match status {
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::TimedOut => self.timed_out += 1,
            JobStatus::Cancelled => self.cancelled += 1,
            JobStatus::Queued | JobStatus::Running => return,
        }

        if let Some(ms) = processing_ms {
            if self.processing_ms.len() == PROCESSING_WINDOW {
                self.processing_ms.pop_front();
            }
            self.processing_ms.push_back(ms);
        }
    }

    pub fn avg_processing_time_ms(&self) -> f64 {
        if self.processing_ms.is_empty() {
            return 0.0;
        }
        self.processing_ms.iter().sum::<u64>() as f64 / self.processing_ms.len() as f64
    }

    pub fn success_rate(&self) -> f64 {
        let finished = self.completed + self.failed + self.timed_out;
        if finished == 0 {
            0.0
        } else {
            self.completed as f64 / finished as f64
        }
    }

    pub fn snapshot(
        &self,
        queued: usize,
        running: usize,
        memory_usage: Option<u64>,
    ) -> PerformanceStatistics {
        PerformanceStatistics {
            active_jobs: queued + running,
            queued_jobs: queued,
            running_jobs: running,
            completed_jobs: self.completed,
            failed_jobs: self.failed,
            timed_out_jobs: self.timed_out,
            cancelled_jobs: self.cancelled,
            retried_attempts: self.retried,
            rate_limit_deferrals: self.deferrals,
            avg_processing_time_ms: self.avg_processing_time_ms(),
            success_rate: self.success_rate(),
            memory_usage,
        }
    }
}

/// Samples this process's resident memory through `sysinfo`.
pub(crate) struct MemorySampler {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl MemorySampler {
    pub fn new() -> Self {
        Self {
            pid: sysinfo::get_current_pid().ok(),
            system: Mutex::new(System::new()),
        }
    }

    /// Resident memory in bytes; `None` if the process cannot be inspected.
    pub fn resident_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut sys = self.system.lock();
        if !sys.refresh_process(pid) {
            return None;
        }
        sys.process(pid).map(|p| p.memory())
    }
}

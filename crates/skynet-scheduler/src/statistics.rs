use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::task::Task;

/// Outcome counters for a job, or the sum over many jobs.
///
/// Task-level counters always satisfy
/// `total_task == passed_task + failed_task + skipped_task + missed_task`;
/// run-level counters satisfy `total_run == passed_run + failed_run`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub total_task: u64,
    pub passed_task: u64,
    pub failed_task: u64,
    /// Skipped by the job's before hook.
    pub skipped_task: u64,
    /// Claimed by another instance (or refused by a throttle group).
    pub missed_task: u64,

    pub total_run: u64,
    pub passed_run: u64,
    pub failed_run: u64,
    /// Every attempt after the first one of an occurrence.
    pub retried_run: u64,
}

impl Add for Statistics {
    type Output = Statistics;

    fn add(mut self, delta: Statistics) -> Statistics {
        self += delta;
        self
    }
}

impl AddAssign for Statistics {
    fn add_assign(&mut self, delta: Statistics) {
        self.total_task += delta.total_task;
        self.passed_task += delta.passed_task;
        self.failed_task += delta.failed_task;
        self.skipped_task += delta.skipped_task;
        self.missed_task += delta.missed_task;
        self.total_run += delta.total_run;
        self.passed_run += delta.passed_run;
        self.failed_run += delta.failed_run;
        self.retried_run += delta.retried_run;
    }
}

impl Sum for Statistics {
    fn sum<I: Iterator<Item = Statistics>>(iter: I) -> Statistics {
        iter.fold(Statistics::default(), Add::add)
    }
}

/// Lock-free live counters owned by a registered job.
///
/// Each field is exact on its own; a snapshot may combine fields read at
/// slightly different instants.
#[derive(Debug, Default)]
pub(crate) struct AtomicStatistics {
    total_task: AtomicU64,
    passed_task: AtomicU64,
    failed_task: AtomicU64,
    skipped_task: AtomicU64,
    missed_task: AtomicU64,
    total_run: AtomicU64,
    passed_run: AtomicU64,
    failed_run: AtomicU64,
    retried_run: AtomicU64,
}

impl AtomicStatistics {
    /// Fold one finalized occurrence into the counters.
    pub(crate) fn record(&self, task: &Task) {
        self.total_task.fetch_add(1, Ordering::Relaxed);

        let passed = task.outcome().is_none();
        let bucket = if task.is_skipped() {
            &self.skipped_task
        } else if task.is_missed() {
            &self.missed_task
        } else if passed {
            &self.passed_task
        } else {
            &self.failed_task
        };
        bucket.fetch_add(1, Ordering::Relaxed);

        let attempts = u64::from(task.attempts());
        if attempts == 0 {
            return;
        }
        // Only the last attempt can have succeeded.
        let passed_runs = u64::from(passed);
        self.total_run.fetch_add(attempts, Ordering::Relaxed);
        self.passed_run.fetch_add(passed_runs, Ordering::Relaxed);
        self.failed_run
            .fetch_add(attempts - passed_runs, Ordering::Relaxed);
        self.retried_run.fetch_add(attempts - 1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> Statistics {
        Statistics {
            total_task: self.total_task.load(Ordering::Relaxed),
            passed_task: self.passed_task.load(Ordering::Relaxed),
            failed_task: self.failed_task.load(Ordering::Relaxed),
            skipped_task: self.skipped_task.load(Ordering::Relaxed),
            missed_task: self.missed_task.load(Ordering::Relaxed),
            total_run: self.total_run.load(Ordering::Relaxed),
            passed_run: self.passed_run.load(Ordering::Relaxed),
            failed_run: self.failed_run.load(Ordering::Relaxed),
            retried_run: self.retried_run.load(Ordering::Relaxed),
        }
    }
}

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::claim::ClaimMode;
use crate::job::{Job, JobMeta, JobOptions};
use crate::panic::run_guarded;
use crate::task::Task;
use crate::ticker::Fire;

/// Executes scheduled occurrences of one registered job.
///
/// Every call of [`Coordinator::run_occurrence`] handles exactly one tick:
/// before hook, claim (through the job's group when it has one), run with
/// retries bounded by the next fire time, after hook, statistics. It never
/// fails; the outcome is recorded on the returned [`Task`].
pub(crate) struct Coordinator {
    job: Arc<dyn Job>,
    meta: JobMeta,
    options: JobOptions,
    cron_key: String,
    hostname: String,
    claim: ClaimMode,
}

impl Coordinator {
    pub(crate) fn new(
        job: Arc<dyn Job>,
        meta: JobMeta,
        options: JobOptions,
        cron_key: String,
        hostname: String,
        claim: ClaimMode,
    ) -> Self {
        Self {
            job,
            meta,
            options,
            cron_key,
            hostname,
            claim,
        }
    }

    pub(crate) async fn run_occurrence(&self, fire: Fire) -> Task {
        let mut task = Task::new(&self.cron_key, &self.hostname, self.meta.clone(), fire);

        if let Some(before) = &self.options.before {
            task.skipped = before(&task);
        }

        if task.skipped {
            debug!(task = %task.key, "occurrence skipped by before hook");
        } else if self.eligible(&task).await {
            self.execute(&mut task).await;
        } else {
            task.missed = true;
            debug!(task = %task.key, "occurrence claimed elsewhere");
        }

        if let Some(after) = &self.options.after {
            after(&task);
        }

        self.meta.counters().record(&task);
        task
    }

    async fn eligible(&self, task: &Task) -> bool {
        if self.options.skip_claim {
            return true;
        }
        let claim = || self.claim.acquire(&task.key, &self.hostname);
        match &self.options.group {
            Some(group) => group.attempt_increment(task.planned_at, claim).await,
            None => claim().await,
        }
    }

    async fn execute(&self, task: &mut Task) {
        task.began_at = Some(Utc::now());

        loop {
            let result = run_guarded(self.job.run(task)).await;
            task.attempts += 1;

            match result {
                Ok(()) => {
                    task.outcome = None;
                    break;
                }
                Err(e) => {
                    warn!(task = %task.key, attempt = task.attempts, error = %e, "job run failed");
                    task.outcome = Some(e);
                }
            }
            if task.attempts >= self.options.attempts_allowed() {
                break;
            }

            let now = Utc::now();
            if now >= task.next_at {
                break;
            }
            if let Some(interval) = &self.options.retry_interval {
                let delay = interval(task.attempts);
                let remaining = (task.next_at - now).to_std().unwrap_or_default();
                if remaining < delay {
                    debug!(task = %task.key, ?delay, "next retry would pass the deadline");
                    break;
                }
                tokio::time::sleep(delay).await;
            }
        }

        task.ended_at = Some(Utc::now());
        if task.outcome.is_none() {
            info!(task = %task.key, attempts = task.attempts, "job run passed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};

    use super::*;
    use crate::claim::Claim;
    use crate::error::{BoxError, RunError};
    use crate::group::Group;

    /// Grants the first claim of every key, counting calls.
    #[derive(Default)]
    struct FakeClaims {
        granted: Mutex<Vec<String>>,
        calls: AtomicUsize,
        refuse_all: bool,
    }

    #[async_trait]
    impl Claim for FakeClaims {
        async fn claim(&self, key: &str, _owner: &str) -> Result<bool, BoxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.refuse_all {
                return Ok(false);
            }
            let mut granted = self.granted.lock().unwrap();
            if granted.iter().any(|k| k == key) {
                return Ok(false);
            }
            granted.push(key.to_string());
            Ok(true)
        }
    }

    /// Fails until `pass_on` attempts were made (`0` = never passes).
    struct Flaky {
        runs: AtomicUsize,
        pass_on: usize,
    }

    impl Flaky {
        fn new(pass_on: usize) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                pass_on,
            })
        }
    }

    #[async_trait]
    impl Job for Flaky {
        fn key(&self) -> &str {
            "flaky"
        }
        fn spec(&self) -> &str {
            "* * * * * *"
        }
        async fn run(&self, _task: &Task) -> Result<(), BoxError> {
            let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            if self.pass_on != 0 && n >= self.pass_on {
                Ok(())
            } else {
                Err(format!("attempt {n} failed").into())
            }
        }
    }

    struct Panicky;

    #[async_trait]
    impl Job for Panicky {
        fn key(&self) -> &str {
            "panicky"
        }
        fn spec(&self) -> &str {
            "* * * * * *"
        }
        async fn run(&self, _task: &Task) -> Result<(), BoxError> {
            let items: Vec<u32> = Vec::new();
            let _ = items[std::hint::black_box(1)];
            Ok(())
        }
    }

    fn fire_far() -> Fire {
        let planned_at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        Fire {
            planned_at,
            next_at: DateTime::<Utc>::MAX_UTC,
        }
    }

    fn coordinator(job: Arc<dyn Job>, options: JobOptions, claim: ClaimMode) -> Coordinator {
        let meta = JobMeta::new(job.key().to_string(), job.spec().to_string());
        Coordinator::new(
            job,
            meta,
            options,
            "fleet".to_string(),
            "node-a".to_string(),
            claim,
        )
    }

    #[tokio::test]
    async fn skip_from_before_hook_never_claims() {
        let claims = Arc::new(FakeClaims::default());
        let job = Flaky::new(1);
        let c = coordinator(
            job.clone(),
            JobOptions::new().with_before(|_| true),
            ClaimMode::Distributed(claims.clone()),
        );

        let task = c.run_occurrence(fire_far()).await;

        assert!(task.is_skipped());
        assert_eq!(task.attempts(), 0);
        assert_eq!(claims.calls.load(Ordering::SeqCst), 0);
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);
        let s = c.meta.statistics();
        assert_eq!((s.total_task, s.skipped_task, s.total_run), (1, 1, 0));
    }

    #[tokio::test]
    async fn refused_claim_marks_missed_without_running() {
        let claims = Arc::new(FakeClaims {
            refuse_all: true,
            ..Default::default()
        });
        let job = Flaky::new(1);
        let c = coordinator(job.clone(), JobOptions::new(), ClaimMode::Distributed(claims));

        let task = c.run_occurrence(fire_far()).await;

        assert!(task.is_missed());
        assert!(task.began_at().is_none());
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);
        let s = c.meta.statistics();
        assert_eq!((s.total_task, s.missed_task), (1, 1));
    }

    #[tokio::test]
    async fn second_evaluation_of_same_tick_is_missed() {
        let claims = Arc::new(FakeClaims::default());
        let c = coordinator(Flaky::new(1), JobOptions::new(), ClaimMode::Distributed(claims));

        assert!(c.run_occurrence(fire_far()).await.passed());
        assert!(c.run_occurrence(fire_far()).await.is_missed());
    }

    #[tokio::test]
    async fn always_failing_job_uses_every_attempt() {
        let job = Flaky::new(0);
        let c = coordinator(
            job.clone(),
            JobOptions::new().with_retry_times(4),
            ClaimMode::Standalone,
        );

        let task = c.run_occurrence(fire_far()).await;

        assert_eq!(task.attempts(), 4);
        assert_eq!(job.runs.load(Ordering::SeqCst), 4);
        assert_eq!(task.outcome().unwrap().to_string(), "attempt 4 failed");
        assert!(task.began_at().is_some() && task.ended_at().is_some());
        let s = c.meta.statistics();
        assert_eq!(s.failed_task, 1);
        assert_eq!((s.total_run, s.failed_run, s.retried_run), (4, 4, 3));
    }

    #[tokio::test]
    async fn success_stops_retrying() {
        let c = coordinator(
            Flaky::new(2),
            JobOptions::new().with_retry_times(5),
            ClaimMode::Standalone,
        );

        let task = c.run_occurrence(fire_far()).await;

        assert!(task.passed());
        assert_eq!(task.attempts(), 2);
        let s = c.meta.statistics();
        assert_eq!((s.passed_task, s.total_run, s.passed_run, s.failed_run), (1, 2, 1, 1));
    }

    #[tokio::test]
    async fn retry_interval_that_overruns_deadline_stops_early() {
        let job = Flaky::new(0);
        let c = coordinator(
            job.clone(),
            JobOptions::new()
                .with_retry_times(5)
                .with_retry_interval(|_| Duration::from_millis(200)),
            ClaimMode::Standalone,
        );
        let now = Utc::now();
        let fire = Fire {
            planned_at: now,
            next_at: now + chrono::Duration::milliseconds(300),
        };

        let task = c.run_occurrence(fire).await;

        // 200ms fits once into the 300ms window, a second wait does not.
        assert_eq!(task.attempts(), 2);
        assert!(task.ended_at().unwrap() < fire.next_at);
        assert!(task.outcome().is_some());
    }

    #[tokio::test]
    async fn no_interval_wait_after_the_last_attempt() {
        let interval = Duration::from_millis(1_500);
        for retry_times in [1, 3] {
            let calls = Arc::new(AtomicUsize::new(0));
            let c_calls = Arc::clone(&calls);
            let c = coordinator(
                Flaky::new(0),
                JobOptions::new()
                    .with_retry_times(retry_times)
                    .with_retry_interval(move |_| {
                        c_calls.fetch_add(1, Ordering::SeqCst);
                        Duration::from_millis(10)
                    }),
                ClaimMode::Standalone,
            );
            let single = coordinator(
                Flaky::new(0),
                JobOptions::new()
                    .with_retry_times(1)
                    .with_retry_interval(move |_| interval),
                ClaimMode::Standalone,
            );

            let task = c.run_occurrence(fire_far()).await;
            assert_eq!(task.attempts(), retry_times);
            // One wait between each pair of attempts, none after the last.
            assert_eq!(calls.load(Ordering::SeqCst), retry_times as usize - 1);

            let task = single.run_occurrence(fire_far()).await;
            let took = task.ended_at().unwrap() - task.began_at().unwrap();
            assert!(took < chrono::Duration::milliseconds(500), "took {took}");
        }
    }

    #[tokio::test]
    async fn claim_backend_error_counts_as_missed() {
        struct Unreachable;

        #[async_trait]
        impl Claim for Unreachable {
            async fn claim(&self, _key: &str, _owner: &str) -> Result<bool, BoxError> {
                Err("connection refused".into())
            }
        }

        let job = Flaky::new(1);
        let group = Group::new("reports", 2).unwrap();
        let c = coordinator(
            job.clone(),
            JobOptions::new().with_group(group.clone()),
            ClaimMode::Distributed(Arc::new(Unreachable)),
        );

        let task = c.run_occurrence(fire_far()).await;

        assert!(task.is_missed());
        assert_eq!(task.attempts(), 0);
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);
        assert_eq!(group.count(fire_far().planned_at).await, 0);
        let s = c.meta.statistics();
        assert_eq!((s.total_task, s.missed_task, s.total_run), (1, 1, 0));
    }

    #[tokio::test]
    async fn passed_deadline_stops_without_interval() {
        let job = Flaky::new(0);
        let c = coordinator(
            job.clone(),
            JobOptions::new().with_retry_times(3),
            ClaimMode::Standalone,
        );
        let now = Utc::now();
        let fire = Fire {
            planned_at: now - chrono::Duration::seconds(2),
            next_at: now - chrono::Duration::seconds(1),
        };

        let task = c.run_occurrence(fire).await;
        assert_eq!(task.attempts(), 1);
    }

    #[tokio::test]
    async fn panic_is_recorded_as_failure() {
        let c = coordinator(
            Arc::new(Panicky),
            JobOptions::new().with_retry_times(2),
            ClaimMode::Standalone,
        );

        let task = c.run_occurrence(fire_far()).await;

        assert_eq!(task.attempts(), 2);
        match task.outcome() {
            Some(RunError::Panicked { message, .. }) => {
                assert!(message.contains("index out of bounds"), "{message}");
            }
            other => panic!("expected panic outcome, got {other:?}"),
        }
        assert_eq!(c.meta.statistics().failed_task, 1);
    }

    #[tokio::test]
    async fn after_hook_sees_finalized_task() {
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        let c = coordinator(
            Flaky::new(2),
            JobOptions::new()
                .with_retry_times(3)
                .with_after(move |task| *s.lock().unwrap() = Some(task.clone())),
            ClaimMode::Standalone,
        );

        c.run_occurrence(fire_far()).await;

        let task = seen.lock().unwrap().take().unwrap();
        assert!(task.passed());
        assert_eq!(task.attempts(), 2);
        assert!(task.ended_at().is_some());
        assert_eq!(task.key(), "cron:fleet.flaky@1767225600");
    }

    #[tokio::test]
    async fn skip_claim_bypasses_backend() {
        let claims = Arc::new(FakeClaims {
            refuse_all: true,
            ..Default::default()
        });
        let c = coordinator(
            Flaky::new(1),
            JobOptions::new().with_skip_claim(),
            ClaimMode::Distributed(claims.clone()),
        );

        assert!(c.run_occurrence(fire_far()).await.passed());
        assert_eq!(claims.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn group_limit_turns_extra_members_into_missed() {
        let claims: Arc<FakeClaims> = Arc::new(FakeClaims::default());
        let group = Group::new("reports", 1).unwrap();

        let first = coordinator(
            Flaky::new(1),
            JobOptions::new().with_group(group.clone()),
            ClaimMode::Distributed(claims.clone()),
        );
        let second = coordinator(
            Arc::new(Panicky),
            JobOptions::new().with_group(group.clone()),
            ClaimMode::Distributed(claims.clone()),
        );

        assert!(first.run_occurrence(fire_far()).await.passed());
        let task = second.run_occurrence(fire_far()).await;
        assert!(task.is_missed());
        // The full group short-circuits before the backend is asked.
        assert_eq!(claims.calls.load(Ordering::SeqCst), 1);
        assert_eq!(group.count(fire_far().planned_at).await, 1);
    }

    #[tokio::test]
    async fn statistics_invariants_hold_across_outcomes() {
        let c = coordinator(
            Flaky::new(3),
            JobOptions::new()
                .with_retry_times(2)
                .with_before(|task| task.planned_at().timestamp() % 2 == 1),
            ClaimMode::Distributed(Arc::new(FakeClaims::default())),
        );
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        for sec in [0, 1, 2, 2, 4, 6] {
            let planned_at = base + chrono::Duration::seconds(sec);
            c.run_occurrence(Fire {
                planned_at,
                next_at: DateTime::<Utc>::MAX_UTC,
            })
            .await;
        }

        let s = c.meta.statistics();
        assert_eq!(s.total_task, 6);
        assert_eq!(
            s.total_task,
            s.passed_task + s.failed_task + s.skipped_task + s.missed_task
        );
        assert_eq!(s.total_run, s.passed_run + s.failed_run);
        assert_eq!(s.skipped_task, 1);
        assert_eq!(s.missed_task, 1);
        assert!(s.failed_task >= 1 && s.passed_task >= 1);
    }
}

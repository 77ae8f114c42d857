use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::BoxError;
use crate::group::Group;
use crate::statistics::{AtomicStatistics, Statistics};
use crate::task::Task;
use crate::ticker::{Entry, EntryId, Ticker, WeakTicker};

/// Before hook: return `true` to skip the occurrence.
pub type BeforeFn = Arc<dyn Fn(&Task) -> bool + Send + Sync>;
/// After hook: receives the finalized occurrence.
pub type AfterFn = Arc<dyn Fn(&Task) + Send + Sync>;
/// Delay before the next attempt, given the number of attempts made so far.
pub type RetryInterval = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// A named periodic job.
///
/// `key` must be unique within a cron and identical on every instance of the
/// fleet; it is part of the occurrence key instances claim.
#[async_trait]
pub trait Job: Send + Sync {
    fn key(&self) -> &str;

    /// Cron spec, see [`CronSchedule`](crate::schedule::CronSchedule).
    fn spec(&self) -> &str;

    /// Run one attempt of the occurrence described by `task`.
    async fn run(&self, task: &Task) -> Result<(), BoxError>;

    fn options(&self) -> JobOptions {
        JobOptions::default()
    }
}

/// Behavioural options of a job, read once at registration.
#[derive(Clone, Default)]
pub struct JobOptions {
    pub(crate) before: Option<BeforeFn>,
    pub(crate) after: Option<AfterFn>,
    pub(crate) retry_times: u32,
    pub(crate) retry_interval: Option<RetryInterval>,
    pub(crate) group: Option<Group>,
    pub(crate) skip_claim: bool,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_before(mut self, before: impl Fn(&Task) -> bool + Send + Sync + 'static) -> Self {
        self.before = Some(Arc::new(before));
        self
    }

    pub fn with_after(mut self, after: impl Fn(&Task) + Send + Sync + 'static) -> Self {
        self.after = Some(Arc::new(after));
        self
    }

    /// Maximum attempts per occurrence. Values below 1 mean 1.
    pub fn with_retry_times(mut self, retry_times: u32) -> Self {
        self.retry_times = retry_times;
        self
    }

    pub fn with_retry_interval(
        mut self,
        interval: impl Fn(u32) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.retry_interval = Some(Arc::new(interval));
        self
    }

    /// Share a per-instant concurrency limit with the other members of `group`.
    pub fn with_group(mut self, group: Group) -> Self {
        self.group = Some(group);
        self
    }

    /// Run on every instance without claiming the occurrence.
    pub fn with_skip_claim(mut self) -> Self {
        self.skip_claim = true;
        self
    }

    pub(crate) fn attempts_allowed(&self) -> u32 {
        self.retry_times.max(1)
    }
}

impl std::fmt::Debug for JobOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobOptions")
            .field("before", &self.before.is_some())
            .field("after", &self.after.is_some())
            .field("retry_times", &self.retry_times)
            .field("retry_interval", &self.retry_interval.is_some())
            .field("group", &self.group.as_ref().map(Group::name))
            .field("skip_claim", &self.skip_claim)
            .finish()
    }
}

/// A job backed by an async closure. Build one with [`job_fn`].
pub struct FnJob<F, Fut> {
    key: String,
    spec: String,
    run: F,
    options: JobOptions,
    _fut: PhantomData<fn() -> Fut>,
}

/// Wrap an async closure as a [`Job`]. The closure receives a copy of the
/// occurrence.
///
/// ```no_run
/// use skynet_scheduler::{job_fn, BoxError, JobOptions, Task};
///
/// let job = job_fn("rollup", "0 */5 * * * *", |task: Task| async move {
///     println!("running {}", task.key());
///     Ok::<(), BoxError>(())
/// })
/// .with_options(JobOptions::new().with_retry_times(3));
/// ```
pub fn job_fn<F, Fut>(key: impl Into<String>, spec: impl Into<String>, run: F) -> FnJob<F, Fut>
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    FnJob {
        key: key.into(),
        spec: spec.into(),
        run,
        options: JobOptions::default(),
        _fut: PhantomData,
    }
}

impl<F, Fut> FnJob<F, Fut> {
    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }
}

#[async_trait]
impl<F, Fut> Job for FnJob<F, Fut>
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    fn key(&self) -> &str {
        &self.key
    }

    fn spec(&self) -> &str {
        &self.spec
    }

    async fn run(&self, task: &Task) -> Result<(), BoxError> {
        (self.run)(task.clone()).await
    }

    fn options(&self) -> JobOptions {
        self.options.clone()
    }
}

struct JobInner {
    key: String,
    spec: String,
    statistics: AtomicStatistics,
    entry: OnceLock<(WeakTicker, EntryId)>,
}

/// Read-only view of a registered job.
#[derive(Clone)]
pub struct JobMeta {
    inner: Arc<JobInner>,
}

impl JobMeta {
    pub(crate) fn new(key: String, spec: String) -> Self {
        Self {
            inner: Arc::new(JobInner {
                key,
                spec,
                statistics: AtomicStatistics::default(),
                entry: OnceLock::new(),
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(key: &str, spec: &str) -> Self {
        Self::new(key.to_string(), spec.to_string())
    }

    pub(crate) fn bind(&self, ticker: &Ticker, id: EntryId) {
        // Bound exactly once, right after registration.
        let _ = self.inner.entry.set((ticker.downgrade(), id));
    }

    pub(crate) fn counters(&self) -> &AtomicStatistics {
        &self.inner.statistics
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn spec(&self) -> &str {
        &self.inner.spec
    }

    pub fn statistics(&self) -> Statistics {
        self.inner.statistics.snapshot()
    }

    /// Most recent fire time, `None` before the first tick.
    pub fn prev_fire(&self) -> Option<DateTime<Utc>> {
        self.entry_times().and_then(|e| e.prev)
    }

    /// Upcoming fire time, `None` until the cron is started.
    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        self.entry_times().and_then(|e| e.next)
    }

    fn entry_times(&self) -> Option<Entry> {
        let (ticker, id) = self.inner.entry.get()?;
        ticker.entry(*id)
    }
}

impl std::fmt::Debug for JobMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobMeta")
            .field("key", &self.inner.key)
            .field("spec", &self.inner.spec)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::tests::sample_task;

    #[test]
    fn retry_times_below_one_means_one() {
        assert_eq!(JobOptions::new().attempts_allowed(), 1);
        assert_eq!(JobOptions::new().with_retry_times(0).attempts_allowed(), 1);
        assert_eq!(JobOptions::new().with_retry_times(4).attempts_allowed(), 4);
    }

    #[tokio::test]
    async fn fn_job_receives_the_occurrence() {
        let job = job_fn("report", "* * * * * *", |task: Task| async move {
            let result: Result<(), BoxError> = if task.key().starts_with("cron:fleet.report@") {
                Ok(())
            } else {
                Err(format!("unexpected key {}", task.key()).into())
            };
            result
        })
        .with_options(JobOptions::new().with_retry_times(2).with_skip_claim());

        assert_eq!(job.key(), "report");
        assert_eq!(job.spec(), "* * * * * *");
        assert!(job.options().skip_claim);
        assert!(job.run(&sample_task()).await.is_ok());
    }

    #[test]
    fn detached_meta_has_no_fire_times() {
        let meta = JobMeta::detached("a", "* * * * * *");
        assert_eq!(meta.prev_fire(), None);
        assert_eq!(meta.next_fire(), None);
        assert_eq!(meta.statistics(), Statistics::default());
    }
}

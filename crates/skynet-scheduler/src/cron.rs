use std::future::Future;
use std::sync::Arc;

use chrono::{FixedOffset, Offset, Utc};
use futures_util::FutureExt;
use tokio::sync::watch;
use tracing::info;

use crate::claim::{Claim, ClaimMode};
use crate::coordinator::Coordinator;
use crate::error::{CronError, JobError, Result};
use crate::job::{Job, JobMeta};
use crate::statistics::Statistics;
use crate::ticker::{Callback, Fire, Ticker};

/// Owner identity of this process: `HOSTNAME`, then `HOST`, else "unknown".
pub fn default_hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "unknown".into())
}

/// Configures a [`Cron`]. Exactly one of [`claim`](Self::claim) and
/// [`standalone`](Self::standalone) must be chosen.
#[derive(Debug)]
pub struct CronBuilder {
    key: String,
    hostname: Option<String>,
    claim: Option<ClaimMode>,
    offset: FixedOffset,
}

impl Default for CronBuilder {
    fn default() -> Self {
        Self {
            key: String::new(),
            hostname: None,
            claim: None,
            offset: Utc.fix(),
        }
    }
}

impl CronBuilder {
    /// Fleet key shared by every instance running the same set of jobs.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Override the owner identity used when claiming occurrences.
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Arbitrate occurrences through `claim` shared by the fleet.
    pub fn claim(mut self, claim: Arc<dyn Claim>) -> Self {
        self.claim = Some(ClaimMode::Distributed(claim));
        self
    }

    /// Run every occurrence locally without any fleet coordination.
    pub fn standalone(mut self) -> Self {
        self.claim = Some(ClaimMode::Standalone);
        self
    }

    /// Offset in which cron specs are evaluated. Defaults to UTC.
    pub fn utc_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    pub fn build(self) -> Result<Cron> {
        let claim = self.claim.ok_or_else(|| {
            CronError::Config(
                "no claim backend configured; use standalone() to run without one".to_string(),
            )
        })?;
        Ok(Cron {
            key: self.key,
            hostname: self.hostname.unwrap_or_else(default_hostname),
            claim,
            ticker: Ticker::new(self.offset),
            jobs: Vec::new(),
        })
    }
}

/// Registry of jobs driven by one ticker, coordinated across the fleet.
///
/// Jobs are registered through `&mut self` before or after [`Cron::start`];
/// everything else is a read-only view.
pub struct Cron {
    key: String,
    hostname: String,
    claim: ClaimMode,
    ticker: Ticker,
    jobs: Vec<JobMeta>,
}

impl Cron {
    pub fn builder() -> CronBuilder {
        CronBuilder::default()
    }

    pub fn add_job(&mut self, job: impl Job + 'static) -> Result<()> {
        self.add_shared(Arc::new(job))
    }

    /// Register an already shared job.
    pub fn add_shared(&mut self, job: Arc<dyn Job>) -> Result<()> {
        let key = job.key().to_string();
        if key.is_empty() {
            return Err(CronError::EmptyKey);
        }
        if self.jobs.iter().any(|j| j.key() == key) {
            return Err(CronError::DuplicateKey { key });
        }

        let options = job.options();
        if options.group.is_some() && options.skip_claim {
            return Err(CronError::Config(
                "a grouped job cannot skip claiming".to_string(),
            ));
        }

        let meta = JobMeta::new(key, job.spec().to_string());
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&job),
            meta.clone(),
            options,
            self.key.clone(),
            self.hostname.clone(),
            self.claim.clone(),
        ));
        let callback: Callback = Arc::new(move |fire: Fire| {
            let coordinator = Arc::clone(&coordinator);
            async move {
                coordinator.run_occurrence(fire).await;
            }
            .boxed()
        });

        let id = self.ticker.register(meta.spec(), callback)?;
        meta.bind(&self.ticker, id);
        info!(job = %meta.key(), spec = %meta.spec(), "job added");
        self.jobs.push(meta);
        Ok(())
    }

    /// Register several jobs. Each job is attempted even if an earlier one
    /// failed; all failures are returned together.
    pub fn add_jobs<I>(&mut self, jobs: I) -> Result<()>
    where
        I: IntoIterator<Item = Arc<dyn Job>>,
    {
        let mut failures = Vec::new();
        for job in jobs {
            let key = job.key().to_string();
            if let Err(source) = self.add_shared(job) {
                failures.push(JobError { key, source });
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(CronError::Jobs(failures))
        }
    }

    /// Start ticking. No-op if already started. Must be called from within a
    /// tokio runtime.
    pub fn start(&self) {
        self.ticker.start();
        info!(cron = %self.key, hostname = %self.hostname, jobs = self.jobs.len(), "cron started");
    }

    /// Stop ticking; the returned future resolves once every running
    /// occurrence has finished.
    pub fn stop(&self) -> impl Future<Output = ()> + Send + 'static {
        info!(cron = %self.key, "cron stopping");
        self.ticker.stop()
    }

    /// Run until `shutdown` turns `true` (or its sender is dropped), then stop
    /// and wait for running occurrences.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        self.start();
        while !*shutdown.borrow_and_update() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        self.stop().await;
        info!(cron = %self.key, "cron stopped");
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Owner identity this instance claims occurrences with.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn is_standalone(&self) -> bool {
        matches!(self.claim, ClaimMode::Standalone)
    }

    /// Sum of every registered job's statistics.
    pub fn statistics(&self) -> Statistics {
        self.jobs.iter().map(JobMeta::statistics).sum()
    }

    pub fn jobs(&self) -> Vec<JobMeta> {
        self.jobs.clone()
    }

    pub fn job(&self, key: &str) -> Option<JobMeta> {
        self.jobs.iter().find(|j| j.key() == key).cloned()
    }
}

impl std::fmt::Debug for Cron {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cron")
            .field("key", &self.key)
            .field("hostname", &self.hostname)
            .field("claim", &self.claim)
            .field("jobs", &self.jobs)
            .finish()
    }
}

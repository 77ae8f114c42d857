use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use chrono::FixedOffset;
use skynet_claims::{MemoryClaims, SqliteClaims};
use skynet_core::config::{ensure_parent_dir, ClaimsBackend, CrondConfig, JobConfig};
use skynet_scheduler::{Cron, Group, Job, JobOptions, Task};
use tracing::{debug, info, warn};

use crate::command::CommandJob;

/// A configured cron plus the handles the daemon maintains next to it.
pub struct Crond {
    pub cron: Cron,
    /// Set when claims live in SQLite, for periodic purging.
    pub sqlite: Option<Arc<SqliteClaims>>,
}

/// Build the cron described by `config`: claim backend, groups and every job.
pub fn build(config: &CrondConfig) -> anyhow::Result<Crond> {
    let offset = FixedOffset::east_opt(config.cron.utc_offset_secs)
        .ok_or_else(|| anyhow!("invalid utc offset {}", config.cron.utc_offset_secs))?;
    let mut builder = Cron::builder().key(&config.cron.key).utc_offset(offset);
    if let Some(hostname) = &config.cron.hostname {
        builder = builder.hostname(hostname);
    }

    let ttl = Duration::from_secs(config.claims.ttl_secs);
    let mut sqlite = None;
    builder = match config.claims.backend {
        ClaimsBackend::Sqlite => {
            let path = config.claims.resolved_path();
            ensure_parent_dir(&path)?;
            info!(path = %path.display(), "opening claims database");
            let claims = Arc::new(
                SqliteClaims::open(&path, ttl)
                    .with_context(|| format!("open claims database {}", path.display()))?,
            );
            sqlite = Some(Arc::clone(&claims));
            builder.claim(claims)
        }
        ClaimsBackend::Memory => {
            warn!("in-memory claims only coordinate crons inside this process");
            builder.claim(Arc::new(MemoryClaims::new(ttl)?))
        }
        ClaimsBackend::Standalone => builder.standalone(),
    };
    let mut cron = builder.build()?;

    let groups = config
        .groups
        .iter()
        .map(|(name, limit)| -> anyhow::Result<(String, Group)> {
            Ok((name.clone(), Group::new(name.clone(), *limit)?))
        })
        .collect::<anyhow::Result<HashMap<_, _>>>()?;

    let jobs = config
        .jobs
        .iter()
        .map(|job| command_job(job, &groups))
        .collect::<anyhow::Result<Vec<_>>>()?;
    cron.add_jobs(jobs)?;

    Ok(Crond { cron, sqlite })
}

fn command_job(job: &JobConfig, groups: &HashMap<String, Group>) -> anyhow::Result<Arc<dyn Job>> {
    let mut options = JobOptions::new()
        .with_retry_times(job.retry_times)
        .with_after(log_outcome);
    if let Some(ms) = job.retry_interval_ms {
        options = options.with_retry_interval(move |_| Duration::from_millis(ms));
    }
    if let Some(name) = &job.group {
        let group = groups
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("job {:?} refers to unknown group {name:?}", job.key))?;
        options = options.with_group(group);
    }
    if job.skip_claim {
        options = options.with_skip_claim();
    }

    let mut command = CommandJob::new(&job.key, &job.spec, &job.command).with_options(options);
    if let Some(secs) = job.timeout_secs {
        command = command.with_timeout(Duration::from_secs(secs));
    }
    Ok(Arc::new(command))
}

fn log_outcome(task: &Task) {
    if task.is_skipped() {
        debug!(task = %task.key(), "occurrence skipped");
    } else if task.is_missed() {
        debug!(task = %task.key(), "occurrence claimed elsewhere");
    } else if let Some(err) = task.outcome() {
        warn!(task = %task.key(), attempts = task.attempts(), error = %err, "occurrence failed");
    } else {
        let took_ms = task
            .began_at()
            .zip(task.ended_at())
            .map(|(began, ended)| (ended - began).num_milliseconds())
            .unwrap_or_default();
        info!(task = %task.key(), attempts = task.attempts(), took_ms, "occurrence passed");
    }
}

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{CronError, Result};

/// Number of most recent instants a group keeps counters for. The list is
/// trimmed back to this size once it grows past twice as many.
pub const MIN_COUNT_KEEP: usize = 16;

#[derive(Debug)]
struct GroupCount {
    planned_at: DateTime<Utc>,
    count: usize,
}

#[derive(Debug)]
struct GroupInner {
    name: String,
    limit: usize,
    counts: Mutex<Vec<GroupCount>>,
}

/// Caps how many jobs of a cohort may run for the same scheduled instant.
///
/// Clone the handle into every job that should share the limit.
#[derive(Debug, Clone)]
pub struct Group {
    inner: Arc<GroupInner>,
}

impl Group {
    pub fn new(name: impl Into<String>, limit: usize) -> Result<Self> {
        let name = name.into();
        if limit == 0 {
            return Err(CronError::Config(format!(
                "group {name}: limit must be at least 1"
            )));
        }
        Ok(Self {
            inner: Arc::new(GroupInner {
                name,
                limit,
                counts: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    /// Take one of the group's slots for `planned_at` if any is left and
    /// `claim` grants the occurrence.
    ///
    /// `claim` runs under the group lock so two members racing the same
    /// instant cannot both pass the limit check. The counter only moves when
    /// `claim` returns `true`.
    pub async fn attempt_increment<F, Fut>(&self, planned_at: DateTime<Utc>, claim: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = bool>,
    {
        let mut counts = self.inner.counts.lock().await;

        let idx = match counts.iter().rposition(|c| c.planned_at == planned_at) {
            Some(idx) => idx,
            None => {
                counts.push(GroupCount {
                    planned_at,
                    count: 0,
                });
                counts.len() - 1
            }
        };

        let granted = if counts[idx].count < self.inner.limit && claim().await {
            counts[idx].count += 1;
            true
        } else {
            false
        };
        debug!(
            group = %self.inner.name,
            %planned_at,
            count = counts[idx].count,
            granted,
            "group slot attempt"
        );

        if counts.len() > 2 * MIN_COUNT_KEEP {
            let excess = counts.len() - MIN_COUNT_KEEP;
            counts.drain(..excess);
        }
        granted
    }

    /// Slots taken for `planned_at`, zero if the instant is not tracked.
    pub async fn count(&self, planned_at: DateTime<Utc>) -> usize {
        let counts = self.inner.counts.lock().await;
        counts
            .iter()
            .rfind(|c| c.planned_at == planned_at)
            .map_or(0, |c| c.count)
    }

    #[cfg(test)]
    async fn tracked(&self) -> usize {
        self.inner.counts.lock().await.len()
    }
}

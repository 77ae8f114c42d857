use chrono::{DateTime, Utc};

use crate::error::RunError;
use crate::job::JobMeta;
use crate::ticker::Fire;

/// Fleet-wide identifier of one scheduled occurrence of a job.
///
/// Built from the fire time computed by the schedule, never from the wall
/// clock, so every instance evaluating the same tick derives the same key.
pub fn occurrence_key(cron_key: &str, job_key: &str, planned_at: DateTime<Utc>) -> String {
    format!("cron:{cron_key}.{job_key}@{}", planned_at.timestamp())
}

/// One materialized occurrence of a job at a scheduled instant.
///
/// Created fresh for every tick by the coordinator and handed to the job
/// procedure and hooks as a read-only view.
#[derive(Debug, Clone)]
pub struct Task {
    pub(crate) key: String,
    pub(crate) cron_key: String,
    pub(crate) hostname: String,
    pub(crate) job: JobMeta,
    pub(crate) planned_at: DateTime<Utc>,
    pub(crate) next_at: DateTime<Utc>,
    pub(crate) began_at: Option<DateTime<Utc>>,
    pub(crate) ended_at: Option<DateTime<Utc>>,
    pub(crate) outcome: Option<RunError>,
    pub(crate) skipped: bool,
    pub(crate) missed: bool,
    pub(crate) attempts: u32,
}

impl Task {
    pub(crate) fn new(cron_key: &str, hostname: &str, job: JobMeta, fire: Fire) -> Self {
        Self {
            key: occurrence_key(cron_key, job.key(), fire.planned_at),
            cron_key: cron_key.to_string(),
            hostname: hostname.to_string(),
            job,
            planned_at: fire.planned_at,
            next_at: fire.next_at,
            began_at: None,
            ended_at: None,
            outcome: None,
            skipped: false,
            missed: false,
            attempts: 0,
        }
    }

    /// The occurrence key used to claim this tick across the fleet.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn cron_key(&self) -> &str {
        &self.cron_key
    }

    /// Owner identity this instance claims with.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn job(&self) -> &JobMeta {
        &self.job
    }

    /// The fire time this occurrence represents.
    pub fn planned_at(&self) -> DateTime<Utc> {
        self.planned_at
    }

    /// The next fire time; retries are not started past it.
    pub fn deadline(&self) -> DateTime<Utc> {
        self.next_at
    }

    pub fn began_at(&self) -> Option<DateTime<Utc>> {
        self.began_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Error of the last attempt, `None` while running or after success.
    pub fn outcome(&self) -> Option<&RunError> {
        self.outcome.as_ref()
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped
    }

    pub fn is_missed(&self) -> bool {
        self.missed
    }

    /// Attempts made so far. Inside the job procedure this is the number of
    /// attempts that already finished.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// True when the occurrence ran here and its last attempt succeeded.
    pub fn passed(&self) -> bool {
        !self.skipped && !self.missed && self.attempts > 0 && self.outcome.is_none()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::TimeZone;

    use super::*;

    pub(crate) fn sample_task() -> Task {
        let planned_at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        Task::new(
            "fleet",
            "node-a",
            JobMeta::detached("report", "0 * * * * *"),
            Fire {
                planned_at,
                next_at: planned_at + chrono::Duration::minutes(1),
            },
        )
    }

    #[test]
    fn key_uses_planned_instant_in_seconds() {
        let task = sample_task();
        assert_eq!(task.key(), "cron:fleet.report@1772366400");
        assert_eq!(task.job().key(), "report");
        assert_eq!(task.hostname(), "node-a");
        assert_eq!(task.attempts(), 0);
        assert!(!task.passed());
    }

    #[test]
    fn same_tick_gives_same_key_on_every_instance() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(occurrence_key("f", "j", at), occurrence_key("f", "j", at));
        assert_ne!(
            occurrence_key("f", "j", at),
            occurrence_key("f", "j", at + chrono::Duration::seconds(1))
        );
        assert_ne!(occurrence_key("f", "j", at), occurrence_key("g", "j", at));
    }
}

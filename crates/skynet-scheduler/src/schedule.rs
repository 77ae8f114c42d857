use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Utc};
use cron::Schedule;

use crate::error::{CronError, Result};

/// A parsed cron spec evaluated in a fixed UTC offset.
///
/// Accepts 6-field specs with seconds (`sec min hour dom month dow`), the
/// optional 7th year field, `@daily`-style shorthands, and standard 5-field
/// Unix specs, which fire at second 0.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    spec: String,
    schedule: Schedule,
    offset: FixedOffset,
}

impl CronSchedule {
    pub fn parse(spec: &str, offset: FixedOffset) -> Result<Self> {
        let schedule =
            Schedule::from_str(&normalize_spec(spec)).map_err(|e| CronError::InvalidSchedule {
                spec: spec.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            spec: spec.to_string(),
            schedule,
            offset,
        })
    }

    pub fn spec(&self) -> &str {
        &self.spec
    }

    /// First fire time strictly after `after`, or `None` once exhausted.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.offset))
            .next()
            .map(|at| at.with_timezone(&Utc))
    }
}

fn normalize_spec(spec: &str) -> String {
    let spec = spec.trim();
    if spec.split_whitespace().count() == 5 {
        format!("0 {spec}")
    } else {
        spec.to_string()
    }
}

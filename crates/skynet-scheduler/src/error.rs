use std::sync::Arc;

use thiserror::Error;

/// Error type returned by job procedures and claim backends.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while building a [`Cron`](crate::Cron) or registering jobs.
#[derive(Debug, Error)]
pub enum CronError {
    /// A job was registered with an empty key.
    #[error("empty key")]
    EmptyKey,

    /// A job with the same key is already registered on this cron.
    #[error("added already: {key}")]
    DuplicateKey { key: String },

    /// The schedule oracle rejected the job's spec.
    #[error("Invalid schedule {spec:?}: {reason}")]
    InvalidSchedule { spec: String, reason: String },

    /// Conflicting or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// One or more jobs of a batch failed to register.
    #[error("{}", join_job_errors(.0))]
    Jobs(Vec<JobError>),
}

/// A registration failure labelled with the offending job key.
#[derive(Debug, Error)]
#[error("add job {key}: {source}")]
pub struct JobError {
    pub key: String,
    #[source]
    pub source: CronError,
}

fn join_job_errors(errors: &[JobError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Why a single run attempt of a job failed.
///
/// Cloneable so the finalized occurrence can be handed to hooks and
/// returned to callers without giving up the recorded outcome.
#[derive(Debug, Clone, Error)]
pub enum RunError {
    /// The job procedure returned an error.
    #[error("{0}")]
    Failed(Arc<dyn std::error::Error + Send + Sync>),

    /// The job procedure panicked; converted at the run boundary.
    #[error("panic({message}) at {location}")]
    Panicked {
        message: String,
        location: String,
        backtrace: String,
    },
}

impl RunError {
    pub fn is_panic(&self) -> bool {
        matches!(self, RunError::Panicked { .. })
    }
}

impl From<BoxError> for RunError {
    fn from(err: BoxError) -> Self {
        RunError::Failed(Arc::from(err))
    }
}

pub type Result<T> = std::result::Result<T, CronError>;

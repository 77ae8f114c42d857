//! `skynet-scheduler` — fleet-coordinated cron for Tokio.
//!
//! # Overview
//!
//! Every instance of a fleet registers the same jobs on a [`Cron`]. When a
//! job's schedule fires, each instance derives the same occurrence key from
//! the fleet key, the job key and the planned fire time, and asks the
//! injected [`Claim`] backend for it. Only the instance that wins the claim
//! runs the job; the others record the occurrence as missed.
//!
//! Per occurrence the coordinator runs, in order:
//!
//! | Step     | Behaviour                                                     |
//! |----------|---------------------------------------------------------------|
//! | before   | optional hook, may skip the occurrence                         |
//! | claim    | [`Claim`] backend, optionally gated by a throttle [`Group`]    |
//! | run      | up to `retry_times` attempts, never past the next fire time   |
//! | after    | optional hook, receives the finalized [`Task`]                 |
//! | stats    | per-job [`Statistics`], summable across jobs                   |
//!
//! Panics inside a job are caught at the run boundary and recorded as a
//! [`RunError::Panicked`]; nothing a job does can stop the cron.

pub mod claim;
mod coordinator;
pub mod cron;
pub mod error;
pub mod group;
pub mod job;
mod panic;
pub mod schedule;
pub mod statistics;
pub mod task;
pub mod ticker;

pub use claim::Claim;
pub use cron::{Cron, CronBuilder};
pub use error::{BoxError, CronError, JobError, Result, RunError};
pub use group::Group;
pub use job::{job_fn, FnJob, Job, JobMeta, JobOptions};
pub use statistics::Statistics;
pub use task::{occurrence_key, Task};

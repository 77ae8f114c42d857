//! Shell-command jobs.
//!
//! The command runs through `sh -c` with the occurrence exported as
//! `SKYNET_CRON_TASK` (occurrence key) and `SKYNET_CRON_PLANNED_AT` (RFC 3339).
//! Exit code 0 is success; anything else fails the attempt with the exit
//! status and trimmed stderr.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skynet_scheduler::{BoxError, Job, JobOptions, Task};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to launch `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {secs}s")]
    TimedOut { secs: u64 },

    #[error("exit {code}: {stderr}")]
    Failed { code: i32, stderr: String },
}

pub struct CommandJob {
    key: String,
    spec: String,
    command: String,
    timeout: Option<Duration>,
    options: JobOptions,
}

impl CommandJob {
    pub fn new(
        key: impl Into<String>,
        spec: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            spec: spec.into(),
            command: command.into(),
            timeout: None,
            options: JobOptions::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// Run the command once, returning its trimmed stdout.
    pub async fn execute(
        &self,
        task_key: &str,
        planned_at: DateTime<Utc>,
    ) -> Result<String, CommandError> {
        let run = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("SKYNET_CRON_TASK", task_key)
            .env("SKYNET_CRON_PLANNED_AT", planned_at.to_rfc3339())
            .kill_on_drop(true)
            .output();

        let out = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .map_err(|_| CommandError::TimedOut {
                    secs: limit.as_secs(),
                })?,
            None => run.await,
        }
        .map_err(|source| CommandError::Launch {
            command: self.command.clone(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if out.status.success() {
            Ok(stdout)
        } else {
            Err(CommandError::Failed {
                code: out.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl Job for CommandJob {
    fn key(&self) -> &str {
        &self.key
    }

    fn spec(&self) -> &str {
        &self.spec
    }

    async fn run(&self, task: &Task) -> Result<(), BoxError> {
        let stdout = self.execute(task.key(), task.planned_at()).await?;
        if !stdout.is_empty() {
            debug!(task = %task.key(), stdout = %stdout, "command output");
        }
        Ok(())
    }

    fn options(&self) -> JobOptions {
        self.options.clone()
    }
}

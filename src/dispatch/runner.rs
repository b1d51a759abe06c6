use crate::error::DispatchError;
use crate::stats::StatsEngine;
use crate::store::{Job, StatsResult};
use anyhow::{Context, Result, bail};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Executes the statistics run for a job the dispatcher already marked busy.
pub trait JobRunner {
    fn run(&self, job: &Job) -> Result<StatsResult>;
}

/// Runs the statistics engine on the dispatcher's own thread.
pub struct InProcessRunner<'a> {
    engine: StatsEngine<'a>,
}

impl<'a> InProcessRunner<'a> {
    pub fn new(engine: StatsEngine<'a>) -> Self {
        Self { engine }
    }
}

impl JobRunner for InProcessRunner<'_> {
    fn run(&self, job: &Job) -> Result<StatsResult> {
        let event = self
            .engine
            .store()
            .find_event(job.event_id)?
            .ok_or(DispatchError::EventNotFound(job.event_id))?;
        self.engine.process(&event)
    }
}

/// Hands the job to a child `eventmetrics process <event> --json` and waits
/// for it. The child commits the statistics and removes the job itself.
pub struct SubprocessRunner {
    program: PathBuf,
    args: Vec<OsString>,
}

impl SubprocessRunner {
    /// `args` go before the `process` subcommand, e.g. `--state-db <path>`.
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn current_exe(args: Vec<OsString>) -> Result<Self> {
        let program = std::env::current_exe().context("resolve eventmetrics executable")?;
        Ok(Self::new(program, args))
    }
}

impl JobRunner for SubprocessRunner {
    fn run(&self, job: &Job) -> Result<StatsResult> {
        tracing::debug!(job_id = job.id, program = %self.program.display(), "spawning worker process");
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg("process")
            .arg(job.event_id.to_string())
            .arg("--json")
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("spawn worker {}", self.program.display()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "worker for event {} exited with {}: {}",
                job.event_id,
                output.status,
                stderr.trim()
            );
        }
        serde_json::from_slice(&output.stdout)
            .with_context(|| format!("parse worker output for event {}", job.event_id))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::store::{JobStatus, Metric};
    use chrono::Utc;

    fn job() -> Job {
        Job {
            id: 1,
            event_id: 42,
            submitted_at: Utc::now(),
            started_at: Some(Utc::now()),
            status: JobStatus::Busy,
        }
    }

    fn sh(script: &str) -> SubprocessRunner {
        SubprocessRunner::new(
            "sh",
            vec!["-c".into(), script.into(), "eventmetrics".into()],
        )
    }

    #[test]
    fn parses_worker_json() {
        let runner = sh(
            r#"[ "$1" = process ] && [ "$2" = 42 ] && [ "$3" = --json ] && printf '{"participants":{"value":2},"retention":{"value":1,"offset":15}}'"#,
        );
        let result = runner.run(&job()).unwrap();
        assert_eq!(result[&Metric::Participants].value, 2);
        assert_eq!(result[&Metric::Retention].offset, Some(15));
    }

    #[test]
    fn non_zero_exit_is_an_error() {
        let err = sh("echo 'event not found: 42' >&2; exit 1")
            .run(&job())
            .unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("event not found: 42"));
    }
}

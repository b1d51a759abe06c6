pub mod runner;

use crate::error::DispatchError;
use crate::logging::ndjson::DispatchLog;
use crate::quota::QuotaMonitor;
use crate::store::{Event, Job, StatsResult, Store};
use anyhow::{Result, bail};
use serde_json::json;

pub use runner::{InProcessRunner, JobRunner, SubprocessRunner};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueSummary {
    pub created: usize,
    pub processed: usize,
}

/// Moves queued jobs to a runner, never starting more than the replica quota
/// allows.
///
/// Jobs run one after another: the quota bounds concurrent work across
/// dispatcher processes, not inside one. A job is marked busy and committed
/// before its runner starts, so another dispatcher listing the queue afterwards
/// skips it. Two dispatchers listing at the same instant can still both see
/// the job queued; the compare-and-set in [`Store::mark_started`] lets only
/// one of them run it.
pub struct Dispatcher<'a> {
    store: &'a Store,
    quota: QuotaMonitor<'a>,
    runner: &'a dyn JobRunner,
    log: DispatchLog,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        store: &'a Store,
        quota: QuotaMonitor<'a>,
        runner: &'a dyn JobRunner,
        log: DispatchLog,
    ) -> Self {
        Self {
            store,
            quota,
            runner,
            log,
        }
    }

    /// Runs up to `available_quota()` queued jobs, oldest first. Returns how
    /// many were handed to the runner, failed runs included.
    pub fn spawn_all(&self) -> Result<usize> {
        let quota = self.quota.available_quota()?;
        self.log.record(
            "quota",
            json!({"available": quota, "hard_limit": self.quota.hard_quota()}),
        )?;
        if quota == 0 {
            tracing::warn!("{}; try again later", DispatchError::InsufficientQuota);
            return Ok(0);
        }

        let jobs = self.store.list_queued(quota as usize)?;
        if jobs.is_empty() {
            tracing::info!("no jobs queued");
            return Ok(0);
        }

        let mut processed = 0;
        for mut job in jobs {
            if !self.store.mark_started(&mut job)? {
                tracing::info!(job_id = job.id, "job taken by another dispatcher; skipping");
                continue;
            }
            processed += 1;
            // One failed event must not stop the rest of the batch.
            if let Err(err) = self.run_started(&job) {
                tracing::error!(job_id = job.id, event_id = job.event_id, "job failed: {err:#}");
            }
        }
        Ok(processed)
    }

    /// Runs a single job right away. Fails with `InsufficientQuota` instead of
    /// waiting when no replica connections are free.
    pub fn spawn(&self, job_id: i64) -> Result<StatsResult> {
        let mut job = self
            .store
            .find_job(job_id)?
            .ok_or(DispatchError::JobNotFound(job_id))?;
        let quota = self.quota.available_quota()?;
        self.log.record(
            "quota",
            json!({"available": quota, "hard_limit": self.quota.hard_quota(), "job": job_id}),
        )?;
        if quota == 0 {
            return Err(DispatchError::InsufficientQuota.into());
        }
        if !self.store.mark_started(&mut job)? {
            bail!("job {job_id} is already being processed");
        }
        self.run_started(&job)
    }

    /// Queues a job for every valid event that lacks one, in one transaction,
    /// then dispatches unless `no_spawn`.
    pub fn create_jobs_for_all_eligible_events(&self, no_spawn: bool) -> Result<EnqueueSummary> {
        let events = self.store.list_events()?;
        let eligible = events
            .iter()
            .filter(|event| event.is_valid() && !event.has_job())
            .collect::<Vec<&Event>>();
        let jobs = self.store.enqueue_many(eligible)?;
        for job in &jobs {
            self.log
                .record("job_queued", json!({"job": job.id, "event": job.event_id}))?;
        }
        tracing::info!(created = jobs.len(), "queued jobs for eligible events");

        let processed = if no_spawn { 0 } else { self.spawn_all()? };
        Ok(EnqueueSummary {
            created: jobs.len(),
            processed,
        })
    }

    /// Once a job is busy, every path out of here either finishes it or
    /// removes it, so dispatch-log writes must not abort the run.
    fn run_started(&self, job: &Job) -> Result<StatsResult> {
        self.note("job_started", json!({"job": job.id, "event": job.event_id}));
        match self.runner.run(job) {
            Ok(result) => {
                self.note(
                    "job_finished",
                    json!({"job": job.id, "event": job.event_id, "stats": result}),
                );
                Ok(result)
            }
            Err(err) => {
                // Failed runs are dropped after this single attempt, not retried.
                if let Err(remove_err) = self.store.remove_job(job.id) {
                    tracing::error!(job_id = job.id, "could not remove failed job: {remove_err:#}");
                }
                self.note(
                    "job_failed",
                    json!({"job": job.id, "event": job.event_id, "error": format!("{err:#}")}),
                );
                Err(err)
            }
        }
    }

    fn note(&self, kind: &str, details: serde_json::Value) {
        if let Err(err) = self.log.record(kind, details) {
            tracing::warn!(record = kind, "dispatch log write failed: {err:#}");
        }
    }
}

use crate::error::DispatchError;
use crate::store::events::Event;
use crate::store::{Store, format_ts, parse_ts};
use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::{ErrorCode, OptionalExtension, Row, Transaction, params};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Persisted job states. Finishing a job deletes its row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Busy,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Busy => "busy",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "queued" => Ok(Self::Queued),
            "busy" => Ok(Self::Busy),
            other => bail!("unknown job status `{other}`"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Job {
    pub id: i64,
    pub event_id: i64,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
}

const JOB_COLUMNS: &str = "id, event_id, submitted_at, started_at, status";

fn map_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let submitted_at: String = row.get(2)?;
    let started_at: Option<String> = row.get(3)?;
    let status: String = row.get(4)?;
    Ok(Job {
        id: row.get(0)?,
        event_id: row.get(1)?,
        submitted_at: parse_ts(&submitted_at)?,
        started_at: started_at.as_deref().map(parse_ts).transpose()?,
        status: status.parse().map_err(|err: anyhow::Error| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, err.into())
        })?,
    })
}

fn insert_job_tx(tx: &Transaction<'_>, event: &Event, now: DateTime<Utc>) -> Result<Job> {
    if !event.is_valid() {
        return Err(DispatchError::InvalidEvent(event.id).into());
    }
    if event.has_job() {
        return Err(DispatchError::AlreadyQueued(event.id).into());
    }
    let inserted = tx.execute(
        "INSERT INTO jobs (event_id, submitted_at, status) VALUES (?1, ?2, 'queued')",
        params![event.id, format_ts(now)],
    );
    match inserted {
        Ok(_) => Ok(Job {
            id: tx.last_insert_rowid(),
            event_id: event.id,
            submitted_at: now,
            started_at: None,
            status: JobStatus::Queued,
        }),
        // The event snapshot was stale: another process queued it meanwhile.
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == ErrorCode::ConstraintViolation =>
        {
            Err(DispatchError::AlreadyQueued(event.id).into())
        }
        Err(err) => Err(err.into()),
    }
}

impl Store {
    /// Queues a job for `event`, rejecting invalid events and events that
    /// already have one.
    pub fn enqueue(&self, event: &Event) -> Result<Job> {
        let tx = self.conn.unchecked_transaction()?;
        let job = insert_job_tx(&tx, event, Utc::now())?;
        tx.commit()?;
        Ok(job)
    }

    /// Queues jobs for all `events` in one transaction. Events that are
    /// invalid or already queued are skipped rather than failing the batch.
    pub fn enqueue_many<'a, I>(&self, events: I) -> Result<Vec<Job>>
    where
        I: IntoIterator<Item = &'a Event>,
    {
        let tx = self.conn.unchecked_transaction()?;
        let now = Utc::now();
        let mut jobs = Vec::new();
        for event in events {
            match insert_job_tx(&tx, event, now) {
                Ok(job) => jobs.push(job),
                Err(err) => match DispatchError::of(&err) {
                    Some(DispatchError::AlreadyQueued(_) | DispatchError::InvalidEvent(_)) => {
                        tracing::debug!(event_id = event.id, "skipping event: {err}");
                    }
                    _ => return Err(err),
                },
            }
        }
        tx.commit()?;
        Ok(jobs)
    }

    /// Oldest queued jobs first.
    pub fn list_queued(&self, limit: usize) -> Result<Vec<Job>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'queued'
             ORDER BY submitted_at ASC, id ASC LIMIT ?1"
        ))?;
        let jobs = stmt
            .query_map(params![limit as i64], map_job)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY submitted_at ASC, id ASC"
        ))?;
        let jobs = stmt
            .query_map([], map_job)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    pub fn find_job(&self, job_id: i64) -> Result<Option<Job>> {
        self.conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![job_id],
                map_job,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn find_job_for_event(&self, event_id: i64) -> Result<Option<Job>> {
        self.conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE event_id = ?1"),
                params![event_id],
                map_job,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Flips a queued job to busy and commits immediately. Returns false when
    /// the job is no longer queued (another dispatcher took it, or it is gone).
    pub fn mark_started(&self, job: &mut Job) -> Result<bool> {
        let now = Utc::now();
        let changed = self.conn.execute(
            "UPDATE jobs SET status = 'busy', started_at = ?2 WHERE id = ?1 AND status = 'queued'",
            params![job.id, format_ts(now)],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        job.status = JobStatus::Busy;
        job.started_at = Some(now);
        Ok(true)
    }

    pub fn remove_job(&self, job_id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM jobs WHERE id = ?1", params![job_id])?;
        Ok(changed > 0)
    }

    pub fn remove_event_job(&self, event_id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM jobs WHERE event_id = ?1", params![event_id])?;
        Ok(changed > 0)
    }

    pub(crate) fn remove_event_job_tx(tx: &Transaction<'_>, event_id: i64) -> Result<()> {
        tx.execute("DELETE FROM jobs WHERE event_id = ?1", params![event_id])?;
        Ok(())
    }

    pub fn count_busy(&self) -> Result<u32> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = 'busy'",
            [],
            |row| row.get(0),
        )?;
        Ok(u32::try_from(count)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::events::{NewEvent, Timezone, parse_local_datetime};
    use tempfile::{TempDir, tempdir};

    fn store_with_event(wikis: &[&str]) -> (TempDir, Store, i64) {
        let tmp = tempdir().unwrap();
        let store = Store::open(&tmp.path().join("state.db")).unwrap();
        let id = store
            .insert_event(&NewEvent {
                title: "Edit-a-thon".to_string(),
                start: parse_local_datetime("2015-01-01", false).unwrap(),
                end: parse_local_datetime("2015-01-02", true).unwrap(),
                timezone: Timezone::utc(),
                participants: vec!["Alice".to_string()],
                wikis: wikis.iter().map(ToString::to_string).collect(),
                retention_offset_days: None,
            })
            .unwrap();
        (tmp, store, id)
    }

    #[test]
    fn enqueue_rejects_second_job_for_same_event() {
        let (_tmp, store, id) = store_with_event(&["enwiki"]);
        let event = store.find_event(id).unwrap().unwrap();
        let job = store.enqueue(&event).unwrap();
        assert_eq!(job.status, JobStatus::Queued);

        let event = store.find_event(id).unwrap().unwrap();
        assert!(event.has_job());
        let err = store.enqueue(&event).unwrap_err();
        assert!(matches!(
            DispatchError::of(&err),
            Some(DispatchError::AlreadyQueued(_))
        ));
        assert_eq!(store.list_jobs().unwrap().len(), 1);
    }

    #[test]
    fn unique_constraint_catches_stale_event_snapshot() {
        let (_tmp, store, id) = store_with_event(&["enwiki"]);
        let stale = store.find_event(id).unwrap().unwrap();
        store.enqueue(&stale).unwrap();
        let err = store.enqueue(&stale).unwrap_err();
        assert!(matches!(
            DispatchError::of(&err),
            Some(DispatchError::AlreadyQueued(_))
        ));
        assert_eq!(store.list_jobs().unwrap().len(), 1);
    }

    #[test]
    fn enqueue_rejects_invalid_event() {
        let (_tmp, store, id) = store_with_event(&[]);
        let event = store.find_event(id).unwrap().unwrap();
        let err = store.enqueue(&event).unwrap_err();
        assert!(matches!(
            DispatchError::of(&err),
            Some(DispatchError::InvalidEvent(_))
        ));
        assert!(store.list_jobs().unwrap().is_empty());
    }

    #[test]
    fn mark_started_is_compare_and_set() {
        let (_tmp, store, id) = store_with_event(&["enwiki"]);
        let event = store.find_event(id).unwrap().unwrap();
        let job = store.enqueue(&event).unwrap();

        let mut first = job.clone();
        let mut second = job.clone();
        assert!(store.mark_started(&mut first).unwrap());
        assert_eq!(first.status, JobStatus::Busy);
        assert!(!store.mark_started(&mut second).unwrap());
        assert_eq!(second.status, JobStatus::Queued);

        assert_eq!(store.count_busy().unwrap(), 1);
        assert!(store.list_queued(10).unwrap().is_empty());
        let persisted = store.find_job(job.id).unwrap().unwrap();
        assert_eq!(persisted.status, JobStatus::Busy);
        assert!(persisted.started_at.is_some());
    }

    #[test]
    fn remove_job_deletes_row() {
        let (_tmp, store, id) = store_with_event(&["enwiki"]);
        let event = store.find_event(id).unwrap().unwrap();
        let job = store.enqueue(&event).unwrap();
        assert!(store.remove_job(job.id).unwrap());
        assert!(!store.remove_job(job.id).unwrap());
        assert!(store.find_job(job.id).unwrap().is_none());
        assert!(!store.find_event(id).unwrap().unwrap().has_job());
    }
}

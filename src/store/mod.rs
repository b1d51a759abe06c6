pub mod events;
pub mod jobs;
pub mod schema;
pub mod stats;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

pub use events::{Event, NewEvent, Timezone};
pub use jobs::{Job, JobStatus};
pub use stats::{EventStat, EventWikiStat, Metric, StatValue, StatsBatch, StatsResult};

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// SQLite-backed state shared by every dispatcher process: events, jobs and
/// computed statistics.
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create db parent dir {}", parent.display()))?;
        }
        let conn =
            Connection::open(path).with_context(|| format!("open sqlite db {}", path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        schema::migrate(&conn)?;
        Ok(Self { conn })
    }
}

pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
        })
}

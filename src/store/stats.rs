use crate::store::Store;
use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Metric {
    Participants,
    NewEditors,
    PagesCreated,
    PagesImproved,
    Edits,
    ByteDifference,
    Retention,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Participants => "participants",
            Self::NewEditors => "new-editors",
            Self::PagesCreated => "pages-created",
            Self::PagesImproved => "pages-improved",
            Self::Edits => "edits",
            Self::ByteDifference => "byte-difference",
            Self::Retention => "retention",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        Ok(match raw {
            "participants" => Self::Participants,
            "new-editors" => Self::NewEditors,
            "pages-created" => Self::PagesCreated,
            "pages-improved" => Self::PagesImproved,
            "edits" => Self::Edits,
            "byte-difference" => Self::ByteDifference,
            "retention" => Self::Retention,
            other => bail!("unknown metric `{other}`"),
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatValue {
    pub value: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
}

/// Metric name to value, as returned by one statistics run.
pub type StatsResult = BTreeMap<Metric, StatValue>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventStat {
    pub event_id: i64,
    pub metric: Metric,
    pub value: i64,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventWikiStat {
    pub event_id: i64,
    pub db_name: String,
    pub metric: Metric,
    pub value: i64,
}

/// Statistics collected in memory during a run and written in one commit.
/// Setting a metric twice keeps the latest value.
#[derive(Debug, Clone, Default)]
pub struct StatsBatch {
    event: StatsResult,
    wiki: BTreeMap<(String, Metric), i64>,
}

impl StatsBatch {
    pub fn set(&mut self, metric: Metric, value: i64, offset: Option<i64>) {
        self.event.insert(metric, StatValue { value, offset });
    }

    pub fn set_wiki(&mut self, db_name: &str, metric: Metric, value: i64) {
        self.wiki.insert((db_name.to_string(), metric), value);
    }

    pub fn result(&self) -> StatsResult {
        self.event.clone()
    }
}

impl Store {
    /// Upserts every stat in `batch`, clears the event's job and stamps
    /// `updated`, all in one transaction.
    pub fn commit_event_stats(
        &self,
        event_id: i64,
        batch: &StatsBatch,
        updated: DateTime<Utc>,
    ) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for (metric, stat) in &batch.event {
            tx.execute(
                "INSERT INTO event_stats (event_id, metric, value, offset_days) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(event_id, metric) DO UPDATE SET value = excluded.value, offset_days = excluded.offset_days",
                params![event_id, metric.as_str(), stat.value, stat.offset],
            )?;
        }
        for ((db_name, metric), value) in &batch.wiki {
            tx.execute(
                "INSERT INTO event_wiki_stats (event_id, db_name, metric, value) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(event_id, db_name, metric) DO UPDATE SET value = excluded.value",
                params![event_id, db_name, metric.as_str(), value],
            )?;
        }
        Self::remove_event_job_tx(&tx, event_id)?;
        Self::touch_event_updated(&tx, event_id, updated)?;
        tx.commit()?;
        Ok(())
    }

    pub fn event_stats(&self, event_id: i64) -> Result<Vec<EventStat>> {
        let mut stmt = self.conn.prepare(
            "SELECT metric, value, offset_days FROM event_stats WHERE event_id = ?1 ORDER BY metric ASC",
        )?;
        let rows = stmt
            .query_map(params![event_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(metric, value, offset)| {
                Ok(EventStat {
                    event_id,
                    metric: metric.parse()?,
                    value,
                    offset,
                })
            })
            .collect()
    }

    pub fn event_wiki_stats(&self, event_id: i64) -> Result<Vec<EventWikiStat>> {
        let mut stmt = self.conn.prepare(
            "SELECT db_name, metric, value FROM event_wiki_stats WHERE event_id = ?1
             ORDER BY db_name ASC, metric ASC",
        )?;
        let rows = stmt
            .query_map(params![event_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(db_name, metric, value)| {
                Ok(EventWikiStat {
                    event_id,
                    db_name,
                    metric: metric.parse()?,
                    value,
                })
            })
            .collect()
    }
}

pub mod sqlite;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

pub use sqlite::SqliteReplicas;

const MW_TS_FORMAT: &str = "%Y%m%d%H%M%S";

/// Per-wiki activity of a participant set inside an event window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageCounts {
    pub created: i64,
    pub improved: i64,
    pub edits: i64,
    pub bytes: i64,
}

/// Read-only queries against the wiki replica databases.
pub trait ReplicaQuery {
    /// Earliest edit of each user on `db_name`. Users without edits are absent.
    fn first_edits(
        &self,
        db_name: &str,
        usernames: &[String],
    ) -> Result<BTreeMap<String, DateTime<Utc>>>;

    fn page_counts(
        &self,
        db_name: &str,
        usernames: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<PageCounts>;

    /// Users from `usernames` with at least one edit on or after `since`.
    fn edited_since(
        &self,
        db_name: &str,
        usernames: &[String],
        since: DateTime<Utc>,
    ) -> Result<BTreeSet<String>>;

    /// Wikis on which every one of `usernames` has edited, sorted.
    fn common_wikis(&self, usernames: &[String]) -> Result<Vec<String>>;
}

pub fn to_mw_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(MW_TS_FORMAT).to_string()
}

pub fn from_mw_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, MW_TS_FORMAT)
        .map(|ts| ts.and_utc())
        .with_context(|| format!("parse replica timestamp `{raw}`"))
}

use crate::store::jobs::Job;
use crate::store::{Store, format_ts, parse_ts};
use anyhow::{Context, Result, bail};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Offset, TimeDelta, Utc};
use rusqlite::{OptionalExtension, params};
use std::collections::{BTreeSet, HashSet};
use std::fmt;

const LOCAL_TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Fixed UTC offset an event's local start/end are expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timezone(FixedOffset);

impl Timezone {
    pub fn utc() -> Self {
        Self(Utc.fix())
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("utc") || raw == "Z" {
            return Ok(Self::utc());
        }
        let (sign, rest) = if let Some(rest) = raw.strip_prefix('+') {
            (1, rest)
        } else if let Some(rest) = raw.strip_prefix('-') {
            (-1, rest)
        } else {
            bail!("unsupported timezone `{raw}`; expected `UTC` or an offset like `+02:00`")
        };
        let digits = rest.replace(':', "");
        if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
            bail!("unsupported timezone `{raw}`; expected `UTC` or an offset like `+02:00`");
        }
        let hours: i32 = digits[..2].parse()?;
        let minutes: i32 = digits[2..].parse()?;
        if minutes >= 60 {
            bail!("invalid minutes in timezone `{raw}`");
        }
        let secs = sign * (hours * 3600 + minutes * 60);
        FixedOffset::east_opt(secs)
            .map(Self)
            .ok_or_else(|| anyhow::anyhow!("timezone offset out of range: `{raw}`"))
    }

    pub fn to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        (local - TimeDelta::seconds(i64::from(self.0.local_minus_utc()))).and_utc()
    }
}

impl fmt::Display for Timezone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.local_minus_utc();
        if secs == 0 {
            return write!(f, "UTC");
        }
        let sign = if secs < 0 { '-' } else { '+' };
        let secs = secs.abs();
        write!(f, "{sign}{:02}:{:02}", secs / 3600, (secs % 3600) / 60)
    }
}

/// An edit-a-thon as seen by the statistics pipeline.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: i64,
    pub title: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub timezone: Timezone,
    /// Usernames in registration order, without duplicates.
    pub participants: Vec<String>,
    /// Associated wiki database names, sorted.
    pub wikis: Vec<String>,
    pub retention_offset_days: Option<i64>,
    pub updated: Option<DateTime<Utc>>,
    pub job: Option<Job>,
}

impl Event {
    pub fn is_valid(&self) -> bool {
        self.start <= self.end && !self.wikis.is_empty() && !self.participants.is_empty()
    }

    pub fn has_job(&self) -> bool {
        self.job.is_some()
    }

    pub fn start_utc(&self) -> DateTime<Utc> {
        self.timezone.to_utc(self.start)
    }

    pub fn end_utc(&self) -> DateTime<Utc> {
        self.timezone.to_utc(self.end)
    }
}

#[derive(Debug, Clone)]
pub struct NewEvent {
    pub title: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub timezone: Timezone,
    pub participants: Vec<String>,
    pub wikis: Vec<String>,
    pub retention_offset_days: Option<i64>,
}

/// Parses `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DDTHH:MM:SS` or a bare date. A bare
/// date means the start of that day, or its last second when `end_of_day`.
pub fn parse_local_datetime(raw: &str, end_of_day: bool) -> Result<NaiveDateTime> {
    let raw = raw.trim();
    for fmt in [LOCAL_TS_FORMAT, "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(ts);
        }
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("parse event timestamp `{raw}`"))?;
    let ts = if end_of_day {
        date.and_hms_opt(23, 59, 59)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    ts.ok_or_else(|| anyhow::anyhow!("invalid event timestamp `{raw}`"))
}

fn normalize_participants(raw: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.iter()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

fn normalize_wikis(raw: &[String]) -> Vec<String> {
    raw.iter()
        .map(|db| db.trim().to_string())
        .filter(|db| !db.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

struct EventRow {
    id: i64,
    title: String,
    start_at: String,
    end_at: String,
    timezone: String,
    retention_offset_days: Option<i64>,
    updated_at: Option<String>,
}

impl Store {
    pub fn insert_event(&self, event: &NewEvent) -> Result<i64> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO events (title, start_at, end_at, timezone, retention_offset_days)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.title,
                event.start.format(LOCAL_TS_FORMAT).to_string(),
                event.end.format(LOCAL_TS_FORMAT).to_string(),
                event.timezone.to_string(),
                event.retention_offset_days
            ],
        )?;
        let id = tx.last_insert_rowid();
        for (position, username) in normalize_participants(&event.participants)
            .iter()
            .enumerate()
        {
            tx.execute(
                "INSERT INTO event_participants (event_id, username, position) VALUES (?1, ?2, ?3)",
                params![id, username, position as i64],
            )?;
        }
        for db_name in normalize_wikis(&event.wikis) {
            tx.execute(
                "INSERT INTO event_wikis (event_id, db_name) VALUES (?1, ?2)",
                params![id, db_name],
            )?;
        }
        tx.commit()?;
        Ok(id)
    }

    pub fn find_event(&self, event_id: i64) -> Result<Option<Event>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, title, start_at, end_at, timezone, retention_offset_days, updated_at
                 FROM events WHERE id = ?1",
                params![event_id],
                |row| {
                    Ok(EventRow {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        start_at: row.get(2)?,
                        end_at: row.get(3)?,
                        timezone: row.get(4)?,
                        retention_offset_days: row.get(5)?,
                        updated_at: row.get(6)?,
                    })
                },
            )
            .optional()?;
        row.map(|row| self.hydrate_event(row)).transpose()
    }

    pub fn list_events(&self) -> Result<Vec<Event>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, start_at, end_at, timezone, retention_offset_days, updated_at
             FROM events ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(EventRow {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    start_at: row.get(2)?,
                    end_at: row.get(3)?,
                    timezone: row.get(4)?,
                    retention_offset_days: row.get(5)?,
                    updated_at: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(|row| self.hydrate_event(row)).collect()
    }

    fn hydrate_event(&self, row: EventRow) -> Result<Event> {
        let start = NaiveDateTime::parse_from_str(&row.start_at, LOCAL_TS_FORMAT)
            .with_context(|| format!("parse start_at of event {}", row.id))?;
        let end = NaiveDateTime::parse_from_str(&row.end_at, LOCAL_TS_FORMAT)
            .with_context(|| format!("parse end_at of event {}", row.id))?;
        let timezone = Timezone::parse(&row.timezone)
            .with_context(|| format!("parse timezone of event {}", row.id))?;
        let updated = row
            .updated_at
            .as_deref()
            .map(parse_ts)
            .transpose()
            .with_context(|| format!("parse updated_at of event {}", row.id))?;

        let mut stmt = self.conn.prepare_cached(
            "SELECT username FROM event_participants WHERE event_id = ?1 ORDER BY position ASC",
        )?;
        let participants = stmt
            .query_map(params![row.id], |r| r.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut stmt = self.conn.prepare_cached(
            "SELECT db_name FROM event_wikis WHERE event_id = ?1 ORDER BY db_name ASC",
        )?;
        let wikis = stmt
            .query_map(params![row.id], |r| r.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Event {
            id: row.id,
            title: row.title,
            start,
            end,
            timezone,
            participants,
            wikis,
            retention_offset_days: row.retention_offset_days,
            updated,
            job: self.find_job_for_event(row.id)?,
        })
    }

    pub(crate) fn touch_event_updated(
        tx: &rusqlite::Transaction<'_>,
        event_id: i64,
        updated: DateTime<Utc>,
    ) -> Result<()> {
        let changed = tx.execute(
            "UPDATE events SET updated_at = ?2 WHERE id = ?1",
            params![event_id, format_ts(updated)],
        )?;
        if changed == 0 {
            bail!("event {event_id} disappeared before its statistics were saved");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_offsets_and_utc() {
        assert_eq!(Timezone::parse("UTC").unwrap(), Timezone::utc());
        assert_eq!(Timezone::parse("+02:00").unwrap().to_string(), "+02:00");
        assert_eq!(Timezone::parse("-0530").unwrap().to_string(), "-05:30");
        assert!(Timezone::parse("Europe/Paris").is_err());
    }

    #[test]
    fn converts_local_window_to_utc() {
        let tz = Timezone::parse("+02:00").unwrap();
        let local = parse_local_datetime("2015-01-01", false).unwrap();
        assert_eq!(
            tz.to_utc(local).to_rfc3339(),
            "2014-12-31T22:00:00+00:00".to_string()
        );
        let end = parse_local_datetime("2015-01-02", true).unwrap();
        assert_eq!(end.format(LOCAL_TS_FORMAT).to_string(), "2015-01-02 23:59:59");
    }

    #[test]
    fn insert_and_find_roundtrip_normalizes_lists() {
        let tmp = tempdir().unwrap();
        let store = Store::open(&tmp.path().join("state.db")).unwrap();
        let id = store
            .insert_event(&NewEvent {
                title: "Art+Feminism".to_string(),
                start: parse_local_datetime("2015-01-01", false).unwrap(),
                end: parse_local_datetime("2015-01-02", true).unwrap(),
                timezone: Timezone::utc(),
                participants: vec![
                    "Bob".to_string(),
                    " Alice ".to_string(),
                    "Bob".to_string(),
                ],
                wikis: vec!["frwiki".to_string(), "enwiki".to_string()],
                retention_offset_days: None,
            })
            .unwrap();

        let event = store.find_event(id).unwrap().unwrap();
        assert_eq!(event.participants, vec!["Bob", "Alice"]);
        assert_eq!(event.wikis, vec!["enwiki", "frwiki"]);
        assert!(event.is_valid());
        assert!(!event.has_job());
        assert!(event.updated.is_none());
        assert!(store.find_event(id + 1).unwrap().is_none());
    }

    #[test]
    fn event_without_wikis_is_invalid() {
        let tmp = tempdir().unwrap();
        let store = Store::open(&tmp.path().join("state.db")).unwrap();
        let id = store
            .insert_event(&NewEvent {
                title: "No wikis".to_string(),
                start: parse_local_datetime("2015-01-01", false).unwrap(),
                end: parse_local_datetime("2015-01-02", true).unwrap(),
                timezone: Timezone::utc(),
                participants: vec!["Alice".to_string()],
                wikis: Vec::new(),
                retention_offset_days: None,
            })
            .unwrap();
        assert!(!store.find_event(id).unwrap().unwrap().is_valid());
    }
}

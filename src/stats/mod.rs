pub mod retention;

use crate::error::DispatchError;
use crate::replica::ReplicaQuery;
use crate::store::{Event, Metric, StatsBatch, StatsResult, Store};
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::BTreeMap;

pub const DEFAULT_RETENTION_OFFSET_DAYS: i64 = 15;

/// Computes and persists the statistics of one event.
pub struct StatsEngine<'a> {
    store: &'a Store,
    replica: &'a dyn ReplicaQuery,
    retention_offset_days: i64,
}

impl<'a> StatsEngine<'a> {
    pub fn new(store: &'a Store, replica: &'a dyn ReplicaQuery, retention_offset_days: i64) -> Self {
        Self {
            store,
            replica,
            retention_offset_days,
        }
    }

    pub fn store(&self) -> &'a Store {
        self.store
    }

    pub fn process(&self, event: &Event) -> Result<StatsResult> {
        self.process_at(event, Utc::now())
    }

    /// Like [`StatsEngine::process`], with `now` deciding whether the retention
    /// window has elapsed. The `updated` stamp always uses the wall clock.
    ///
    /// Nothing is written unless every metric was computed; the stats, the job
    /// removal and the `updated` stamp then land in a single transaction. When
    /// a metric fails, the event's job is removed and `updated` is left alone.
    pub fn process_at(&self, event: &Event, now: DateTime<Utc>) -> Result<StatsResult> {
        tracing::info!(event_id = event.id, title = %event.title, "processing event");
        let batch = match self.compute(event, now) {
            Ok(batch) => batch,
            Err(err) => {
                // A failed run still consumes the event's job; there is no retry.
                match self.store.remove_event_job(event.id) {
                    Ok(true) => tracing::warn!(event_id = event.id, "removed job after failed run"),
                    Ok(false) => {}
                    Err(remove_err) => tracing::error!(
                        event_id = event.id,
                        "could not remove job after failed run: {remove_err:#}"
                    ),
                }
                return Err(DispatchError::ComputationFailure {
                    event_id: event.id,
                    source: err.into(),
                }
                .into());
            }
        };
        self.store
            .commit_event_stats(event.id, &batch, Utc::now())
            .with_context(|| format!("save statistics for event {}", event.id))?;
        let result = batch.result();
        tracing::info!(event_id = event.id, metrics = result.len(), "event statistics updated");
        Ok(result)
    }

    fn compute(&self, event: &Event, now: DateTime<Utc>) -> Result<StatsBatch> {
        let mut batch = StatsBatch::default();
        batch.set(Metric::Participants, event.participants.len() as i64, None);
        self.set_new_editors(event, &mut batch)
            .context("count new editors")?;
        self.set_pages_created_improved(event, &mut batch)
            .context("count pages created and improved")?;
        self.set_retention(event, now, &mut batch)
            .context("compute retention")?;
        Ok(batch)
    }

    /// Participants whose first edit on any associated wiki falls in the event window.
    fn set_new_editors(&self, event: &Event, batch: &mut StatsBatch) -> Result<()> {
        let mut first_edit = BTreeMap::<String, DateTime<Utc>>::new();
        for db_name in &event.wikis {
            for (user, ts) in self.replica.first_edits(db_name, &event.participants)? {
                first_edit
                    .entry(user)
                    .and_modify(|seen| *seen = (*seen).min(ts))
                    .or_insert(ts);
            }
        }
        let (start, end) = (event.start_utc(), event.end_utc());
        let count = first_edit
            .values()
            .filter(|ts| **ts >= start && **ts <= end)
            .count();
        tracing::debug!(event_id = event.id, count, "new editors");
        batch.set(Metric::NewEditors, count as i64, None);
        Ok(())
    }

    fn set_pages_created_improved(&self, event: &Event, batch: &mut StatsBatch) -> Result<()> {
        let (start, end) = (event.start_utc(), event.end_utc());
        let (mut created, mut improved, mut edits, mut bytes) = (0, 0, 0, 0);
        for db_name in &event.wikis {
            let counts = self
                .replica
                .page_counts(db_name, &event.participants, start, end)
                .with_context(|| format!("on {db_name}"))?;
            batch.set_wiki(db_name, Metric::PagesCreated, counts.created);
            batch.set_wiki(db_name, Metric::PagesImproved, counts.improved);
            batch.set_wiki(db_name, Metric::Edits, counts.edits);
            batch.set_wiki(db_name, Metric::ByteDifference, counts.bytes);
            created += counts.created;
            improved += counts.improved;
            edits += counts.edits;
            bytes += counts.bytes;
        }
        batch.set(Metric::PagesCreated, created, None);
        batch.set(Metric::PagesImproved, improved, None);
        batch.set(Metric::Edits, edits, None);
        batch.set(Metric::ByteDifference, bytes, None);
        Ok(())
    }

    fn set_retention(&self, event: &Event, now: DateTime<Utc>, batch: &mut StatsBatch) -> Result<()> {
        let offset = event
            .retention_offset_days
            .unwrap_or(self.retention_offset_days);
        let cutoff = TimeDelta::try_days(offset)
            .and_then(|delta| event.end_utc().checked_add_signed(delta))
            .ok_or_else(|| anyhow!("retention offset of {offset} days is out of range"))?;
        let participants = event.participants.len() as i64;

        if now < cutoff {
            // Window still open: everyone counts as retained until it closes.
            tracing::debug!(event_id = event.id, %cutoff, "retention window not elapsed");
            batch.set(Metric::Retention, participants, Some(offset));
            return Ok(());
        }

        let wikis = self.replica.common_wikis(&event.participants)?;
        let retained = retention::count_retained(&wikis, &event.participants, |db_name, users| {
            self.replica
                .edited_since(db_name, users, cutoff)
                .with_context(|| format!("on {db_name}"))
        })?;
        batch.set(Metric::Retention, retained as i64, Some(offset));
        Ok(())
    }
}

use crate::config::{self, AppConfig, RunnerMode};
use crate::dispatch::{Dispatcher, InProcessRunner, SubprocessRunner};
use crate::error::DispatchError;
use crate::logging::ndjson::DispatchLog;
use crate::quota::{BusyJobMonitor, QuotaMonitor};
use crate::replica::SqliteReplicas;
use crate::stats::StatsEngine;
use crate::store::events::parse_local_datetime;
use crate::store::{Event, NewEvent, StatsResult, Store, Timezone};
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Options shared by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    pub state_db: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub replica_dir: Option<PathBuf>,
    pub log: Option<PathBuf>,
}

pub fn default_state_db() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
        return PathBuf::from(xdg).join("eventmetrics").join("state.db");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home)
            .join(".local")
            .join("state")
            .join("eventmetrics")
            .join("state.db");
    }
    PathBuf::from(".eventmetrics/state.db")
}

struct App {
    store: Store,
    config: AppConfig,
    state_db: PathBuf,
    config_path: PathBuf,
    opts: GlobalOptions,
}

impl App {
    fn open(opts: GlobalOptions) -> Result<Self> {
        let config_path = opts.config.clone().unwrap_or_else(config::default_config_path);
        let config = config::load_config_or_default(&config_path)?;
        let state_db = opts.state_db.clone().unwrap_or_else(default_state_db);
        let store = Store::open(&state_db)?;
        Ok(Self {
            store,
            config,
            state_db,
            config_path,
            opts,
        })
    }

    fn replicas(&self) -> Result<SqliteReplicas> {
        let dir = self
            .opts
            .replica_dir
            .clone()
            .or_else(|| self.config.replicas.dir.clone())
            .ok_or_else(|| {
                anyhow!(
                    "no replica directory configured. Set `--replica-dir` or `[replicas].dir` in {}",
                    self.config_path.display()
                )
            })?;
        if !dir.is_dir() {
            return Err(anyhow!("replica directory {} does not exist", dir.display()));
        }
        Ok(SqliteReplicas::new(dir))
    }

    fn engine<'a>(&'a self, replicas: &'a SqliteReplicas) -> StatsEngine<'a> {
        StatsEngine::new(&self.store, replicas, self.config.retention.offset_days)
    }

    fn dispatch_log(&self) -> DispatchLog {
        DispatchLog::new(
            self.opts
                .log
                .clone()
                .or_else(|| self.config.dispatch.log.clone()),
        )
    }

    /// Global flags a worker process needs to see the same state and replicas.
    fn worker_args(&self) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("--state-db"),
            self.state_db.clone().into_os_string(),
            OsString::from("--config"),
            self.config_path.clone().into_os_string(),
        ];
        if let Some(dir) = self.opts.replica_dir.as_ref() {
            args.push(OsString::from("--replica-dir"));
            args.push(dir.clone().into_os_string());
        }
        args
    }

    fn event(&self, event_id: i64) -> Result<Event> {
        self.store
            .find_event(event_id)?
            .ok_or_else(|| DispatchError::EventNotFound(event_id).into())
    }

    fn with_dispatcher<T>(&self, f: impl FnOnce(&Dispatcher<'_>) -> Result<T>) -> Result<T> {
        let monitor = BusyJobMonitor::new(&self.store);
        let quota = QuotaMonitor::new(&monitor, self.config.quota.hard_limit);
        let log = self.dispatch_log();
        tracing::debug!(dispatch_id = log.dispatch_id(), runner = ?self.config.dispatch.runner, "dispatcher ready");
        match self.config.dispatch.runner {
            RunnerMode::InProcess => {
                let replicas = self.replicas()?;
                let runner = InProcessRunner::new(self.engine(&replicas));
                f(&Dispatcher::new(&self.store, quota, &runner, log))
            }
            RunnerMode::Subprocess => {
                let runner = SubprocessRunner::current_exe(self.worker_args())?;
                f(&Dispatcher::new(&self.store, quota, &runner, log))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct EventsFile {
    #[serde(default)]
    events: Vec<RawEvent>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    title: String,
    start: String,
    end: String,
    timezone: Option<String>,
    #[serde(default)]
    wikis: Vec<String>,
    #[serde(default)]
    participants: Vec<String>,
    retention_offset_days: Option<i64>,
}

fn parse_events_file(path: &Path) -> Result<Vec<NewEvent>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read events file {}", path.display()))?;
    let parsed: EventsFile =
        toml::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    parsed
        .events
        .into_iter()
        .enumerate()
        .map(|(idx, ev)| {
            let ctx = || format!("{} `[[events]]` at index {idx}", path.display());
            if let Some(days) = ev.retention_offset_days
                && days < 0
            {
                return Err(anyhow!("negative `retention_offset_days`")).with_context(ctx);
            }
            Ok(NewEvent {
                title: ev.title,
                start: parse_local_datetime(&ev.start, false).with_context(ctx)?,
                end: parse_local_datetime(&ev.end, true).with_context(ctx)?,
                timezone: Timezone::parse(ev.timezone.as_deref().unwrap_or("UTC"))
                    .with_context(ctx)?,
                participants: ev.participants,
                wikis: ev.wikis,
                retention_offset_days: ev.retention_offset_days,
            })
        })
        .collect()
}

pub fn import_events(opts: GlobalOptions, file: &Path) -> Result<Vec<i64>> {
    let app = App::open(opts)?;
    let events = parse_events_file(file)?;
    let mut ids = Vec::with_capacity(events.len());
    for event in &events {
        let id = app.store.insert_event(event)?;
        println!("Imported event {id}: {}", event.title);
        ids.push(id);
    }
    Ok(ids)
}

pub fn enqueue_event(opts: GlobalOptions, event_id: i64) -> Result<()> {
    let app = App::open(opts)?;
    let event = app.event(event_id)?;
    match app.store.enqueue(&event) {
        Ok(job) => {
            println!("Queued job {} for event {event_id}", job.id);
            Ok(())
        }
        Err(err) => match DispatchError::of(&err) {
            Some(DispatchError::AlreadyQueued(_)) => {
                println!("Event {event_id} already has a job; nothing to do");
                Ok(())
            }
            _ => Err(err),
        },
    }
}

/// Computes statistics for one event synchronously, bypassing the queue.
pub fn process_event(opts: GlobalOptions, event_id: i64, json: bool) -> Result<StatsResult> {
    let app = App::open(opts)?;
    let event = app.event(event_id)?;
    let replicas = app.replicas()?;
    let result = app.engine(&replicas).process(&event)?;
    if json {
        println!("{}", serde_json::to_string(&result)?);
    } else {
        println!("Updated statistics for event {event_id} ({})", event.title);
        print_stats(&result);
    }
    Ok(result)
}

pub fn spawn_jobs(opts: GlobalOptions, all: bool, no_spawn: bool, job: Option<i64>) -> Result<()> {
    let app = App::open(opts)?;
    app.with_dispatcher(|dispatcher| {
        if let Some(job_id) = job {
            return match dispatcher.spawn(job_id) {
                Ok(result) => {
                    println!("Job {job_id} finished");
                    print_stats(&result);
                    Ok(())
                }
                Err(err) => match DispatchError::of(&err) {
                    Some(DispatchError::InsufficientQuota) => {
                        println!("Insufficient quota to spawn job {job_id}; try again later");
                        Ok(())
                    }
                    _ => Err(err),
                },
            };
        }
        if all {
            let summary = dispatcher.create_jobs_for_all_eligible_events(no_spawn)?;
            println!(
                "Queued {} job(s); processed {} job(s)",
                summary.created, summary.processed
            );
            return Ok(());
        }
        let processed = dispatcher.spawn_all()?;
        println!("Processed {processed} job(s)");
        Ok(())
    })
}

pub fn list_jobs(opts: GlobalOptions) -> Result<()> {
    let app = App::open(opts)?;
    let jobs = app.store.list_jobs()?;
    if jobs.is_empty() {
        println!("No jobs");
        return Ok(());
    }
    for job in jobs {
        let started = job
            .started_at
            .map(|ts| ts.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "job={} event={} status={} submitted={} started={}",
            job.id,
            job.event_id,
            job.status,
            job.submitted_at.to_rfc3339(),
            started
        );
    }
    Ok(())
}

pub fn show_stats(opts: GlobalOptions, event_id: i64) -> Result<()> {
    let app = App::open(opts)?;
    let event = app.event(event_id)?;
    println!("event: {} ({})", event.id, event.title);
    println!(
        "window: {} .. {} {}",
        event.start, event.end, event.timezone
    );
    println!("valid: {}", event.is_valid());
    println!(
        "updated: {}",
        event
            .updated
            .map(|ts| ts.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );
    match event.job.as_ref() {
        Some(job) => println!("job: {} ({})", job.id, job.status),
        None => println!("job: none"),
    }

    let stats = app.store.event_stats(event_id)?;
    if !stats.is_empty() {
        println!("stats:");
        for stat in stats {
            match stat.offset {
                Some(offset) => println!("  {}: {} (offset {offset} days)", stat.metric, stat.value),
                None => println!("  {}: {}", stat.metric, stat.value),
            }
        }
    }
    let wiki_stats = app.store.event_wiki_stats(event_id)?;
    if !wiki_stats.is_empty() {
        println!("per_wiki:");
        for stat in wiki_stats {
            println!("  {} {}: {}", stat.db_name, stat.metric, stat.value);
        }
    }
    Ok(())
}

pub fn show_quota(opts: GlobalOptions) -> Result<()> {
    let app = App::open(opts)?;
    let monitor = BusyJobMonitor::new(&app.store);
    let quota = QuotaMonitor::new(&monitor, app.config.quota.hard_limit);
    println!(
        "available: {} of {} ({} busy job(s) holding replica connections)",
        quota.available_quota()?,
        quota.hard_quota(),
        app.store.count_busy()?
    );
    Ok(())
}

fn print_stats(result: &StatsResult) {
    for (metric, stat) in result {
        match stat.offset {
            Some(offset) => println!("  {metric}: {} (offset {offset} days)", stat.value),
            None => println!("  {metric}: {}", stat.value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_events_file_with_defaults() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("events.toml");
        std::fs::write(
            &path,
            r#"
[[events]]
title = "Art+Feminism"
start = "2015-01-01"
end = "2015-01-02"
wikis = ["enwiki"]
participants = ["Alice", "Bob"]

[[events]]
title = "Evening session"
start = "2015-03-01 18:00:00"
end = "2015-03-01 21:00:00"
timezone = "+01:00"
wikis = ["frwiki"]
participants = ["Carol"]
retention_offset_days = 30
"#,
        )
        .unwrap();

        let events = parse_events_file(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].timezone, Timezone::utc());
        assert_eq!(events[0].end.to_string(), "2015-01-02 23:59:59");
        assert_eq!(events[1].timezone.to_string(), "+01:00");
        assert_eq!(events[1].retention_offset_days, Some(30));
    }

    #[test]
    fn rejects_bad_timestamp_with_index() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("events.toml");
        std::fs::write(
            &path,
            r#"
[[events]]
title = "Broken"
start = "yesterday"
end = "2015-01-02"
"#,
        )
        .unwrap();
        let err = parse_events_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("at index 0"));
    }
}

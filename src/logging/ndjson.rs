use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{Value, json};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Append-only NDJSON trail of one dispatcher invocation. Every line carries
/// the invocation's `dispatch_id` so concurrent cron runs can be told apart.
#[derive(Debug, Clone)]
pub struct DispatchLog {
    dispatch_id: String,
    path: Option<PathBuf>,
}

impl DispatchLog {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            dispatch_id: Uuid::new_v4().to_string(),
            path,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn dispatch_id(&self) -> &str {
        &self.dispatch_id
    }

    pub fn record(&self, kind: &str, details: Value) -> Result<()> {
        match self.path.as_deref() {
            Some(path) => mirror_record(path, &self.dispatch_id, kind, details),
            None => Ok(()),
        }
    }
}

pub fn mirror_record(path: &Path, dispatch_id: &str, kind: &str, details: Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open dispatch log {}", path.display()))?;
    let line = json!({
        "ts": Utc::now().to_rfc3339(),
        "dispatch": dispatch_id,
        "record": kind,
        "details": details
    });
    writeln!(f, "{}", line)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn appends_one_line_per_record() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("logs").join("dispatch.ndjson");
        let log = DispatchLog::new(Some(path.clone()));
        log.record("quota", json!({"available": 2})).unwrap();
        log.record("job_started", json!({"job": 7, "event": 3})).unwrap();

        let raw = std::fs::read_to_string(path).unwrap();
        let lines = raw.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["record"], "job_started");
        assert_eq!(second["dispatch"], log.dispatch_id());
        assert_eq!(second["details"]["job"], 7);
    }

    #[test]
    fn disabled_log_writes_nothing() {
        DispatchLog::disabled()
            .record("quota", json!({"available": 0}))
            .unwrap();
    }
}

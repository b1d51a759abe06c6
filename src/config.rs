use crate::quota::HARD_QUOTA;
use crate::stats::DEFAULT_RETENTION_OFFSET_DAYS;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub version: u32,
    pub replicas: ReplicasConfig,
    pub quota: QuotaConfig,
    pub retention: RetentionConfig,
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicasConfig {
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuotaConfig {
    pub hard_limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionConfig {
    pub offset_days: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatchConfig {
    pub runner: RunnerMode,
    pub log: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RunnerMode {
    #[default]
    InProcess,
    Subprocess,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            replicas: ReplicasConfig::default(),
            quota: QuotaConfig {
                hard_limit: HARD_QUOTA,
            },
            retention: RetentionConfig {
                offset_days: DEFAULT_RETENTION_OFFSET_DAYS,
            },
            dispatch: DispatchConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawAppConfig {
    version: Option<u32>,
    replicas: Option<RawReplicasConfig>,
    quota: Option<RawQuotaConfig>,
    retention: Option<RawRetentionConfig>,
    dispatch: Option<RawDispatchConfig>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawReplicasConfig {
    dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawQuotaConfig {
    hard_limit: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawRetentionConfig {
    offset_days: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawDispatchConfig {
    runner: Option<String>,
    log: Option<String>,
}

pub fn default_config_path() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("eventmetrics").join("config.toml");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home)
            .join(".config")
            .join("eventmetrics")
            .join("config.toml");
    }
    PathBuf::from(".eventmetrics/config.toml")
}

pub fn load_config(path: &Path) -> Result<Option<AppConfig>> {
    if !path.exists() {
        return Ok(None);
    }

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let parsed: RawAppConfig =
        toml::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(validate_config(parsed, path)?))
}

pub fn load_config_or_default(path: &Path) -> Result<AppConfig> {
    Ok(load_config(path)?.unwrap_or_default())
}

fn validate_config(raw: RawAppConfig, path: &Path) -> Result<AppConfig> {
    let version = raw
        .version
        .ok_or_else(|| anyhow::anyhow!("{} missing required `version`", path.display()))?;
    if version != CONFIG_VERSION {
        bail!(
            "{} has unsupported version {version}; expected version = {CONFIG_VERSION}",
            path.display()
        );
    }
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let defaults = AppConfig::default();

    let replicas = ReplicasConfig {
        dir: raw
            .replicas
            .and_then(|r| sanitize_optional(r.dir))
            .map(|dir| resolve_relative(base, &dir)),
    };

    let quota = match raw.quota.and_then(|q| q.hard_limit) {
        None => defaults.quota,
        Some(limit) if limit < 1 => {
            bail!("{} has `[quota].hard_limit = {limit}`; it must be at least 1", path.display())
        }
        Some(limit) => QuotaConfig {
            hard_limit: u32::try_from(limit)
                .with_context(|| format!("{} `[quota].hard_limit` too large", path.display()))?,
        },
    };

    let retention = match raw.retention.and_then(|r| r.offset_days) {
        None => defaults.retention,
        Some(days) if days < 0 => {
            bail!("{} has negative `[retention].offset_days`", path.display())
        }
        Some(days) => RetentionConfig { offset_days: days },
    };

    let dispatch = match raw.dispatch {
        None => defaults.dispatch,
        Some(dispatch) => {
            let runner = match sanitize_optional(dispatch.runner).as_deref() {
                None | Some("in-process") => RunnerMode::InProcess,
                Some("subprocess") => RunnerMode::Subprocess,
                Some(other) => bail!(
                    "{} has unsupported `[dispatch].runner = \"{other}\"`; expected `in-process` or `subprocess`",
                    path.display()
                ),
            };
            DispatchConfig {
                runner,
                log: sanitize_optional(dispatch.log).map(|log| resolve_relative(base, &log)),
            }
        }
    };

    Ok(AppConfig {
        version,
        replicas,
        quota,
        retention,
        dispatch,
    })
}

fn sanitize_optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn resolve_relative(base: &Path, raw: &str) -> PathBuf {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

// Kit configuration: a TOML file (matching `scriptum-cli`'s
// `read_toml_file`/`GlobalConfigToml` pattern in `commands::doctor`)
// plus a database URL env override, the same layering the teacher uses
// between `RelayConfig::from_env` and per-module env reads.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::FixedOffset;
use serde::Deserialize;
use taskkit_scheduler::SchedulerConfig;

const DATABASE_URL_ENV: &str = "TASKKIT_DATABASE_URL";
const LOG_FILTER_ENV: &str = "TASKKIT_LOG_FILTER";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct KitConfigToml {
    database_url: Option<String>,
    log_filter: Option<String>,
    groups: Vec<GroupConfigToml>,
    scheduler: Option<SchedulerConfigToml>,
}

#[derive(Debug, Clone, Deserialize)]
struct GroupConfigToml {
    name: String,
    #[serde(default = "default_concurrency")]
    concurrency: usize,
    #[serde(default = "default_lease_seconds")]
    lease_seconds: u64,
}

fn default_concurrency() -> usize {
    4
}

fn default_lease_seconds() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
struct SchedulerConfigToml {
    scheduler_name: String,
    #[serde(default = "default_tick_seconds")]
    tick_seconds: u64,
    #[serde(default = "default_lease_seconds")]
    lease_seconds: u64,
    #[serde(default)]
    tz_offset_seconds: i32,
}

fn default_tick_seconds() -> u64 {
    1
}

/// One worker group's pool settings.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    pub name: String,
    pub concurrency: usize,
    pub lease_duration: Duration,
}

/// Resolved kit configuration, ready to drive [`crate::Kit::start`].
#[derive(Debug, Clone)]
pub struct KitConfig {
    pub database_url: String,
    /// `tracing_subscriber::EnvFilter` directive, e.g. `"info"` or
    /// `"debug,taskkit_worker=trace"`. `RUST_LOG` still wins if set —
    /// this is only the fallback, same as the teacher's `log_filter`.
    pub log_filter: String,
    pub groups: Vec<GroupConfig>,
    pub scheduler: Option<SchedulerConfig>,
}

impl KitConfig {
    /// Loads from a TOML file at `path`, applying `TASKKIT_DATABASE_URL`
    /// as an override/fallback for `database_url`.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read `{}`", path.display()))?;
        Self::from_toml_str(&raw, |key| std::env::var(key))
    }

    fn from_toml_str<F>(raw: &str, env: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let parsed: KitConfigToml = toml::from_str(raw).context("failed to parse kit config TOML")?;

        let database_url = env(DATABASE_URL_ENV).ok().or(parsed.database_url).context(
            "no database_url in config and TASKKIT_DATABASE_URL is unset",
        )?;

        let log_filter = env(LOG_FILTER_ENV).ok().or(parsed.log_filter).unwrap_or_else(|| "info".to_string());

        let groups = parsed
            .groups
            .into_iter()
            .map(|g| GroupConfig { name: g.name, concurrency: g.concurrency, lease_duration: Duration::from_secs(g.lease_seconds) })
            .collect();

        let scheduler = parsed.scheduler.map(|s| SchedulerConfig {
            scheduler_name: s.scheduler_name,
            holder: default_holder(),
            lease_duration: Duration::from_secs(s.lease_seconds),
            tick_interval: Duration::from_secs(s.tick_seconds),
            tz: FixedOffset::east_opt(s.tz_offset_seconds).unwrap_or_else(|| FixedOffset::east_opt(0).unwrap()),
        });

        Ok(Self { database_url, log_filter, groups, scheduler })
    }

    /// `$XDG_CONFIG_HOME/taskkit/config.toml` (or the platform
    /// equivalent via the `dirs` crate).
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("taskkit").join("config.toml"))
    }
}

fn default_holder() -> String {
    format!("{}-{}", hostname_or_unknown(), std::process::id())
}

fn hostname_or_unknown() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from_map(map: HashMap<&'static str, &'static str>) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| map.get(key).map(|v| v.to_string()).ok_or(std::env::VarError::NotPresent)
    }

    #[test]
    fn database_url_env_overrides_file() {
        let raw = r#"
database_url = "postgres://file/db"

[[groups]]
name = "emails"
concurrency = 8
lease_seconds = 60
"#;
        let mut m = HashMap::new();
        m.insert(DATABASE_URL_ENV, "postgres://env/db");
        let config = KitConfig::from_toml_str(raw, env_from_map(m)).unwrap();
        assert_eq!(config.database_url, "postgres://env/db");
        assert_eq!(config.groups.len(), 1);
        assert_eq!(config.groups[0].concurrency, 8);
    }

    #[test]
    fn falls_back_to_file_database_url() {
        let raw = r#"database_url = "postgres://file/db""#;
        let config = KitConfig::from_toml_str(raw, env_from_map(HashMap::new())).unwrap();
        assert_eq!(config.database_url, "postgres://file/db");
    }

    #[test]
    fn group_defaults_apply_when_omitted() {
        let raw = r#"
database_url = "postgres://file/db"

[[groups]]
name = "emails"
"#;
        let config = KitConfig::from_toml_str(raw, env_from_map(HashMap::new())).unwrap();
        assert_eq!(config.groups[0].concurrency, 4);
        assert_eq!(config.groups[0].lease_duration, Duration::from_secs(30));
    }

    #[test]
    fn log_filter_defaults_to_info() {
        let raw = r#"database_url = "postgres://file/db""#;
        let config = KitConfig::from_toml_str(raw, env_from_map(HashMap::new())).unwrap();
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn log_filter_env_overrides_file() {
        let raw = r#"
database_url = "postgres://file/db"
log_filter = "warn"
"#;
        let mut m = HashMap::new();
        m.insert(LOG_FILTER_ENV, "debug,taskkit_worker=trace");
        let config = KitConfig::from_toml_str(raw, env_from_map(m)).unwrap();
        assert_eq!(config.log_filter, "debug,taskkit_worker=trace");
    }

    #[test]
    fn missing_database_url_is_an_error() {
        let raw = "groups = []";
        let error = KitConfig::from_toml_str(raw, env_from_map(HashMap::new())).unwrap_err();
        assert!(error.to_string().contains("database_url"));
    }
}

//! TOML configuration: services, their checks, and notification hooks.
//!
//! A config file declares services, each with one or more checks. Every
//! check becomes an immutable [`ServiceCheck`] shared by the executor for
//! the lifetime of the process. Validation collects every problem it finds
//! instead of stopping at the first one.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::container::container_name;
use crate::notify::NotificationSpec;
use crate::storage::CheckKey;

pub const DEFAULT_IMAGE: &str = "byrnedo/alpine-curl";
pub const DEFAULT_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_HISTORY_SIZE: usize = 500;
/// Longest accepted check interval (one year).
pub const MAX_INTERVAL_MS: u64 = 365 * 86_400_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid duration '{0}' (expected e.g. 500ms, 30s, 5m, 1h)")]
    InvalidDuration(String),

    #[error("invalid configuration:\n  {}", .0.join("\n  "))]
    Invalid(Vec<String>),
}

// ---------------------------------------------------------------------------
// File format
// ---------------------------------------------------------------------------

/// Root of the config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatrolConfig {
    /// SQLite history database. Defaults to `patrol.db` next to the config file.
    #[serde(default)]
    pub db: Option<PathBuf>,
    /// Worker count. Defaults to the number of logical cores.
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub on_success: Vec<NotificationSpec>,
    #[serde(default)]
    pub on_failure: Vec<NotificationSpec>,
    #[serde(default)]
    pub on_recovered: Vec<NotificationSpec>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    #[serde(default)]
    pub checks: Vec<CheckConfig>,
    #[serde(default)]
    pub on_success: Vec<NotificationSpec>,
    #[serde(default)]
    pub on_failure: Vec<NotificationSpec>,
    #[serde(default)]
    pub on_recovered: Vec<NotificationSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub cmd: Option<CommandLine>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub interval: Option<DurationValue>,
    #[serde(default)]
    pub timeout: Option<DurationValue>,
    #[serde(default)]
    pub history_size: Option<usize>,
    #[serde(default, rename = "type")]
    pub check_type: CheckType,
    #[serde(default)]
    pub unit: Option<String>,
}

/// A shell command, either as one line or as a list of steps.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    Line(String),
    Steps(Vec<String>),
}

impl CommandLine {
    pub fn to_shell(&self) -> String {
        match self {
            CommandLine::Line(line) => line.trim().to_string(),
            CommandLine::Steps(steps) => steps
                .iter()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join("; "),
        }
    }
}

/// Either a bare number of milliseconds or a suffixed string like `30s`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DurationValue {
    Millis(u64),
    Text(String),
}

impl DurationValue {
    pub fn to_std(&self) -> Result<std::time::Duration, ConfigError> {
        match self {
            DurationValue::Millis(ms) => Ok(std::time::Duration::from_millis(*ms)),
            DurationValue::Text(text) => parse_duration(text),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    #[default]
    Boolean,
    Metric,
}

impl std::fmt::Display for CheckType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            CheckType::Boolean => "boolean",
            CheckType::Metric => "metric",
        })
    }
}

impl std::str::FromStr for CheckType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "boolean" => Ok(CheckType::Boolean),
            "metric" => Ok(CheckType::Metric),
            other => Err(format!("unknown check type '{other}'")),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level, overridden by `RUST_LOG` when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

// ---------------------------------------------------------------------------
// Resolved checks
// ---------------------------------------------------------------------------

/// Notification hooks for one check, global hooks first.
#[derive(Debug, Clone, Default)]
pub struct Notifications {
    pub on_success: Vec<NotificationSpec>,
    pub on_failure: Vec<NotificationSpec>,
    pub on_recovered: Vec<NotificationSpec>,
}

impl Notifications {
    pub fn is_empty(&self) -> bool {
        self.on_success.is_empty() && self.on_failure.is_empty() && self.on_recovered.is_empty()
    }
}

/// A fully resolved, validated check.
#[derive(Debug, Clone)]
pub struct ServiceCheck {
    pub service: String,
    pub name: String,
    pub command: String,
    pub image: String,
    pub interval: chrono::Duration,
    pub history_size: usize,
    pub check_type: CheckType,
    pub metric_unit: Option<String>,
    /// Enforced by the container runtime; `None` waits indefinitely.
    pub timeout: Option<std::time::Duration>,
    pub notifications: Notifications,
}

impl ServiceCheck {
    pub fn key(&self) -> CheckKey {
        CheckKey::new(&self.service, &self.name)
    }
}

impl PatrolConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let mut config = Self::from_toml(&content)
            .with_context(|| format!("failed to load config file: {}", path.display()))?;

        if config.db.is_none() {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            config.db = Some(dir.join("patrol.db"));
        }

        info!(path = %path.display(), services = config.services.len(), "Loaded configuration");
        Ok(config)
    }

    /// Parse and validate a config document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content).context("failed to parse TOML")?;
        config.normalize()?;
        Ok(config)
    }

    pub fn db_path(&self) -> PathBuf {
        self.db.clone().unwrap_or_else(|| PathBuf::from("patrol.db"))
    }

    fn normalize(&mut self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        normalize_hooks("on_success", &mut self.on_success, &mut problems);
        normalize_hooks("on_failure", &mut self.on_failure, &mut problems);
        normalize_hooks("on_recovered", &mut self.on_recovered, &mut problems);

        if self.services.is_empty() {
            problems.push("'services' must declare at least one service".to_string());
        }
        if self.concurrency == Some(0) {
            problems.push("'concurrency' must be at least 1".to_string());
        }

        let mut seen = HashSet::new();
        let mut containers: BTreeMap<String, String> = BTreeMap::new();
        for (service, group) in &mut self.services {
            let prefix = format!("services.{service}");
            normalize_hooks(&format!("{prefix}.on_success"), &mut group.on_success, &mut problems);
            normalize_hooks(&format!("{prefix}.on_failure"), &mut group.on_failure, &mut problems);
            normalize_hooks(&format!("{prefix}.on_recovered"), &mut group.on_recovered, &mut problems);

            if group.checks.is_empty() {
                problems.push(format!("'{prefix}' must declare at least one check"));
            }

            for (idx, check) in group.checks.iter().enumerate() {
                let at = format!("{prefix}.checks[{idx}]");
                if check.name.trim().is_empty() {
                    problems.push(format!("'{at}.name' must be a non-empty string"));
                } else if !seen.insert((service.clone(), check.name.clone())) {
                    problems.push(format!("'{at}.name' duplicates check '{}'", check.name));
                } else {
                    let container = container_name(service, &check.name);
                    let owner = format!("{service}/{}", check.name);
                    if let Some(other) = containers.insert(container.clone(), owner) {
                        problems.push(format!(
                            "'{at}.name' maps to container '{container}', already used by check '{other}'"
                        ));
                    }
                }
                if check.cmd.as_ref().map_or(true, |c| c.to_shell().is_empty()) {
                    problems.push(format!("'{at}.cmd' must be a non-empty command"));
                }
                if check.check_type == CheckType::Metric
                    && check.unit.as_deref().map_or(true, str::is_empty)
                {
                    problems.push(format!("'{at}' is a metric check but has no 'unit'"));
                }
                if check.image.as_deref().is_some_and(|i| i.trim().is_empty()) {
                    problems.push(format!("'{at}.image' must not be empty"));
                }
                if check.history_size == Some(0) {
                    problems.push(format!("'{at}.history_size' must be at least 1"));
                }
                match check.interval.as_ref().map(DurationValue::to_std) {
                    Some(Ok(d)) if d.is_zero() => {
                        problems.push(format!("'{at}.interval' must be greater than zero"))
                    }
                    Some(Ok(d)) if d > std::time::Duration::from_millis(MAX_INTERVAL_MS) => {
                        problems.push(format!("'{at}.interval' must be at most 365d"))
                    }
                    Some(Err(e)) => problems.push(format!("'{at}.interval': {e}")),
                    _ => {}
                }
                if let Some(Err(e)) = check.timeout.as_ref().map(DurationValue::to_std) {
                    problems.push(format!("'{at}.timeout': {e}"));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// Resolve every configured check, merging global and service hooks.
    pub fn checks(&self) -> Result<Vec<Arc<ServiceCheck>>, ConfigError> {
        let mut checks = Vec::new();
        for (service, group) in &self.services {
            let notifications = Notifications {
                on_success: merged(&self.on_success, &group.on_success),
                on_failure: merged(&self.on_failure, &group.on_failure),
                on_recovered: merged(&self.on_recovered, &group.on_recovered),
            };

            for check in &group.checks {
                let interval = match &check.interval {
                    Some(value) => value.to_std()?,
                    None => std::time::Duration::from_millis(DEFAULT_INTERVAL_MS),
                };
                let interval = chrono::Duration::from_std(interval)
                    .map_err(|_| ConfigError::InvalidDuration(format!("{interval:?}")))?;
                let timeout = check.timeout.as_ref().map(DurationValue::to_std).transpose()?;

                checks.push(Arc::new(ServiceCheck {
                    service: service.clone(),
                    name: check.name.clone(),
                    command: check.cmd.as_ref().map(CommandLine::to_shell).unwrap_or_default(),
                    image: check
                        .image
                        .clone()
                        .unwrap_or_else(|| DEFAULT_IMAGE.to_string()),
                    interval,
                    history_size: check.history_size.unwrap_or(DEFAULT_HISTORY_SIZE),
                    check_type: check.check_type,
                    metric_unit: check.unit.clone(),
                    timeout,
                    notifications: notifications.clone(),
                }));
            }
        }
        Ok(checks)
    }
}

fn normalize_hooks(at: &str, hooks: &mut [NotificationSpec], problems: &mut Vec<String>) {
    for (idx, hook) in hooks.iter_mut().enumerate() {
        if let Err(e) = hook.normalize() {
            problems.push(format!("'{at}[{idx}]': {e}"));
        }
    }
}

fn merged(global: &[NotificationSpec], local: &[NotificationSpec]) -> Vec<NotificationSpec> {
    global.iter().chain(local).cloned().collect()
}

/// Parse `500ms`, `30s`, `5m`, `2h`, `1d` or a bare millisecond count.
pub fn parse_duration(text: &str) -> Result<std::time::Duration, ConfigError> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);

    let value: u64 = digits
        .parse()
        .map_err(|_| ConfigError::InvalidDuration(text.to_string()))?;
    let millis = match unit.trim() {
        "" | "ms" => Some(value),
        "s" => value.checked_mul(1_000),
        "m" => value.checked_mul(60_000),
        "h" => value.checked_mul(3_600_000),
        "d" => value.checked_mul(86_400_000),
        _ => None,
    }
    .ok_or_else(|| ConfigError::InvalidDuration(text.to_string()))?;

    Ok(std::time::Duration::from_millis(millis))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const EXAMPLE: &str = r#"
db = "/var/lib/patrol/history.db"
concurrency = 2

[logging]
level = "debug"
format = "json"

[[on_failure]]
type = "webhook"
url = "https://hooks.example.com/global"

[services.web]
[[services.web.checks]]
name = "homepage"
cmd = "curl -fsS https://example.com"
interval = "30s"

[[services.web.checks]]
name = "latency"
cmd = ["set -o pipefail", "curl -o /dev/null -w '%{time_total}' https://example.com"]
image = "curlimages/curl"
type = "metric"
unit = "s"
history_size = 1000
timeout = "2m"

[[services.web.on_failure]]
type = "webhook"
url = "https://hooks.example.com/web"
method = "post"

[services.db]
[[services.db.checks]]
name = "ping"
cmd = "pg_isready -h db"
interval = 5000
"#;

    #[test]
    fn test_parse_example_toml() {
        let cfg = PatrolConfig::from_toml(EXAMPLE).unwrap();
        assert_eq!(cfg.db_path(), PathBuf::from("/var/lib/patrol/history.db"));
        assert_eq!(cfg.concurrency, Some(2));
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.logging.format, LogFormat::Json);

        let checks = cfg.checks().unwrap();
        assert_eq!(checks.len(), 3);

        // BTreeMap orders services: db, web.
        let ping = &checks[0];
        assert_eq!((ping.service.as_str(), ping.name.as_str()), ("db", "ping"));
        assert_eq!(ping.interval, chrono::Duration::milliseconds(5000));
        assert_eq!(ping.image, DEFAULT_IMAGE);
        assert_eq!(ping.history_size, DEFAULT_HISTORY_SIZE);
        assert_eq!(ping.notifications.on_failure.len(), 1);

        let homepage = &checks[1];
        assert_eq!(homepage.interval, chrono::Duration::seconds(30));
        assert_eq!(homepage.check_type, CheckType::Boolean);
        assert!(homepage.timeout.is_none());
        assert_eq!(homepage.notifications.on_failure.len(), 2);

        let latency = &checks[2];
        assert_eq!(latency.check_type, CheckType::Metric);
        assert_eq!(latency.metric_unit.as_deref(), Some("s"));
        assert_eq!(latency.image, "curlimages/curl");
        assert_eq!(latency.history_size, 1000);
        assert_eq!(latency.timeout, Some(Duration::from_secs(120)));
        assert!(latency.command.starts_with("set -o pipefail; curl"));
    }

    #[test]
    fn test_minimal_check_uses_defaults() {
        let cfg = PatrolConfig::from_toml(
            r#"
[services.api]
[[services.api.checks]]
name = "up"
cmd = "true"
"#,
        )
        .unwrap();

        let checks = cfg.checks().unwrap();
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].interval, chrono::Duration::milliseconds(60_000));
        assert!(checks[0].notifications.is_empty());
        assert_eq!(cfg.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_validation_collects_every_problem() {
        let err = PatrolConfig::from_toml(
            r#"
concurrency = 0

[services.api]
[[services.api.checks]]
name = ""
cmd = "true"

[[services.api.checks]]
name = "m"
cmd = "echo 1"
type = "metric"
interval = "soon"
history_size = 0

[[services.api.checks]]
name = "m"
cmd = []

[services.empty]
"#,
        )
        .unwrap_err();

        let msg = format!("{err:#}");
        assert!(msg.contains("'concurrency' must be at least 1"));
        assert!(msg.contains("services.api.checks[0].name"));
        assert!(msg.contains("metric check but has no 'unit'"));
        assert!(msg.contains("services.api.checks[1].interval"));
        assert!(msg.contains("history_size' must be at least 1"));
        assert!(msg.contains("duplicates check 'm'"));
        assert!(msg.contains("services.api.checks[2].cmd"));
        assert!(msg.contains("'services.empty' must declare at least one check"));
    }

    #[test]
    fn test_no_services_is_rejected() {
        let err = PatrolConfig::from_toml("concurrency = 1").unwrap_err();
        assert!(format!("{err:#}").contains("at least one service"));
    }

    #[test]
    fn test_bad_webhook_is_reported_with_location() {
        let err = PatrolConfig::from_toml(
            r#"
[[on_success]]
type = "webhook"
url = "not a url"

[services.api]
[[services.api.checks]]
name = "up"
cmd = "true"
"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("'on_success[0]'"));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(PatrolConfig::from_toml(
            r#"
[services.api]
[[services.api.checks]]
name = "up"
cmd = "true"
retries = 3
"#,
        )
        .is_err());
    }

    #[test]
    fn test_load_defaults_db_next_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patrol.toml");
        std::fs::write(
            &path,
            "[services.api]\n[[services.api.checks]]\nname = \"up\"\ncmd = \"true\"\n",
        )
        .unwrap();

        let cfg = PatrolConfig::load(&path).unwrap();
        assert_eq!(cfg.db_path(), dir.path().join("patrol.db"));
    }

    #[test]
    fn test_checks_sharing_a_container_name_are_rejected() {
        let err = PatrolConfig::from_toml(
            r#"
[services.web]
[[services.web.checks]]
name = "home page"
cmd = "true"

[[services.web.checks]]
name = "home-page"
cmd = "true"
"#,
        )
        .unwrap_err();

        let msg = format!("{err:#}");
        assert!(msg.contains("services.web.checks[1].name"), "{msg}");
        assert!(msg.contains("patrol_web_home_page"), "{msg}");
        assert!(msg.contains("web/home page"), "{msg}");
    }

    #[test]
    fn test_interval_has_an_upper_bound() {
        let config = |interval: &str| {
            format!(
                "[services.web]\n[[services.web.checks]]\nname = \"x\"\ncmd = \"true\"\ninterval = \"{interval}\"\n"
            )
        };

        assert!(PatrolConfig::from_toml(&config("365d")).is_ok());
        let err = PatrolConfig::from_toml(&config("100000000d")).unwrap_err();
        assert!(format!("{err:#}").contains("'services.web.checks[0].interval' must be at most 365d"));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("250").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration(" 5m ").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("1.5m").is_err());
        assert!(parse_duration("10 parsecs").is_err());
    }
}

//! Worker configuration file.
//!
//! A flat JSON object of option name to value. Every option is declared in
//! [`OPTIONS`] with its help text, default and validation; values missing from
//! the file fall back to the defaults.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::changelog::CHANGELOG_LOG_LEVELS;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid config name: {0}")]
    InvalidName(String),

    #[error("Invalid value for {name}: {value} ({reason})")]
    InvalidValue {
        name: String,
        value: String,
        reason: String,
    },

    #[error("Config value not changed, same as existing value")]
    NotChanged { name: String },

    #[error("Cannot access config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Text,
    /// Non-negative integer, at least `min`
    Integer { min: u64 },
}

#[derive(Debug, Clone, Copy)]
pub enum DefaultValue {
    Text(&'static str),
    Integer(u64),
}

impl DefaultValue {
    pub fn to_value(self) -> Value {
        match self {
            DefaultValue::Text(s) => Value::from(s),
            DefaultValue::Integer(n) => Value::from(n),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OptionSpec {
    pub name: &'static str,
    pub help: &'static str,
    pub default: DefaultValue,
    pub kind: Kind,
    pub choices: &'static [&'static str],
}

const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

pub const OPTIONS: &[OptionSpec] = &[
    OptionSpec {
        name: "changelog-log-level",
        help: "Set Changelog log level",
        default: DefaultValue::Text("INFO"),
        kind: Kind::Text,
        choices: &CHANGELOG_LOG_LEVELS,
    },
    OptionSpec {
        name: "changelog-conn-retries",
        help: "Attempts to connect to the brick changelog at startup",
        default: DefaultValue::Integer(5),
        kind: Kind::Integer { min: 0 },
        choices: &[],
    },
    OptionSpec {
        name: "log-level",
        help: "Worker log level (RUST_LOG overrides)",
        default: DefaultValue::Text("info"),
        kind: Kind::Text,
        choices: &LOG_LEVELS,
    },
    OptionSpec {
        name: "sync-jobs",
        help: "Number of parallel transfer workers",
        default: DefaultValue::Integer(3),
        kind: Kind::Integer { min: 1 },
        choices: &[],
    },
    OptionSpec {
        name: "batch-size",
        help: "Maximum number of paths per transfer",
        default: DefaultValue::Integer(1000),
        kind: Kind::Integer { min: 1 },
        choices: &[],
    },
    OptionSpec {
        name: "cycle-interval-secs",
        help: "Pause between changelog processing cycles",
        default: DefaultValue::Integer(2),
        kind: Kind::Integer { min: 0 },
        choices: &[],
    },
    OptionSpec {
        name: "poll-interval-ms",
        help: "Worker pause when the sync queue is empty",
        default: DefaultValue::Integer(500),
        kind: Kind::Integer { min: 1 },
        choices: &[],
    },
    OptionSpec {
        name: "transfer-timeout-secs",
        help: "Kill a transfer running longer than this, 0 disables",
        default: DefaultValue::Integer(3600),
        kind: Kind::Integer { min: 0 },
        choices: &[],
    },
    OptionSpec {
        name: "transfer-retries",
        help: "Extra attempts for a failed transfer batch",
        default: DefaultValue::Integer(1),
        kind: Kind::Integer { min: 0 },
        choices: &[],
    },
    OptionSpec {
        name: "max-deferred-cycles",
        help: "Failed cycles in a row before failing paths are parked and the checkpoint moves on",
        default: DefaultValue::Integer(3),
        kind: Kind::Integer { min: 0 },
        choices: &[],
    },
    OptionSpec {
        name: "source-root",
        help: "Mounted volume the transfer reads from",
        default: DefaultValue::Text(""),
        kind: Kind::Text,
        choices: &[],
    },
    OptionSpec {
        name: "dest-root",
        help: "Replica location the transfer writes to",
        default: DefaultValue::Text(""),
        kind: Kind::Text,
        choices: &[],
    },
    OptionSpec {
        name: "rsync-options",
        help: "Extra rsync arguments, whitespace separated",
        default: DefaultValue::Text(""),
        kind: Kind::Text,
        choices: &[],
    },
];

pub fn option_spec(name: &str) -> Option<&'static OptionSpec> {
    OPTIONS.iter().find(|o| o.name == name)
}

/// Check a value against an option's schema
pub fn validate(name: &str, value: &Value) -> Result<(), ConfigError> {
    let spec = option_spec(name).ok_or_else(|| ConfigError::InvalidName(name.to_string()))?;
    let invalid = |reason: String| ConfigError::InvalidValue {
        name: name.to_string(),
        value: value.to_string(),
        reason,
    };

    match spec.kind {
        Kind::Text => {
            let s = value
                .as_str()
                .ok_or_else(|| invalid("expected a string".to_string()))?;
            if !spec.choices.is_empty() && !spec.choices.contains(&s) {
                return Err(invalid(format!("choices: {}", spec.choices.join(", "))));
            }
        }
        Kind::Integer { min } => {
            let n = value
                .as_u64()
                .ok_or_else(|| invalid("expected a non-negative integer".to_string()))?;
            if n < min {
                return Err(invalid(format!("minimum is {}", min)));
            }
        }
    }
    Ok(())
}

/// Convert a command-line string to the option's JSON type
pub fn coerce(name: &str, raw: &str) -> Result<Value, ConfigError> {
    let spec = option_spec(name).ok_or_else(|| ConfigError::InvalidName(name.to_string()))?;
    let value = match spec.kind {
        Kind::Text => Value::from(raw),
        Kind::Integer { .. } => match raw.trim().parse::<u64>() {
            Ok(n) => Value::from(n),
            Err(_) => Value::from(raw),
        },
    };
    validate(name, &value)?;
    Ok(value)
}

fn read_file(path: &Path) -> Result<Map<String, Value>, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if content.trim().is_empty() {
        return Ok(Map::new());
    }
    serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Effective configuration: defaults overlaid with a config file
#[derive(Debug, Clone)]
pub struct Config {
    data: BTreeMap<&'static str, Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data: OPTIONS
                .iter()
                .map(|o| (o.name, o.default.to_value()))
                .collect(),
        }
    }
}

impl Config {
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        Self::from_map(read_file(path)?)
    }

    /// Overlay `map` on the defaults. Unknown keys are ignored with a warning;
    /// invalid values are rejected.
    pub fn from_map(map: Map<String, Value>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for (key, value) in map {
            match option_spec(&key) {
                Some(spec) => {
                    validate(spec.name, &value)?;
                    config.data.insert(spec.name, value);
                }
                None => tracing::warn!(name = %key, "ignoring unknown config option"),
            }
        }
        Ok(config)
    }

    /// One option, or all of them when `name` is empty
    pub fn get(&self, name: Option<&str>) -> Result<BTreeMap<&'static str, Value>, ConfigError> {
        match name.filter(|n| !n.is_empty()) {
            None => Ok(self.data.clone()),
            Some(n) => {
                let spec = option_spec(n).ok_or_else(|| ConfigError::InvalidName(n.to_string()))?;
                Ok(BTreeMap::from([(spec.name, self.data[spec.name].clone())]))
            }
        }
    }

    /// Schema entries, or one of them when `name` is given
    pub fn help(name: Option<&str>) -> Result<Vec<&'static OptionSpec>, ConfigError> {
        match name.filter(|n| !n.is_empty()) {
            None => Ok(OPTIONS.iter().collect()),
            Some(n) => option_spec(n)
                .map(|s| vec![s])
                .ok_or_else(|| ConfigError::InvalidName(n.to_string())),
        }
    }

    /// Validate and persist one option, rewriting the file atomically.
    pub fn set(&mut self, path: &Path, name: &str, raw: &str) -> Result<(), ConfigError> {
        let value = coerce(name, raw)?;
        let spec = option_spec(name).ok_or_else(|| ConfigError::InvalidName(name.to_string()))?;

        let mut file = if path.exists() {
            read_file(path)?
        } else {
            Map::new()
        };
        let current = file
            .get(name)
            .cloned()
            .unwrap_or_else(|| spec.default.to_value());
        if current == value {
            return Err(ConfigError::NotChanged {
                name: name.to_string(),
            });
        }
        file.insert(name.to_string(), value.clone());

        let io_err = |source: std::io::Error| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        let body = serde_json::to_string_pretty(&Value::Object(file)).map_err(|source| {
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })?;
        writeln!(temp, "{}", body).map_err(io_err)?;
        temp.persist(path).map_err(|e| io_err(e.error))?;

        self.data.insert(spec.name, value);
        Ok(())
    }

    pub fn settings(&self) -> Settings {
        let int = |name: &str| self.data[name].as_u64().unwrap_or_default();
        let text = |name: &str| self.data[name].as_str().unwrap_or_default().to_string();
        let non_empty = |s: String| if s.is_empty() { None } else { Some(s) };

        Settings {
            changelog_log_level: text("changelog-log-level"),
            changelog_conn_retries: int("changelog-conn-retries") as u32,
            log_level: text("log-level"),
            sync_jobs: int("sync-jobs") as usize,
            batch_size: int("batch-size") as usize,
            cycle_interval: Duration::from_secs(int("cycle-interval-secs")),
            poll_interval: Duration::from_millis(int("poll-interval-ms")),
            transfer_timeout: match int("transfer-timeout-secs") {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            transfer_retries: int("transfer-retries") as u32,
            max_deferred_cycles: int("max-deferred-cycles") as u32,
            source_root: non_empty(text("source-root")).map(PathBuf::from),
            dest_root: non_empty(text("dest-root")),
            rsync_options: text("rsync-options")
                .split_whitespace()
                .map(str::to_string)
                .collect(),
        }
    }
}

/// Typed view of a [`Config`]
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub changelog_log_level: String,
    pub changelog_conn_retries: u32,
    pub log_level: String,
    pub sync_jobs: usize,
    pub batch_size: usize,
    pub cycle_interval: Duration,
    pub poll_interval: Duration,
    pub transfer_timeout: Option<Duration>,
    pub transfer_retries: u32,
    pub max_deferred_cycles: u32,
    pub source_root: Option<PathBuf>,
    pub dest_root: Option<String>,
    pub rsync_options: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Config::default().settings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.changelog_log_level, "INFO");
        assert_eq!(settings.sync_jobs, 3);
        assert_eq!(settings.batch_size, 1000);
        assert_eq!(settings.cycle_interval, Duration::from_secs(2));
        assert_eq!(settings.poll_interval, Duration::from_millis(500));
        assert_eq!(settings.transfer_timeout, Some(Duration::from_secs(3600)));
        assert_eq!(settings.max_deferred_cycles, 3);
        assert_eq!(settings.source_root, None);
        assert!(settings.rsync_options.is_empty());
    }

    #[test]
    fn test_file_overlays_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("geosync.json");
        fs::write(
            &path,
            r#"{"changelog-log-level": "TRACE", "sync-jobs": 8, "rsync-options": "-e ssh  -z", "unknown": 1}"#,
        )
        .unwrap();

        let settings = Config::load_file(&path).unwrap().settings();
        assert_eq!(settings.changelog_log_level, "TRACE");
        assert_eq!(settings.sync_jobs, 8);
        assert_eq!(settings.batch_size, 1000);
        assert_eq!(settings.rsync_options, vec!["-e", "ssh", "-z"]);
    }

    #[test]
    fn test_invalid_file_value_rejected() {
        assert!(matches!(
            Config::from_map(json!({"sync-jobs": 0}).as_object().unwrap().clone()),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            Config::from_map(json!({"changelog-log-level": "LOUD"}).as_object().unwrap().clone()),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_get_single_and_all() {
        let config = Config::default();
        let one = config.get(Some("batch-size")).unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one["batch-size"], json!(1000));
        assert_eq!(config.get(None).unwrap().len(), OPTIONS.len());
        assert_eq!(config.get(Some("")).unwrap().len(), OPTIONS.len());
        assert!(matches!(
            config.get(Some("nope")),
            Err(ConfigError::InvalidName(_))
        ));
    }

    #[test]
    fn test_coerce() {
        assert_eq!(coerce("sync-jobs", "4").unwrap(), json!(4));
        assert!(coerce("sync-jobs", "four").is_err());
        assert!(coerce("sync-jobs", "0").is_err());
        assert_eq!(coerce("changelog-log-level", "TRACE").unwrap(), json!("TRACE"));
        assert!(matches!(
            coerce("no-such-option", "1"),
            Err(ConfigError::InvalidName(_))
        ));
    }

    #[test]
    fn test_set_writes_and_detects_unchanged() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("geosync.json");
        fs::write(&path, "{}").unwrap();

        let mut config = Config::load_file(&path).unwrap();
        config.set(&path, "changelog-log-level", "TRACE").unwrap();
        assert_eq!(config.settings().changelog_log_level, "TRACE");

        let on_disk: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk["changelog-log-level"], json!("TRACE"));

        assert!(matches!(
            config.set(&path, "changelog-log-level", "TRACE"),
            Err(ConfigError::NotChanged { .. })
        ));
        // Setting a default that was never written is also "unchanged"
        assert!(matches!(
            config.set(&path, "batch-size", "1000"),
            Err(ConfigError::NotChanged { .. })
        ));
    }

    #[test]
    fn test_set_creates_missing_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("new.json");
        let mut config = Config::default();
        config.set(&path, "sync-jobs", "6").unwrap();
        assert_eq!(Config::load_file(&path).unwrap().settings().sync_jobs, 6);
    }
}

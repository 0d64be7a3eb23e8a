use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use crossbeam_channel::Receiver;
use serde_json::Value;

use crate::changelog::{changelog_log_level, Registration, SpoolFeed, CHANGELOG_LOG_LEVELS};
use crate::checkpoint::FileCheckpointStore;
use crate::config::{Config, ConfigError, Settings};
use crate::dispatch::{DispatchOptions, RsyncSink};
use crate::resolver::{BrickStore, PathResolver};
use crate::sync::{CycleReport, OrchestratorOptions, RetryList, SyncOrchestrator};

/// Worker wired to the on-disk providers
pub type BrickWorker = SyncOrchestrator<SpoolFeed, FileCheckpointStore, BrickStore>;

/// Width of the name column in config listings
const NAME_WIDTH: usize = 25;

#[derive(Parser, Debug)]
#[command(name = "geosync")]
#[command(version, about = "Changelog-driven incremental replication of a storage brick", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Replicate one brick until interrupted
    Worker(WorkerArgs),

    /// Show effective configuration values
    ConfigGet {
        #[arg(long, value_parser = expand_path)]
        config_file: PathBuf,

        /// Single option to show
        #[arg(long)]
        name: Option<String>,

        /// Print a JSON object instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Describe configuration options
    ConfigHelp {
        #[arg(long)]
        name: Option<String>,
    },

    /// Change one configuration value
    ConfigSet {
        #[arg(long, value_parser = expand_path)]
        config_file: PathBuf,

        #[arg(long)]
        name: String,

        #[arg(long)]
        value: String,
    },
}

#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    /// Brick root directory
    #[arg(long, value_parser = expand_path)]
    pub brick: PathBuf,

    /// Working directory for changelog staging and checkpoints
    #[arg(long, value_parser = expand_path)]
    pub workdir: PathBuf,

    /// Log file for the changelog provider
    #[arg(long, value_parser = expand_path)]
    pub changelog_logfile: PathBuf,

    /// Changelog provider log level, by name (INFO, DEBUG, ...) or number
    #[arg(long)]
    pub changelog_loglevel: Option<String>,

    /// Tree to copy from (default: the brick)
    #[arg(long, value_parser = expand_path)]
    pub source_root: Option<PathBuf>,

    /// rsync destination, e.g. `host::volume` or a local directory
    #[arg(long)]
    pub dest_root: Option<String>,

    #[arg(long, value_parser = expand_path, env = "GEOSYNC_CONFIG")]
    pub config_file: Option<PathBuf>,

    /// Concurrent transfer workers
    #[arg(long)]
    pub sync_jobs: Option<usize>,

    /// Maximum paths per transfer
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Run a single cycle, print its report as JSON and exit
    #[arg(long)]
    pub once: bool,
}

/// Expand a leading `~` to the home directory
pub fn expand_path(raw: &str) -> Result<PathBuf, String> {
    if raw.is_empty() {
        return Err("path must not be empty".to_string());
    }
    let rest = match raw.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => return Ok(PathBuf::from(raw)),
    };
    let home = dirs::home_dir().ok_or_else(|| "cannot determine home directory".to_string())?;
    Ok(if rest.is_empty() { home } else { home.join(rest) })
}

/// Changelog level from a name or its numeric index
pub fn parse_changelog_level(raw: &str) -> anyhow::Result<u32> {
    if let Some(level) = changelog_log_level(raw) {
        return Ok(level);
    }
    match raw.parse::<u32>() {
        Ok(n) if (n as usize) < CHANGELOG_LOG_LEVELS.len() => Ok(n),
        _ => bail!(
            "invalid changelog log level {:?} (choices: {})",
            raw,
            CHANGELOG_LOG_LEVELS.join(", ")
        ),
    }
}

fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if path.exists() {
        Config::load_file(path)
    } else {
        Ok(Config::default())
    }
}

impl WorkerArgs {
    /// Config file values with command-line overrides applied
    pub fn settings(&self) -> anyhow::Result<Settings> {
        let config = match &self.config_file {
            Some(path) => Config::load_file(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => Config::default(),
        };
        let mut settings = config.settings();

        if let Some(level) = &self.changelog_loglevel {
            settings.changelog_log_level = level.clone();
        }
        if let Some(root) = &self.source_root {
            settings.source_root = Some(root.clone());
        }
        if let Some(dest) = &self.dest_root {
            settings.dest_root = Some(dest.clone());
        }
        if let Some(jobs) = self.sync_jobs {
            settings.sync_jobs = jobs;
        }
        if let Some(size) = self.batch_size {
            settings.batch_size = size;
        }
        if settings.sync_jobs == 0 || settings.batch_size == 0 {
            bail!("--sync-jobs and --batch-size must be at least 1");
        }
        Ok(settings)
    }

    pub fn build(&self, settings: &Settings) -> anyhow::Result<BrickWorker> {
        let level = parse_changelog_level(&settings.changelog_log_level)?;
        let dest_root = settings
            .dest_root
            .clone()
            .context("no destination: pass --dest-root or set dest-root in the config file")?;
        let source_root = settings
            .source_root
            .clone()
            .unwrap_or_else(|| self.brick.clone());

        let checkpoints = FileCheckpointStore::open(&self.workdir)
            .with_context(|| format!("cannot use work directory {}", self.workdir.display()))?;
        let retry = RetryList::open(&self.workdir).context("cannot load the retry list")?;

        let sink = RsyncSink::new(&source_root, dest_root)
            .with_args(settings.rsync_options.iter().cloned())
            .with_timeout(settings.transfer_timeout);

        let registration =
            Registration::new(&self.brick, &self.workdir, &self.changelog_logfile, level)
                .with_retries(settings.changelog_conn_retries);
        let mut options = OrchestratorOptions::new(registration);
        options.dispatch = DispatchOptions {
            workers: settings.sync_jobs,
            batch_capacity: settings.batch_size,
            poll_interval: settings.poll_interval,
            retries: settings.transfer_retries,
        };
        options.cycle_interval = settings.cycle_interval;
        options.history_parallelism = settings.sync_jobs;
        options.max_deferrals = settings.max_deferred_cycles;

        Ok(SyncOrchestrator::new(
            SpoolFeed::new(),
            checkpoints,
            PathResolver::new(BrickStore::new(self.brick.clone())),
            Arc::new(sink),
            options,
        )
        .with_retry_list(retry))
    }

    /// Register, replay history, then loop until `shutdown` fires.
    /// Blocks the calling thread.
    pub fn run(&self, settings: &Settings, shutdown: &Receiver<()>) -> anyhow::Result<()> {
        let mut worker = self.build(settings)?;
        worker
            .start()
            .with_context(|| format!("cannot register brick {}", self.brick.display()))?;

        let now = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default();
        let history = worker.catch_up(now).context("history replay failed")?;

        if self.once {
            if let Some(report) = history {
                print_report(&report)?;
            }
            print_report(&worker.run_cycle()?)?;
            return Ok(());
        }

        worker.run(shutdown)?;
        Ok(())
    }
}

fn print_report(report: &CycleReport) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(report)?);
    Ok(())
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Exit status for config command failures: 2 when nothing changed, 1 otherwise
fn config_failure(err: &ConfigError) -> ExitCode {
    match err {
        ConfigError::NotChanged { .. } => {
            eprintln!("{}", err.to_string().yellow());
            ExitCode::from(2)
        }
        _ => {
            eprintln!("{} {}", "Error:".red().bold(), err);
            ExitCode::from(1)
        }
    }
}

pub fn config_get(path: &Path, name: Option<&str>, json: bool) -> ExitCode {
    let values = match load_config(path).and_then(|c| c.get(name)) {
        Ok(values) => values,
        Err(e) => return config_failure(&e),
    };

    if json {
        let object: serde_json::Map<String, Value> = values
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        println!("{}", Value::Object(object));
    } else {
        for (key, value) in values {
            println!("{}: {}", format!("{:<NAME_WIDTH$}", key).bold(), display_value(&value));
        }
    }
    ExitCode::SUCCESS
}

pub fn config_help(name: Option<&str>) -> ExitCode {
    let specs = match Config::help(name) {
        Ok(specs) => specs,
        Err(e) => return config_failure(&e),
    };

    for spec in specs {
        println!("{}: {}", format!("{:<NAME_WIDTH$}", spec.name).bold(), spec.help);
        let default = display_value(&spec.default.to_value());
        println!("{:<NAME_WIDTH$}  default: {}", "", default.dimmed());
        if !spec.choices.is_empty() {
            println!("{:<NAME_WIDTH$}  choices: {}", "", spec.choices.join(", "));
        }
    }
    ExitCode::SUCCESS
}

pub fn config_set(path: &Path, name: &str, value: &str) -> ExitCode {
    let mut config = match load_config(path) {
        Ok(config) => config,
        Err(e) => return config_failure(&e),
    };
    match config.set(path, name, value) {
        Ok(()) => {
            println!("{} {} = {}", "Updated".green(), name, value);
            ExitCode::SUCCESS
        }
        Err(e) => config_failure(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(extra: &[&str]) -> WorkerArgs {
        let mut argv = vec![
            "geosync",
            "worker",
            "--brick",
            "/bricks/b1",
            "--workdir",
            "/var/lib/geosync/b1",
            "--changelog-logfile",
            "/var/log/geosync/b1-changes.log",
        ];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Worker(args) => args,
            other => panic!("Expected worker, got {:?}", other),
        }
    }

    #[test]
    fn test_worker_args() {
        let args = worker(&["--sync-jobs", "5", "--dest-root", "backup::vol"]);
        assert_eq!(args.brick, PathBuf::from("/bricks/b1"));
        assert_eq!(args.sync_jobs, Some(5));
        assert!(!args.once);

        let settings = args.settings().unwrap();
        assert_eq!(settings.sync_jobs, 5);
        assert_eq!(settings.batch_size, 1000);
        assert_eq!(settings.dest_root.as_deref(), Some("backup::vol"));
    }

    #[test]
    fn test_worker_requires_brick() {
        assert!(Cli::try_parse_from(["geosync", "worker", "--workdir", "/w"]).is_err());
    }

    #[test]
    fn test_zero_jobs_rejected() {
        assert!(worker(&["--sync-jobs", "0"]).settings().is_err());
    }

    #[test]
    fn test_build_without_destination_fails() {
        let temp = tempfile::TempDir::new().unwrap();
        let args = WorkerArgs {
            workdir: temp.path().join("work"),
            ..worker(&[])
        };
        let err = args.build(&args.settings().unwrap()).err().unwrap();
        assert!(err.to_string().contains("destination"));
        // nothing was locked or created
        assert!(!temp.path().join("work").exists());
    }

    #[test]
    fn test_changelog_level() {
        assert_eq!(parse_changelog_level("INFO").unwrap(), 7);
        assert_eq!(parse_changelog_level("trace").unwrap(), 9);
        assert_eq!(parse_changelog_level("3").unwrap(), 3);
        assert!(parse_changelog_level("10").is_err());
        assert!(parse_changelog_level("LOUD").is_err());
    }

    #[test]
    fn test_expand_path() {
        assert_eq!(expand_path("/abs").unwrap(), PathBuf::from("/abs"));
        assert_eq!(expand_path("~user/x").unwrap(), PathBuf::from("~user/x"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_path("~").unwrap(), home);
            assert_eq!(expand_path("~/work").unwrap(), home.join("work"));
        }
        assert!(expand_path("").is_err());
    }
}

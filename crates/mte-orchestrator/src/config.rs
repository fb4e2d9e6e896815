use crate::channel::LocalPaths;
use crate::orchestrator::WatchdogPolicy;
use crate::target::ReadinessPolicy;
use anyhow::{anyhow, Context, Result};
use mte_core::layout::{CORPUS_DIR, RUNNER_BINARY};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CORPUS_URL: &str = "https://github.com/Medusa-Team/medusa-tests";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub target: TargetConfig,
    pub env: EnvConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(skip)]
    base_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    #[serde(default)]
    pub vm_name: Option<String>,
    #[serde(default)]
    pub using_vb: bool,
    #[serde(default = "default_frontend")]
    pub vm_frontend: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvConfig {
    pub environment_dir: String,
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub runner_binary: Option<PathBuf>,
    #[serde(default = "default_corpus_url")]
    pub corpus_url: String,
    #[serde(default = "default_true")]
    pub sudo: bool,
}

/// Durations in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub probe_attempts: u32,
    pub probe_backoff: u64,
    pub boot_settle: u64,
    pub command_timeout: u64,
    pub watchdog_initial_delay: u64,
    pub watchdog_interval: u64,
    pub watchdog_max_wait: Option<u64>,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            probe_attempts: 3,
            probe_backoff: 2,
            boot_settle: 90,
            command_timeout: 10,
            watchdog_initial_delay: 5,
            watchdog_interval: 5,
            watchdog_max_wait: None,
        }
    }
}

fn default_port() -> u16 {
    22
}

fn default_frontend() -> String {
    "gui".to_string()
}

fn default_corpus_url() -> String {
    DEFAULT_CORPUS_URL.to_string()
}

fn default_true() -> bool {
    true
}

impl TimingConfig {
    pub fn readiness(&self) -> ReadinessPolicy {
        ReadinessPolicy {
            attempts: self.probe_attempts,
            backoff: Duration::from_secs(self.probe_backoff),
            boot_settle: Duration::from_secs(self.boot_settle),
            probe_timeout: self.command_timeout(),
        }
    }

    pub fn watchdog(&self) -> WatchdogPolicy {
        WatchdogPolicy {
            initial_delay: Duration::from_secs(self.watchdog_initial_delay),
            interval: Duration::from_secs(self.watchdog_interval),
            probe_timeout: self.command_timeout(),
            max_wait: self.watchdog_max_wait.map(Duration::from_secs),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout)
    }
}

/// Local directory layout under the deployment root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub root: PathBuf,
    pub tests_dir: PathBuf,
    pub corpus_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub results_dir: PathBuf,
    pub log_file: PathBuf,
    pub runner_binary: PathBuf,
}

impl Deployment {
    pub fn at(root: &Path, runner_binary: PathBuf) -> Self {
        let tests_dir = root.join("tests");
        Self {
            root: root.to_path_buf(),
            corpus_dir: tests_dir.join(CORPUS_DIR),
            tests_dir,
            staging_dir: root.join("target"),
            results_dir: root.join("results"),
            log_file: root.join("mte.log"),
            runner_binary,
        }
    }

    pub fn local_paths(&self) -> LocalPaths {
        LocalPaths {
            staging_dir: self.staging_dir.clone(),
            corpus_dir: self.corpus_dir.clone(),
            results_dir: self.results_dir.clone(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("config_missing: {}", path.display()))?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        Self::from_yaml(&raw, &base_dir)
    }

    pub fn from_yaml(raw: &str, base_dir: &Path) -> Result<Self> {
        let mut config: Config = serde_yaml::from_str(raw).context("config_parse_failed")?;
        config.base_dir = base_dir.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.target.using_vb
            && self
                .target
                .vm_name
                .as_deref()
                .map_or(true, |n| n.trim().is_empty())
        {
            return Err(anyhow!("config_invalid: target.using_vb requires target.vm_name"));
        }
        if self.target.port == 0 {
            return Err(anyhow!("config_invalid: target.port must be non-zero"));
        }
        let env_dir = self.env.environment_dir.trim_end_matches('/');
        if !self.env.environment_dir.starts_with('/') || env_dir.is_empty() {
            return Err(anyhow!(
                "config_invalid: env.environment_dir must be an absolute path other than / (got {:?})",
                self.env.environment_dir
            ));
        }
        if self.timing.probe_attempts == 0 {
            return Err(anyhow!("config_invalid: timing.probe_attempts must be at least 1"));
        }
        Ok(())
    }

    pub fn vm_name(&self) -> Option<&str> {
        if self.target.using_vb {
            self.target.vm_name.as_deref()
        } else {
            None
        }
    }

    pub fn deployment(&self) -> Deployment {
        let root = match &self.env.root {
            Some(r) if r.is_absolute() => r.clone(),
            Some(r) => self.base_dir.join(r),
            None => self.base_dir.clone(),
        };
        let runner = match &self.env.runner_binary {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => root.join(p),
            None => default_runner_binary(),
        };
        Deployment::at(&root, runner)
    }
}

fn default_runner_binary() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.join(RUNNER_BINARY)))
        .unwrap_or_else(|| PathBuf::from(RUNNER_BINARY))
}

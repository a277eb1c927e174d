//! Compiler service configuration.
//!
//! Configuration is a JSON document (`config.json`) with optional
//! environment overrides:
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `DATABASE_URL` | `database_url` |
//! | `COMPILER_NUMBER` | `compiler_number` |
//! | `DB_SCAN_INTERVAL` | `db_scan_interval` (seconds) |
//! | `COMPILE_TIMEOUT` | `compile_timeout` (seconds) |
//! | `COMPILE_TMP_DIR` | `compile_tmp_dir` |
//!
//! Unknown keys are ignored so one file can be shared with the API layer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::defaults;
use crate::error::{Error, Result};

/// Per-template settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Structure file name inside `structure_dir`.
    pub structure: String,
    /// Auxiliary class file copied into every scratch directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cls_path: Option<PathBuf>,
}

/// Worker pool strategy, chosen at deployment time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// In-process workers fed by message queues.
    #[default]
    Process,
    /// Persistent sandboxes driven by detached commands and marker files.
    Sandbox,
}

/// What the process strategy does when the compiler exceeds its deadline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutPolicy {
    /// Drop the task and leave it `compiling` (reclaimable through `lease_timeout`).
    #[default]
    Abandon,
    /// Mark the task `failed` with a timeout description.
    Fail,
}

/// Sandbox runtime settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Runtime endpoint (e.g. `unix:///var/run/docker.sock`); runtime default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_host: Option<String>,
    /// Image every sandbox is started from.
    pub image: String,
    /// Volume shared between host and sandboxes, mounted at `compile_tmp_dir`.
    pub volume: String,
    /// Prefix of the deterministic sandbox names.
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
}

fn default_name_prefix() -> String {
    defaults::SANDBOX_NAME_PREFIX.to_string()
}

fn default_structure_dir() -> PathBuf {
    PathBuf::from(defaults::STRUCTURE_DIR)
}

fn default_compile_tmp_dir() -> PathBuf {
    PathBuf::from(defaults::COMPILE_TMP_DIR)
}

fn default_compile_timeout() -> f64 {
    defaults::COMPILE_TIMEOUT_SECS as f64
}

fn default_scan_interval() -> f64 {
    defaults::DB_SCAN_INTERVAL_SECS
}

fn default_error_backoff() -> f64 {
    defaults::SCAN_ERROR_BACKOFF_SECS
}

/// Configuration for the scheduler and worker pools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompilerConfig {
    #[serde(default = "default_structure_dir")]
    pub structure_dir: PathBuf,
    #[serde(default)]
    pub templates: HashMap<String, TemplateConfig>,
    /// Command template with `{filepath}` and `{outdir}` placeholders.
    #[serde(default)]
    pub compile_cmd: Option<String>,
    /// Seconds; process strategy only.
    #[serde(default = "default_compile_timeout")]
    pub compile_timeout: f64,
    #[serde(default = "default_compile_tmp_dir")]
    pub compile_tmp_dir: PathBuf,
    /// Pool size; host parallelism when absent.
    #[serde(default)]
    pub compiler_number: Option<usize>,
    /// Seconds between store scans.
    #[serde(default = "default_scan_interval")]
    pub db_scan_interval: f64,
    /// Seconds to wait after a failed pass.
    #[serde(default = "default_error_backoff")]
    pub scan_error_backoff: f64,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub on_timeout: TimeoutPolicy,
    /// Seconds after which a `compiling` task nobody holds is failed; disabled when absent.
    #[serde(default)]
    pub lease_timeout: Option<f64>,
    /// Keep scratch directories of failed attempts for inspection.
    #[serde(default)]
    pub keep_failed_scratch: bool,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub sandbox: Option<SandboxConfig>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            structure_dir: default_structure_dir(),
            templates: HashMap::new(),
            compile_cmd: None,
            compile_timeout: default_compile_timeout(),
            compile_tmp_dir: default_compile_tmp_dir(),
            compiler_number: None,
            db_scan_interval: default_scan_interval(),
            scan_error_backoff: default_error_backoff(),
            strategy: Strategy::default(),
            on_timeout: TimeoutPolicy::default(),
            lease_timeout: None,
            keep_failed_scratch: false,
            database_url: None,
            sandbox: None,
        }
    }
}

impl CompilerConfig {
    /// Create a config with the given compile command and defaults elsewhere.
    pub fn new(compile_cmd: impl Into<String>) -> Self {
        Self {
            compile_cmd: Some(compile_cmd.into()),
            ..Default::default()
        }
    }

    /// Parse a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(format!("invalid config: {}", e)))
    }

    /// Load the configuration file, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_json_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        debug!(
            path = %path.display(),
            strategy = ?config.strategy,
            workers = config.worker_count(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Apply the documented environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Some(n) = std::env::var("COMPILER_NUMBER")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
        {
            self.compiler_number = Some(n);
        }
        if let Some(secs) = std::env::var("DB_SCAN_INTERVAL")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
        {
            self.db_scan_interval = secs;
        }
        if let Some(secs) = std::env::var("COMPILE_TIMEOUT")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
        {
            self.compile_timeout = secs;
        }
        if let Ok(dir) = std::env::var("COMPILE_TMP_DIR") {
            self.compile_tmp_dir = PathBuf::from(dir);
        }
    }

    /// Reject configurations the scheduler cannot start with.
    pub fn validate(&self) -> Result<()> {
        match self.compile_cmd.as_deref() {
            Some(cmd) if !cmd.trim().is_empty() => {}
            _ => return Err(Error::Config("no compile command provided".into())),
        }
        if self.compiler_number == Some(0) {
            return Err(Error::Config("compiler_number must be at least 1".into()));
        }
        for (name, secs) in [
            ("compile_timeout", self.compile_timeout),
            ("db_scan_interval", self.db_scan_interval),
            ("scan_error_backoff", self.scan_error_backoff),
        ] {
            if Duration::try_from_secs_f64(secs).is_err() {
                return Err(Error::Config(format!(
                    "{} must be a non-negative number of seconds within range",
                    name
                )));
            }
        }
        if let Some(secs) = self.lease_timeout {
            if secs <= 0.0 || Duration::try_from_secs_f64(secs).is_err() {
                return Err(Error::Config(
                    "lease_timeout must be a positive number of seconds within range".into(),
                ));
            }
        }
        if self.strategy == Strategy::Sandbox && self.sandbox.is_none() {
            return Err(Error::Config(
                "sandbox strategy requires a `sandbox` section".into(),
            ));
        }
        Ok(())
    }

    /// The compile command template.
    pub fn compile_cmd(&self) -> Result<&str> {
        self.compile_cmd
            .as_deref()
            .filter(|cmd| !cmd.trim().is_empty())
            .ok_or_else(|| Error::Config("no compile command provided".into()))
    }

    /// Settings for a template name.
    pub fn template(&self, name: &str) -> Result<&TemplateConfig> {
        self.templates
            .get(name)
            .ok_or_else(|| Error::Template(format!("unknown template: {}", name)))
    }

    /// Number of workers in the pool.
    pub fn worker_count(&self) -> usize {
        self.compiler_number
            .unwrap_or_else(defaults::compiler_number)
            .max(1)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.compile_timeout)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs_f64(self.db_scan_interval)
    }

    pub fn scan_error_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.scan_error_backoff)
    }

    pub fn lease_timeout(&self) -> Option<Duration> {
        self.lease_timeout.map(Duration::from_secs_f64)
    }

    /// Register a template.
    pub fn with_template(mut self, name: impl Into<String>, template: TemplateConfig) -> Self {
        self.templates.insert(name.into(), template);
        self
    }

    pub fn with_structure_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.structure_dir = dir.into();
        self
    }

    pub fn with_compile_tmp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.compile_tmp_dir = dir.into();
        self
    }

    pub fn with_compiler_number(mut self, n: usize) -> Self {
        self.compiler_number = Some(n);
        self
    }

    pub fn with_compile_timeout(mut self, timeout: Duration) -> Self {
        self.compile_timeout = timeout.as_secs_f64();
        self
    }

    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.db_scan_interval = interval.as_secs_f64();
        self
    }

    pub fn with_on_timeout(mut self, policy: TimeoutPolicy) -> Self {
        self.on_timeout = policy;
        self
    }

    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = Some(timeout.as_secs_f64());
        self
    }

    pub fn with_keep_failed_scratch(mut self, keep: bool) -> Self {
        self.keep_failed_scratch = keep;
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.strategy = Strategy::Sandbox;
        self.sandbox = Some(sandbox);
        self
    }
}

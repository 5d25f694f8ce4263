//! Reporter configuration stored in `config/casetrace.toml`.
//!
//! Every key can be overridden from the process environment, first by its
//! lowercase name and then by its uppercase name.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

pub const DEFAULT_CONFIG_PATH: &str = "config/casetrace.toml";
pub const DEFAULT_RUN_NAME: &str = "%(project_key) %(test_run_suffix)";
pub const DEFAULT_PLAN_NAME: &str = "%(project_key) %(test_plan_suffix)";

/// Reporter configuration (TOML).
///
/// Missing fields default to a disabled reporter with the usual name
/// templates and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReporterConfig {
    /// Report results to the remote service at all.
    pub enabled: bool,
    pub project_key: Option<String>,
    /// Report into this existing run instead of resolving one by name.
    pub test_run_key: Option<String>,
    pub test_plan_key: Option<String>,
    /// Defaults to `test run <YYYYmmddHHMM>` at session start.
    pub test_run_suffix: Option<String>,
    pub test_plan_suffix: Option<String>,
    pub test_run_folder: Option<String>,
    pub test_plan_folder: Option<String>,
    /// One environment, or one per worker in per-environment distribution.
    #[serde(deserialize_with = "string_list")]
    pub test_environment: Vec<String>,
    #[serde(deserialize_with = "string_list")]
    pub test_case_keys: Vec<String>,
    #[serde(deserialize_with = "string_list")]
    pub test_case_order: Vec<String>,
    /// `[start, end, start, end, ...]` case key pairs.
    #[serde(deserialize_with = "string_list")]
    pub test_case_range: Vec<String>,
    pub skip_ntc_methods: bool,
    pub append_to_cycle: bool,
    pub test_run_name: String,
    pub test_plan_name: String,
    /// Default budget of a meta block.
    pub meta_block_timeout_secs: u64,
    /// Poll interval of workers waiting for the primary to create the run.
    pub run_wait_poll_ms: u64,
    /// Give up waiting for the run after this long.
    pub run_wait_timeout_secs: u64,
    /// Only report when this user executes the session.
    pub restrict_user: Option<String>,
    /// Refuse to report from any branch but `restrict_branch_name`.
    pub restrict_branch: bool,
    pub restrict_branch_name: String,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            project_key: None,
            test_run_key: None,
            test_plan_key: None,
            test_run_suffix: None,
            test_plan_suffix: None,
            test_run_folder: None,
            test_plan_folder: None,
            test_environment: Vec::new(),
            test_case_keys: Vec::new(),
            test_case_order: Vec::new(),
            test_case_range: Vec::new(),
            skip_ntc_methods: false,
            append_to_cycle: false,
            test_run_name: DEFAULT_RUN_NAME.to_string(),
            test_plan_name: DEFAULT_PLAN_NAME.to_string(),
            meta_block_timeout_secs: 600,
            run_wait_poll_ms: 1000,
            run_wait_timeout_secs: 600,
            restrict_user: None,
            restrict_branch: false,
            restrict_branch_name: "origin/master".to_string(),
        }
    }
}

impl ReporterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.meta_block_timeout_secs == 0 {
            return Err(anyhow!("meta_block_timeout_secs must be > 0"));
        }
        if self.run_wait_poll_ms == 0 {
            return Err(anyhow!("run_wait_poll_ms must be > 0"));
        }
        if self.run_wait_timeout_secs == 0 {
            return Err(anyhow!("run_wait_timeout_secs must be > 0"));
        }
        if self.test_run_name.trim().is_empty() {
            return Err(anyhow!("test_run_name must not be empty"));
        }
        if self.test_plan_name.trim().is_empty() {
            return Err(anyhow!("test_plan_name must not be empty"));
        }
        Ok(())
    }

    pub fn meta_block_timeout(&self) -> Duration {
        Duration::from_secs(self.meta_block_timeout_secs)
    }

    pub fn run_wait_poll(&self) -> Duration {
        Duration::from_millis(self.run_wait_poll_ms)
    }

    pub fn run_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.run_wait_timeout_secs)
    }

    /// Configured run suffix, or `test run <YYYYmmddHHMM>` for now.
    pub fn run_suffix(&self) -> String {
        self.test_run_suffix.clone().unwrap_or_else(|| {
            format!("test run {}", chrono::Local::now().format("%Y%m%d%H%M"))
        })
    }

    /// Environment of a worker: entry `index`, or the last entry when fewer are configured.
    pub fn environment_for(&self, index: usize) -> Option<String> {
        self.test_environment
            .get(index)
            .or_else(|| self.test_environment.last())
            .cloned()
    }

    /// Apply environment overrides; `lookup` is consulted with `key`, then `KEY`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).or_else(|| lookup(&key.to_ascii_uppercase()));

        if let Some(value) = get("enabled") {
            self.enabled = parse_bool("enabled", &value)?;
        }
        if let Some(value) = get("skip_ntc_methods") {
            self.skip_ntc_methods = parse_bool("skip_ntc_methods", &value)?;
        }
        if let Some(value) = get("append_to_cycle") {
            self.append_to_cycle = parse_bool("append_to_cycle", &value)?;
        }
        if let Some(value) = get("restrict_branch") {
            self.restrict_branch = parse_bool("restrict_branch", &value)?;
        }

        for (key, slot) in [
            ("project_key", &mut self.project_key),
            ("test_run_key", &mut self.test_run_key),
            ("test_plan_key", &mut self.test_plan_key),
            ("test_run_suffix", &mut self.test_run_suffix),
            ("test_plan_suffix", &mut self.test_plan_suffix),
            ("test_run_folder", &mut self.test_run_folder),
            ("test_plan_folder", &mut self.test_plan_folder),
            ("restrict_user", &mut self.restrict_user),
        ] {
            if let Some(value) = get(key) {
                *slot = Some(value);
            }
        }

        for (key, slot) in [
            ("test_run_name", &mut self.test_run_name),
            ("test_plan_name", &mut self.test_plan_name),
            ("restrict_branch_name", &mut self.restrict_branch_name),
        ] {
            if let Some(value) = get(key) {
                *slot = value;
            }
        }

        for (key, slot) in [
            ("test_environment", &mut self.test_environment),
            ("test_case_keys", &mut self.test_case_keys),
            ("test_case_order", &mut self.test_case_order),
            ("test_case_range", &mut self.test_case_range),
        ] {
            if let Some(value) = get(key) {
                *slot = split_list(&value);
            }
        }

        for (key, slot) in [
            ("meta_block_timeout_secs", &mut self.meta_block_timeout_secs),
            ("run_wait_poll_ms", &mut self.run_wait_poll_ms),
            ("run_wait_timeout_secs", &mut self.run_wait_timeout_secs),
        ] {
            if let Some(value) = get(key) {
                *slot = value
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid integer for {key}: {value}"))?;
            }
        }
        Ok(())
    }
}

/// Parse `true/1/yes` and `false/0/no` (case-insensitive).
pub fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(anyhow!("invalid bool for {key}: {value}")),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

fn string_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ListOrString {
        List(Vec<String>),
        Joined(String),
    }

    Ok(match ListOrString::deserialize(deserializer)? {
        ListOrString::List(entries) => entries
            .into_iter()
            .map(|entry| entry.trim().to_string())
            .collect(),
        ListOrString::Joined(joined) => split_list(&joined),
    })
}

/// Load config from a TOML file and the process environment.
///
/// If the file is missing, the defaults are used.
pub fn load_config(path: &Path) -> Result<ReporterConfig> {
    load_config_with(path, |key| std::env::var(key).ok())
}

/// Load config from a TOML file with overrides resolved by `lookup`.
pub fn load_config_with<F>(path: &Path, lookup: F) -> Result<ReporterConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut cfg = if path.exists() {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?
    } else {
        debug!(path = %path.display(), "config file missing, using defaults");
        ReporterConfig::default()
    };
    cfg.apply_overrides(lookup)?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ReporterConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

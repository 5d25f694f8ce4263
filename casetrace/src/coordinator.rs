//! Session coordinator: resolves the run (and plan) a session reports into.
//!
//! Exactly one process creates a run per (environment, session). In a
//! load-balanced distribution the primary worker creates it and every other
//! worker polls by name until it appears; in per-environment distribution
//! each worker creates its own run.

use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, instrument, warn};

use crate::core::refresh::RefreshTokens;
use crate::core::template::render_name;
use crate::io::config::ReporterConfig;
use crate::io::remote::{NewPlan, NewRun, TestManagement};

/// How test items are distributed across worker processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    /// Every worker runs all items against its own environment.
    Each,
    /// Items are balanced across workers sharing one run.
    Load,
}

/// Identity of the current worker process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerInfo {
    /// Worker id such as `gw0`; `None` when not distributed.
    pub id: Option<String>,
    pub distribution: Option<Distribution>,
}

impl WorkerInfo {
    pub fn new(id: impl Into<String>, distribution: Distribution) -> Self {
        Self {
            id: Some(id.into()),
            distribution: Some(distribution),
        }
    }

    /// Read `CASETRACE_WORKER_ID` and `CASETRACE_DISTRIBUTION` (`each` or `load`).
    pub fn from_env() -> Self {
        let id = std::env::var("CASETRACE_WORKER_ID")
            .ok()
            .filter(|id| !id.is_empty());
        let distribution = match std::env::var("CASETRACE_DISTRIBUTION").ok().as_deref() {
            Some("each") => Some(Distribution::Each),
            Some("load") => Some(Distribution::Load),
            _ => None,
        };
        Self { id, distribution }
    }

    /// Numeric index from a `gw<N>` id, 0 otherwise.
    pub fn index(&self) -> usize {
        self.id
            .as_deref()
            .and_then(|id| id.strip_prefix("gw"))
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    }

    pub fn is_primary(&self) -> bool {
        self.id.as_deref().is_none_or(|id| id == "gw0")
    }

    pub fn is_each(&self) -> bool {
        self.distribution == Some(Distribution::Each)
    }

    /// Whether this worker creates its own run.
    pub fn creates_run(&self) -> bool {
        self.is_primary() || self.is_each()
    }
}

/// Run/plan settings derived from configuration for one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    pub project_key: Option<String>,
    pub test_run_key: Option<String>,
    pub test_plan_key: Option<String>,
    pub test_run_suffix: String,
    pub test_plan_suffix: Option<String>,
    pub test_run_folder: Option<String>,
    pub test_plan_folder: Option<String>,
    pub test_environment: Option<String>,
    pub test_run_name: String,
    pub test_plan_name: String,
    pub poll_interval: Duration,
    pub wait_timeout: Duration,
}

impl RunSettings {
    pub fn from_config(cfg: &ReporterConfig, worker: &WorkerInfo) -> Self {
        let env_index = if worker.is_each() { worker.index() } else { 0 };
        Self {
            project_key: cfg.project_key.clone(),
            test_run_key: cfg.test_run_key.clone(),
            test_plan_key: cfg.test_plan_key.clone(),
            test_run_suffix: cfg.run_suffix(),
            test_plan_suffix: cfg.test_plan_suffix.clone(),
            test_run_folder: cfg.test_run_folder.clone(),
            test_plan_folder: cfg.test_plan_folder.clone(),
            test_environment: cfg.environment_for(env_index),
            test_run_name: cfg.test_run_name.clone(),
            test_plan_name: cfg.test_plan_name.clone(),
            poll_interval: cfg.run_wait_poll(),
            wait_timeout: cfg.run_wait_timeout(),
        }
    }

    /// Value of a `%(name)` placeholder; `None` for unknown names.
    fn attribute(&self, name: &str) -> Option<Option<String>> {
        let value = match name {
            "project_key" => self.project_key.clone(),
            "test_run_key" => self.test_run_key.clone(),
            "test_plan_key" => self.test_plan_key.clone(),
            "test_run_suffix" => Some(self.test_run_suffix.clone()),
            "test_plan_suffix" => self.test_plan_suffix.clone(),
            "test_run_folder" => self.test_run_folder.clone(),
            "test_plan_folder" => self.test_plan_folder.clone(),
            "test_environment" => self.test_environment.clone(),
            _ => return None,
        };
        Some(value)
    }

    fn render(&self, template: &str) -> Result<String> {
        render_name(template, |name| self.attribute(name)).map_err(|err| anyhow!(err))
    }
}

/// Run and plan a session reports into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub run_key: Option<String>,
    pub plan_key: Option<String>,
}

/// Resolves the run/plan once per session and remembers plan links.
#[derive(Debug, Clone)]
pub struct Coordinator {
    settings: RunSettings,
    worker: WorkerInfo,
    /// Plan each run is linked to.
    plan_links: BTreeMap<String, String>,
}

impl Coordinator {
    pub fn new(settings: RunSettings, worker: WorkerInfo) -> Self {
        Self {
            settings,
            worker,
            plan_links: BTreeMap::new(),
        }
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn worker(&self) -> &WorkerInfo {
        &self.worker
    }

    /// Resolve the active run: configured key, existing run by name, or a freshly created one.
    ///
    /// `case_keys` are the cases selected for this session; a created run
    /// contains them and their refresh tokens are marked as created by it.
    #[instrument(skip_all, fields(worker = ?self.worker.id))]
    pub fn resolve<R: TestManagement>(
        &mut self,
        remote: &R,
        case_keys: &[String],
        tokens: &mut RefreshTokens,
    ) -> Result<Resolution> {
        let mut resolution = Resolution {
            run_key: self.settings.test_run_key.clone(),
            plan_key: self.settings.test_plan_key.clone(),
        };
        let Some(project_key) = self.settings.project_key.clone() else {
            debug!(run_key = ?resolution.run_key, "no project configured, using configured run");
            return Ok(resolution);
        };

        let mut run_name = self.settings.render(&self.settings.test_run_name)?;
        let plan_name = self.settings.render(&self.settings.test_plan_name)?;

        if resolution.plan_key.is_none()
            && let Some(suffix) = self.settings.test_plan_suffix.clone()
        {
            resolution.plan_key =
                Some(self.find_or_create_plan(remote, &project_key, &plan_name, &suffix)?);
        }

        if resolution.run_key.is_none() {
            if self.worker.creates_run() {
                let existing = if self.worker.is_each() {
                    None
                } else {
                    remote.get_run_by_name(&run_name)?.map(|run| run.key)
                };
                if self.worker.is_each()
                    && self
                        .settings
                        .test_environment
                        .as_deref()
                        .is_none_or(|env| !run_name.contains(env))
                {
                    run_name = format!("{run_name} {}", self.worker.index());
                }

                let run_key = match existing {
                    Some(run_key) => {
                        info!(run_key, run_name, "reusing existing test run");
                        run_key
                    }
                    None => {
                        let run_key = remote
                            .create_run(&NewRun {
                                project_key: project_key.clone(),
                                plan_key: resolution.plan_key.clone(),
                                name: run_name.clone(),
                                case_keys: case_keys.to_vec(),
                                folder: self.settings.test_run_folder.clone(),
                            })
                            .with_context(|| format!("create test run {run_name}"))?;
                        info!(run_key, run_name, "created test run");
                        if let Some(plan_key) = &resolution.plan_key {
                            self.plan_links.insert(run_key.clone(), plan_key.clone());
                        }
                        for case_key in case_keys {
                            tokens.mark_first(case_key, &run_key);
                        }
                        run_key
                    }
                };
                resolution.run_key = Some(run_key);
            } else {
                resolution.run_key = Some(self.wait_for_run(remote, &run_name)?);
            }
        }

        if let (Some(plan_key), Some(run_key)) = (&resolution.plan_key, &resolution.run_key)
            && self.plan_links.get(run_key) != Some(plan_key)
        {
            debug!(plan_key, run_key, "linking test run to test plan");
            remote.edit_plan(plan_key, std::slice::from_ref(run_key))?;
            self.plan_links.insert(run_key.clone(), plan_key.clone());
        }
        Ok(resolution)
    }

    fn find_or_create_plan<R: TestManagement>(
        &self,
        remote: &R,
        project_key: &str,
        plan_name: &str,
        suffix: &str,
    ) -> Result<String> {
        let plans = remote.get_plans(&format!("projectKey = \"{project_key}\""))?;
        let found = plans
            .iter()
            .find(|plan| plan.name == plan_name)
            .or_else(|| plans.iter().find(|plan| plan.name.ends_with(suffix)));
        if let Some(plan) = found {
            debug!(plan_key = %plan.key, "reusing existing test plan");
            return Ok(plan.key.clone());
        }
        let plan_key = remote.create_plan(&NewPlan {
            project_key: project_key.to_string(),
            name: plan_name.to_string(),
            folder: self.settings.test_plan_folder.clone(),
        })?;
        info!(plan_key, plan_name, "created test plan");
        Ok(plan_key)
    }

    /// Poll until the primary worker's run is visible by name.
    fn wait_for_run<R: TestManagement>(&self, remote: &R, run_name: &str) -> Result<String> {
        let started = Instant::now();
        loop {
            thread::sleep(self.settings.poll_interval);
            if let Some(run) = remote.get_run_by_name(run_name)? {
                debug!(run_key = %run.key, "test run became available");
                return Ok(run.key);
            }
            if started.elapsed() >= self.settings.wait_timeout {
                warn!(run_name, "gave up waiting for test run");
                bail!(
                    "test run \"{run_name}\" did not appear within {}s",
                    self.settings.wait_timeout.as_secs()
                );
            }
        }
    }

    /// Create the configured environment remotely if it does not exist yet.
    pub fn ensure_environment<R: TestManagement>(
        &self,
        remote: &R,
        run_key: Option<&str>,
        case_keys: &[String],
    ) -> Result<()> {
        let Some(environment) = self.settings.test_environment.as_deref() else {
            return Ok(());
        };
        if case_keys.is_empty() {
            return Ok(());
        }
        let project_key = match run_key {
            Some(run_key) => remote
                .get_run(run_key)?
                .and_then(|run| run.project_key)
                .or_else(|| self.settings.project_key.clone()),
            None => self.settings.project_key.clone(),
        };
        let Some(project_key) = project_key else {
            return Ok(());
        };
        let known = remote.get_environments(&project_key)?;
        if !known.iter().any(|name| name == environment) {
            info!(project_key, environment, "creating test environment");
            remote.create_environment(&project_key, environment)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> RunSettings {
        RunSettings::from_config(
            &ReporterConfig {
                project_key: Some("PRJ".to_string()),
                test_run_suffix: Some("nightly".to_string()),
                ..ReporterConfig::default()
            },
            &WorkerInfo::default(),
        )
    }

    #[test]
    fn worker_index_parses_gw_ids() {
        assert_eq!(WorkerInfo::new("gw3", Distribution::Each).index(), 3);
        assert_eq!(WorkerInfo::default().index(), 0);
        assert!(WorkerInfo::default().is_primary());
        assert!(!WorkerInfo::new("gw1", Distribution::Load).creates_run());
        assert!(WorkerInfo::new("gw1", Distribution::Each).creates_run());
    }

    #[test]
    fn default_run_name_uses_project_and_suffix() {
        let settings = settings();
        assert_eq!(
            settings.render(&settings.test_run_name).expect("render"),
            "PRJ nightly"
        );
    }

    #[test]
    fn unknown_placeholder_is_rejected() {
        let err = settings().render("%(nope)").expect_err("unknown");
        assert!(err.to_string().contains("'nope' not known"));
    }

    /// Per-environment workers each pick their own environment.
    #[test]
    fn each_workers_pick_their_environment() {
        let cfg = ReporterConfig {
            test_environment: vec!["linux".to_string(), "windows".to_string()],
            ..ReporterConfig::default()
        };
        let worker = WorkerInfo::new("gw1", Distribution::Each);
        assert_eq!(
            RunSettings::from_config(&cfg, &worker).test_environment.as_deref(),
            Some("windows")
        );
        let worker = WorkerInfo::new("gw1", Distribution::Load);
        assert_eq!(
            RunSettings::from_config(&cfg, &worker).test_environment.as_deref(),
            Some("linux")
        );
    }
}

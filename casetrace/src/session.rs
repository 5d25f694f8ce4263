//! Sequential session executor.
//!
//! Owns the per-session state (registry, report synchronizer, session-wide
//! control flags) and plays the test-runner role: it collects items, assigns
//! them to test cases, resolves the run, runs each item body inside a root
//! [`MetaBlock`] and reports the item's outcome.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::coordinator::{Coordinator, RunSettings, WorkerInfo};
use crate::core::comment::{Badge, html_row};
use crate::core::final_status::{ItemReport, ReportTargets, evaluate, status_line};
use crate::core::markers::{Marker, resolve_setup};
use crate::core::registry::{ItemRecord, Registry};
use crate::core::selection::{
    DEFAULT_PROJECT, SKIPPED_AS_REQUESTED, SelectionRules, apply_case_range, assign, intersection,
    order_cases,
};
use crate::core::types::{ItemMetadata, Outcome, SkipStatus};
use crate::exit_codes;
use crate::io::ci::{CiInfo, reporting_allowed};
use crate::io::config::ReporterConfig;
use crate::io::remote::TestManagement;
use crate::io::session_report::{SessionReport, write_session_report};
use crate::meta_block::{BlockOptions, CheckObserver, Interrupt, MetaBlock};
use crate::report_sync::{Publication, ReportSync};

/// Session-wide control flags set by failed checks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionControl {
    /// Reason applied to every item that has not started yet.
    pub block_remaining: Option<String>,
    /// Exit code and reason once the session must stop.
    pub terminate: Option<(i32, String)>,
}

/// Mutable state shared by all blocks of one session.
pub struct SessionState<R> {
    pub(crate) registry: Registry,
    pub(crate) sync: ReportSync<R>,
    pub(crate) control: SessionControl,
    pub(crate) observer: Option<Box<dyn CheckObserver>>,
    /// Check signature prefix (worker id in per-environment distribution).
    pub(crate) worker_prefix: Option<String>,
    /// Soft check failures recorded so far.
    pub(crate) assumptions: usize,
    pub(crate) enabled: bool,
    pub(crate) block_options: BlockOptions,
}

impl<R: TestManagement> SessionState<R> {
    pub fn new(remote: R, ci: CiInfo, enabled: bool) -> Self {
        Self {
            registry: Registry::new(),
            sync: ReportSync::new(remote, ci),
            control: SessionControl::default(),
            observer: None,
            worker_prefix: None,
            assumptions: 0,
            enabled,
            block_options: BlockOptions::default(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn sync(&self) -> &ReportSync<R> {
        &self.sync
    }

    pub fn sync_mut(&mut self) -> &mut ReportSync<R> {
        &mut self.sync
    }

    pub fn control(&self) -> &SessionControl {
        &self.control
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn assumptions(&self) -> usize {
        self.assumptions
    }

    pub fn set_observer(&mut self, observer: Box<dyn CheckObserver>) {
        self.observer = Some(observer);
    }

    pub fn set_block_options(&mut self, options: BlockOptions) {
        self.block_options = options;
    }
}

/// Body of a test item, run inside the item's root block.
pub type ItemBody<R> = Box<dyn FnOnce(&mut MetaBlock<'_, R>) -> Result<(), Interrupt>>;

/// One collected test item.
pub struct TestItem<R> {
    pub meta: ItemMetadata,
    body: ItemBody<R>,
}

impl<R> TestItem<R> {
    pub fn new<F>(meta: ItemMetadata, body: F) -> Self
    where
        F: FnOnce(&mut MetaBlock<'_, R>) -> Result<(), Interrupt> + 'static,
    {
        Self {
            meta,
            body: Box::new(body),
        }
    }
}

/// Result of a finished session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub exit_code: i32,
    pub reports: Vec<ItemReport>,
    pub targets: ReportTargets,
}

impl From<SessionSummary> for SessionReport {
    fn from(summary: SessionSummary) -> Self {
        Self {
            project_key: summary.targets.project_key,
            test_plan_key: summary.targets.test_plan_key,
            test_run_keys: summary.targets.test_run_keys,
            exit_code: summary.exit_code,
            items: summary.reports,
        }
    }
}

/// Collects and executes test items, reporting each of them.
pub struct Session<R> {
    config: ReporterConfig,
    coordinator: Coordinator,
    state: SessionState<R>,
    items: Vec<TestItem<R>>,
    report_path: Option<PathBuf>,
}

impl<R: TestManagement> Session<R> {
    /// Build a session; reporting is enabled only if configuration and CI restrictions allow it.
    pub fn new(config: ReporterConfig, remote: R, ci: CiInfo) -> Result<Self> {
        config.validate().context("invalid reporter configuration")?;
        let enabled = reporting_allowed(&config, &ci)?;
        let worker = WorkerInfo::default();
        let mut state = SessionState::new(remote, ci, enabled);
        state.block_options = BlockOptions::default().with_timeout(config.meta_block_timeout());
        Ok(Self {
            coordinator: Coordinator::new(RunSettings::from_config(&config, &worker), worker),
            config,
            state,
            items: Vec::new(),
            report_path: None,
        })
    }

    /// Build a session from the process environment: CI metadata and worker identity.
    pub fn from_env(config: ReporterConfig, remote: R) -> Result<Self> {
        Ok(Self::new(config, remote, CiInfo::from_env())?.with_worker(WorkerInfo::from_env()))
    }

    /// Persist the session report to `path` once the session finishes.
    pub fn with_report_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.report_path = Some(path.into());
        self
    }

    /// Run as worker `worker` of a distributed session.
    pub fn with_worker(mut self, worker: WorkerInfo) -> Self {
        self.state.worker_prefix = if worker.is_each() {
            worker.id.clone()
        } else {
            None
        };
        self.coordinator = Coordinator::new(RunSettings::from_config(&self.config, &worker), worker);
        self
    }

    pub fn with_observer(mut self, observer: Box<dyn CheckObserver>) -> Self {
        self.state.set_observer(observer);
        self
    }

    pub fn add_item(&mut self, item: TestItem<R>) {
        self.items.push(item);
    }

    pub fn state(&self) -> &SessionState<R> {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut SessionState<R> {
        &mut self.state
    }

    pub fn remote(&self) -> &R {
        self.state.sync.remote()
    }

    /// Items not yet executed, in execution order.
    pub fn items(&self) -> impl Iterator<Item = &ItemMetadata> {
        self.items.iter().map(|item| &item.meta)
    }

    /// Assign items to test cases, apply selection, ordering and ranges.
    ///
    /// Returns the case keys selected for reporting.
    #[instrument(skip_all, fields(items = self.items.len()))]
    pub fn collect(&mut self) -> Result<Vec<String>> {
        let mut rules = SelectionRules {
            default_project: self.config.project_key.clone(),
            case_keys: self.config.test_case_keys.clone(),
            append_to_cycle: self.config.append_to_cycle,
            skip_ntc_methods: self.config.skip_ntc_methods,
        };

        let run_cases = match (&self.config.test_run_key, self.state.enabled) {
            (Some(run_key), true) => {
                let run = self
                    .remote()
                    .get_run(run_key)?
                    .ok_or_else(|| anyhow!("test run {run_key} not found"))?;
                rules.restrict_to_run(&run.case_keys);
                Some(run.case_keys)
            }
            _ => None,
        };

        let mut collected: Vec<String> = Vec::new();
        let mut projects: Vec<String> = Vec::new();
        let mut item_cases: Vec<Option<String>> = Vec::with_capacity(self.items.len());
        for item in &mut self.items {
            self.state.registry.reset(&item.meta.fullname);
            let assignment = assign(&item.meta, &rules);
            item.meta.testcase = assignment.testcase;
            if let Some(skip) = assignment.skip {
                item.meta.markers.method.push(Marker::Skip {
                    reason: skip.reason,
                });
            }
            if let Some(key) = assignment.refresh_key {
                self.state.sync.tokens_mut().register(key);
            }
            if let Some(project) = assignment.project_key
                && !projects.contains(&project)
            {
                projects.push(project);
            }
            if let Some(case) = &assignment.collected_case
                && !collected.contains(case)
            {
                collected.push(case.clone());
            }
            item_cases.push(assignment.collected_case);
        }

        let enabled = self.state.enabled;
        if !enabled || (self.config.project_key.is_none() && self.config.test_run_key.is_none()) {
            debug!(collected = collected.len(), "no remote selection");
            self.state.sync.set_selected_cases(rules.case_keys.clone());
            return Ok(rules.case_keys);
        }

        for key in &self.config.test_case_keys {
            if !collected.contains(key) {
                collected.push(key.clone());
            }
        }

        let test_cases = match run_cases {
            Some(run_cases) => run_cases,
            None if self.items.is_empty() => collected.clone(),
            None => {
                let mut keys = projects.clone();
                keys.push(DEFAULT_PROJECT.to_string());
                let search = format!("projectKey IN (\"{}\")", keys.join("\", \""));
                self.remote()
                    .get_cases(&search)?
                    .into_iter()
                    .map(|case| case.key)
                    .collect()
            }
        };

        let order = if !self.config.test_case_order.is_empty() {
            self.config.test_case_order.clone()
        } else if self.config.test_run_key.is_some() {
            test_cases.clone()
        } else {
            self.config.test_case_keys.clone()
        };

        let mut selected = collected.clone();
        if !order.is_empty() || !self.config.test_case_range.is_empty() {
            let ordered = order_cases(&collected, &order);
            let (kept, excluded) = apply_case_range(&ordered, &self.config.test_case_range);
            for (item, case) in self.items.iter_mut().zip(&item_cases) {
                if let Some(case) = case
                    && excluded.contains(case)
                    && !item.meta.markers.has_skip()
                {
                    item.meta.markers.method.push(Marker::Skip {
                        reason: SKIPPED_AS_REQUESTED.to_string(),
                    });
                }
            }
            self.reorder(&item_cases, &ordered);
            selected = kept;
        }

        let selected = intersection(&selected, &test_cases);
        info!(selected = selected.len(), "selected test cases");
        self.state.sync.set_selected_cases(selected.clone());
        Ok(selected)
    }

    /// Move items into the order of their cases; items without a case keep their place at the end.
    fn reorder(&mut self, item_cases: &[Option<String>], ordered: &[String]) {
        let mut items: Vec<(Option<usize>, TestItem<R>)> = item_cases
            .iter()
            .zip(self.items.drain(..))
            .map(|(case, item)| {
                let rank = case
                    .as_ref()
                    .and_then(|case| ordered.iter().position(|key| key == case));
                (rank, item)
            })
            .collect();
        items.sort_by_key(|(rank, _)| rank.unwrap_or(usize::MAX));
        self.items = items.into_iter().map(|(_, item)| item).collect();
    }

    /// Collect, resolve the run and execute every item in order.
    ///
    /// A remote-call failure stops the session with an error; nothing is retried.
    #[instrument(skip_all)]
    pub fn run(&mut self) -> Result<SessionSummary> {
        let selected = self.collect()?;

        if self.state.enabled {
            let (remote, tokens) = self.state.sync.remote_and_tokens();
            let resolution = self.coordinator.resolve(remote, &selected, tokens)?;
            self.coordinator.ensure_environment(
                self.state.sync.remote(),
                resolution.run_key.as_deref(),
                &selected,
            )?;
            self.state
                .sync
                .set_environment(self.coordinator.settings().test_environment.clone());
            self.state.sync.set_run_key(resolution.run_key.clone());
            info!(run_key = ?resolution.run_key, plan_key = ?resolution.plan_key, "reporting session");
        }

        let items = std::mem::take(&mut self.items);
        let mut reports = Vec::with_capacity(items.len());
        for item in items {
            reports.push(self.run_item(item)?);
            if let Some((exit_code, reason)) = &self.state.control.terminate {
                warn!(exit_code, reason = %reason, "session terminated");
                break;
            }
        }

        let exit_code = match &self.state.control.terminate {
            Some((exit_code, _)) => *exit_code,
            None if reports.is_empty() => exit_codes::NO_TESTS,
            None if reports.iter().any(|report| report.outcome == Outcome::Failed) => {
                exit_codes::TESTS_FAILED
            }
            None => exit_codes::OK,
        };

        let targets = ReportTargets {
            project_key: self.config.project_key.clone(),
            test_plan_key: self.coordinator.settings().test_plan_key.clone(),
            test_run_keys: self
                .state
                .sync
                .run_key()
                .map(|key| vec![key.to_string()])
                .unwrap_or_default(),
        };
        let verdict = evaluate(&reports, exit_code);
        info!("{}", status_line(&verdict, &targets, exit_code));
        let summary = SessionSummary {
            exit_code,
            reports,
            targets,
        };
        if let Some(path) = &self.report_path {
            write_session_report(path, &summary.clone().into())?;
        }
        Ok(summary)
    }

    /// Set up, execute and report one item.
    fn run_item(&mut self, item: TestItem<R>) -> Result<ItemReport> {
        let TestItem { meta, body } = item;
        let started = Instant::now();
        let fullname = meta.fullname.clone();
        debug!(item = %fullname, "running item");

        if let Some(reason) = self.state.control.block_remaining.clone() {
            let record = self.state.registry.entry(&fullname);
            record.blocked = Some(true);
            record.comment = reason;
        }
        let dynamic_block = self
            .state
            .registry
            .get(&fullname)
            .filter(|record| record.is_blocked())
            .map(|record| record.comment.clone());

        let (skip, passed, unexpected) = match resolve_setup(&meta.markers, dynamic_block.as_deref())
        {
            Err(message) => {
                self.state
                    .registry
                    .entry(&fullname)
                    .append_comment(&html_row(Badge::Failed, &message));
                (None, false, true)
            }
            Ok(Some(skip)) => (Some(skip), false, false),
            Ok(None) => {
                let options = self.state.block_options.clone();
                let report = MetaBlock::enter(&mut self.state, &meta, None, options).run(body);
                let unexpected = match report.escaped {
                    Some(interrupt) if interrupt.is_transport() => {
                        let err = interrupt
                            .into_transport()
                            .unwrap_or_else(|| anyhow!("transport failure"));
                        return Err(err.context(format!("reporting {fullname}")));
                    }
                    Some(interrupt) => interrupt.is_unexpected(),
                    None => false,
                };
                (report.skip, report.passed, unexpected)
            }
        };

        let outcome = match &skip {
            Some(status) if status.is_block() => Outcome::Blocked,
            Some(_) => Outcome::Skipped,
            None if passed => Outcome::Passed,
            None => Outcome::Failed,
        };
        let elapsed = started.elapsed();

        let report = self.item_report(&meta, skip.as_ref(), outcome, unexpected, elapsed.as_secs_f64())?;

        if self.state.enabled
            && let Some(marker) = &meta.testcase
        {
            let specs = meta.spec();
            let state = &mut self.state;
            let empty = ItemRecord::default();
            let record = state.registry.get(&fullname).unwrap_or(&empty);
            state
                .sync
                .publish(&Publication {
                    case_key: &marker.test_case_key,
                    step: marker.test_step_key,
                    elapsed,
                    skip: skip.as_ref(),
                    passed,
                    record,
                    specs: &specs,
                })
                .with_context(|| format!("reporting {fullname}"))?;
        }

        debug!(item = %fullname, outcome = outcome.as_str(), "item finished");
        Ok(report)
    }

    fn item_report(
        &self,
        meta: &ItemMetadata,
        skip: Option<&SkipStatus>,
        outcome: Outcome,
        unexpected: bool,
        duration_secs: f64,
    ) -> Result<ItemReport> {
        let record = self.state.registry.get(&meta.fullname);
        let mut details = match skip {
            Some(skip) if !skip.reason.is_empty() => skip.reason.clone(),
            _ => record.map(|record| record.comment.clone()).unwrap_or_default(),
        };

        let case_key = meta.testcase.as_ref().map(|marker| marker.test_case_key.clone());
        let (mut name, mut priority) = (None, None);
        if let Some(case_key) = &case_key {
            if self.state.enabled && self.state.sync.is_selected(case_key) {
                let info = self.remote().get_case(case_key)?;
                name = info.as_ref().and_then(|info| info.name.clone());
                priority = info.and_then(|info| info.priority);
            }
            if skip.is_none() {
                for (key, sub) in self.state.registry.sub_records(&meta.fullname) {
                    let blocked = if sub.is_blocked() { " blocked" } else { "" };
                    details = format!("{details}<br>{key}{blocked}:<br>{}", sub.comment);
                }
            }
        }

        Ok(ItemReport {
            key: meta.fullname.clone(),
            test_case_key: case_key,
            test_case_name: name,
            priority,
            outcome,
            duration_secs,
            details,
            unexpected_exception: unexpected,
        })
    }
}

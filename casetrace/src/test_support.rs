//! Test-only helpers: an in-memory test-management service and item builders.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};

use crate::core::status::Status;
use crate::core::types::{Attachment, ItemMetadata, Outcome, StepOutcome};
use crate::io::ci::CiInfo;
use crate::io::config::ReporterConfig;
use crate::io::remote::{
    CaseInfo, CaseUpdate, NewPlan, NewResult, NewRun, PlanInfo, ResultUpdate, RunInfo,
    ScriptUpdate, TestManagement, TestResult,
};
use crate::meta_block::CheckObserver;

/// Uploaded attachment as seen by the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub run_key: String,
    pub case_key: String,
    /// `None` for case-level uploads.
    pub step: Option<u32>,
    pub filename: String,
}

#[derive(Debug, Default)]
struct RemoteState {
    /// Case key to (info, number of steps).
    cases: BTreeMap<String, (CaseInfo, u32)>,
    results: BTreeMap<(String, String), TestResult>,
    runs: BTreeMap<String, RunInfo>,
    plans: Vec<(String, PlanInfo)>,
    environments: BTreeMap<String, Vec<String>>,
    calls: Vec<String>,
    created_results: Vec<NewResult>,
    result_updates: Vec<ResultUpdate>,
    script_updates: Vec<ScriptUpdate>,
    case_updates: Vec<(String, CaseUpdate)>,
    created_runs: Vec<NewRun>,
    plan_links: Vec<(String, Vec<String>)>,
    uploads: Vec<Upload>,
    fail_on: Option<String>,
}

/// In-memory remote recording every call.
///
/// Clones share state, so a test can keep a handle after moving one into a session.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTestManagement {
    state: Rc<RefCell<RemoteState>>,
}

impl InMemoryTestManagement {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a test case with `steps` steps.
    pub fn with_case(self, key: &str, steps: u32, priority: Option<&str>) -> Self {
        self.state.borrow_mut().cases.insert(
            key.to_string(),
            (
                CaseInfo {
                    key: key.to_string(),
                    name: Some(format!("{key} name")),
                    priority: priority.map(str::to_string),
                },
                steps,
            ),
        );
        self
    }

    /// Register an existing run containing `case_keys`.
    pub fn with_run(self, key: &str, name: &str, project_key: &str, case_keys: &[&str]) -> Self {
        self.state.borrow_mut().runs.insert(
            key.to_string(),
            RunInfo {
                key: key.to_string(),
                name: name.to_string(),
                project_key: Some(project_key.to_string()),
                case_keys: case_keys.iter().map(|key| key.to_string()).collect(),
            },
        );
        self
    }

    pub fn with_plan(self, key: &str, name: &str, project_key: &str) -> Self {
        self.state.borrow_mut().plans.push((
            project_key.to_string(),
            PlanInfo {
                key: key.to_string(),
                name: name.to_string(),
            },
        ));
        self
    }

    pub fn with_environment(self, project_key: &str, name: &str) -> Self {
        self.state
            .borrow_mut()
            .environments
            .entry(project_key.to_string())
            .or_default()
            .push(name.to_string());
        self
    }

    /// Make every call of method `method` fail with a transport error.
    pub fn failing_on(self, method: &str) -> Self {
        self.state.borrow_mut().fail_on = Some(method.to_string());
        self
    }

    /// Store a result directly, e.g. one left over from an earlier session.
    pub fn seed_result(&self, run_key: &str, case_key: &str, result: TestResult) {
        self.state
            .borrow_mut()
            .results
            .insert((run_key.to_string(), case_key.to_string()), result);
    }

    pub fn result(&self, run_key: &str, case_key: &str) -> Option<TestResult> {
        self.state
            .borrow()
            .results
            .get(&(run_key.to_string(), case_key.to_string()))
            .cloned()
    }

    /// Status of 1-based `step` of a stored result.
    pub fn step_status(&self, run_key: &str, case_key: &str, step: u32) -> Option<Status> {
        self.result(run_key, case_key)
            .and_then(|result| result.script_result(step).map(|outcome| outcome.status))
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.borrow().calls.clone()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.state
            .borrow()
            .calls
            .iter()
            .filter(|call| call.as_str() == method)
            .count()
    }

    pub fn created_results(&self) -> Vec<NewResult> {
        self.state.borrow().created_results.clone()
    }

    pub fn result_updates(&self) -> Vec<ResultUpdate> {
        self.state.borrow().result_updates.clone()
    }

    pub fn script_updates(&self) -> Vec<ScriptUpdate> {
        self.state.borrow().script_updates.clone()
    }

    pub fn case_updates(&self) -> Vec<(String, CaseUpdate)> {
        self.state.borrow().case_updates.clone()
    }

    pub fn created_runs(&self) -> Vec<NewRun> {
        self.state.borrow().created_runs.clone()
    }

    pub fn plan_links(&self) -> Vec<(String, Vec<String>)> {
        self.state.borrow().plan_links.clone()
    }

    pub fn plans(&self) -> Vec<PlanInfo> {
        self.state
            .borrow()
            .plans
            .iter()
            .map(|(_, plan)| plan.clone())
            .collect()
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.state.borrow().uploads.clone()
    }

    pub fn environments(&self, project_key: &str) -> Vec<String> {
        self.state
            .borrow()
            .environments
            .get(project_key)
            .cloned()
            .unwrap_or_default()
    }

    fn record(&self, method: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(method.to_string());
        if state.fail_on.as_deref() == Some(method) {
            bail!("{method}: connection refused");
        }
        Ok(())
    }

    fn fresh_result(state: &RemoteState, case_key: &str) -> TestResult {
        let steps = state.cases.get(case_key).map_or(0, |(_, steps)| *steps);
        TestResult {
            status: Status::NotExecuted,
            comment: String::new(),
            script_results: (0..steps)
                .map(|index| StepOutcome {
                    index,
                    status: Status::NotExecuted,
                    comment: String::new(),
                })
                .collect(),
        }
    }
}

/// Project keys quoted in a search such as `projectKey IN ("A", "B")`.
fn quoted_projects(search: &str) -> Vec<&str> {
    search.split('"').skip(1).step_by(2).collect()
}

impl TestManagement for InMemoryTestManagement {
    fn get_result(&self, run_key: &str, case_key: &str) -> Result<Option<TestResult>> {
        self.record("get_result")?;
        Ok(self.result(run_key, case_key))
    }

    fn create_result(&self, request: &NewResult) -> Result<()> {
        self.record("create_result")?;
        let mut state = self.state.borrow_mut();
        let result = Self::fresh_result(&state, &request.case_key);
        state.results.insert(
            (request.run_key.clone(), request.case_key.clone()),
            result,
        );
        if let Some(run) = state.runs.get_mut(&request.run_key)
            && !run.case_keys.contains(&request.case_key)
        {
            run.case_keys.push(request.case_key.clone());
        }
        state.created_results.push(request.clone());
        Ok(())
    }

    fn edit_result_status(&self, update: &ResultUpdate) -> Result<()> {
        self.record("edit_result_status")?;
        let mut state = self.state.borrow_mut();
        let result = state
            .results
            .get_mut(&(update.run_key.clone(), update.case_key.clone()))
            .ok_or_else(|| anyhow!("no result for {}", update.case_key))?;
        result.status = update.status;
        if let Some(comment) = &update.comment {
            result.comment = comment.clone();
        }
        state.result_updates.push(update.clone());
        Ok(())
    }

    fn edit_script_status(&self, update: &ScriptUpdate) -> Result<()> {
        self.record("edit_script_status")?;
        let mut state = self.state.borrow_mut();
        let result = state
            .results
            .get_mut(&(update.run_key.clone(), update.case_key.clone()))
            .ok_or_else(|| anyhow!("no result for {}", update.case_key))?;
        let index = update.step - 1;
        if !result.script_results.iter().any(|outcome| outcome.index == index) {
            result.script_results.push(StepOutcome {
                index,
                status: Status::NotExecuted,
                comment: String::new(),
            });
        }
        for outcome in &mut result.script_results {
            if outcome.index == index {
                outcome.status = update.status;
                if let Some(comment) = &update.comment {
                    outcome.comment = comment.clone();
                }
            }
        }
        state.script_updates.push(update.clone());
        Ok(())
    }

    fn add_result_attachment(
        &self,
        run_key: &str,
        case_key: &str,
        attachment: &Attachment,
    ) -> Result<()> {
        self.record("add_result_attachment")?;
        self.state.borrow_mut().uploads.push(Upload {
            run_key: run_key.to_string(),
            case_key: case_key.to_string(),
            step: None,
            filename: attachment.filename.clone(),
        });
        Ok(())
    }

    fn add_script_attachment(
        &self,
        run_key: &str,
        case_key: &str,
        step: u32,
        attachment: &Attachment,
    ) -> Result<()> {
        self.record("add_script_attachment")?;
        self.state.borrow_mut().uploads.push(Upload {
            run_key: run_key.to_string(),
            case_key: case_key.to_string(),
            step: Some(step),
            filename: attachment.filename.clone(),
        });
        Ok(())
    }

    fn get_case(&self, case_key: &str) -> Result<Option<CaseInfo>> {
        self.record("get_case")?;
        Ok(self
            .state
            .borrow()
            .cases
            .get(case_key)
            .map(|(info, _)| info.clone()))
    }

    fn edit_case(&self, case_key: &str, update: &CaseUpdate) -> Result<()> {
        self.record("edit_case")?;
        self.state
            .borrow_mut()
            .case_updates
            .push((case_key.to_string(), update.clone()));
        Ok(())
    }

    fn get_cases(&self, search: &str) -> Result<Vec<CaseInfo>> {
        self.record("get_cases")?;
        let projects = quoted_projects(search);
        Ok(self
            .state
            .borrow()
            .cases
            .values()
            .filter(|(info, _)| {
                projects
                    .iter()
                    .any(|project| info.key.starts_with(&format!("{project}-")))
            })
            .map(|(info, _)| info.clone())
            .collect())
    }

    fn get_run(&self, run_key: &str) -> Result<Option<RunInfo>> {
        self.record("get_run")?;
        Ok(self.state.borrow().runs.get(run_key).cloned())
    }

    fn get_run_by_name(&self, name: &str) -> Result<Option<RunInfo>> {
        self.record("get_run_by_name")?;
        Ok(self
            .state
            .borrow()
            .runs
            .values()
            .find(|run| run.name == name)
            .cloned())
    }

    fn create_run(&self, request: &NewRun) -> Result<String> {
        self.record("create_run")?;
        let mut state = self.state.borrow_mut();
        let key = format!("{}-C{}", request.project_key, state.runs.len() + 1);
        for case_key in &request.case_keys {
            let result = Self::fresh_result(&state, case_key);
            state
                .results
                .insert((key.clone(), case_key.clone()), result);
        }
        state.runs.insert(
            key.clone(),
            RunInfo {
                key: key.clone(),
                name: request.name.clone(),
                project_key: Some(request.project_key.clone()),
                case_keys: request.case_keys.clone(),
            },
        );
        state.created_runs.push(request.clone());
        Ok(key)
    }

    fn get_plans(&self, search: &str) -> Result<Vec<PlanInfo>> {
        self.record("get_plans")?;
        let projects = quoted_projects(search);
        Ok(self
            .state
            .borrow()
            .plans
            .iter()
            .filter(|(project, _)| projects.contains(&project.as_str()))
            .map(|(_, plan)| plan.clone())
            .collect())
    }

    fn get_plan(&self, plan_key: &str) -> Result<Option<PlanInfo>> {
        self.record("get_plan")?;
        Ok(self
            .state
            .borrow()
            .plans
            .iter()
            .find(|(_, plan)| plan.key == plan_key)
            .map(|(_, plan)| plan.clone()))
    }

    fn create_plan(&self, request: &NewPlan) -> Result<String> {
        self.record("create_plan")?;
        let mut state = self.state.borrow_mut();
        let key = format!("{}-P{}", request.project_key, state.plans.len() + 1);
        state.plans.push((
            request.project_key.clone(),
            PlanInfo {
                key: key.clone(),
                name: request.name.clone(),
            },
        ));
        Ok(key)
    }

    fn edit_plan(&self, plan_key: &str, run_keys: &[String]) -> Result<()> {
        self.record("edit_plan")?;
        self.state
            .borrow_mut()
            .plan_links
            .push((plan_key.to_string(), run_keys.to_vec()));
        Ok(())
    }

    fn get_environments(&self, project_key: &str) -> Result<Vec<String>> {
        self.record("get_environments")?;
        Ok(self.environments(project_key))
    }

    fn create_environment(&self, project_key: &str, name: &str) -> Result<()> {
        self.record("create_environment")?;
        self.state
            .borrow_mut()
            .environments
            .entry(project_key.to_string())
            .or_default()
            .push(name.to_string());
        Ok(())
    }
}

/// Observer recording every notification; clones share the log.
#[derive(Debug, Clone, Default)]
pub struct RecordingObserver {
    checks: Rc<RefCell<Vec<(String, bool, String)>>>,
    blocks: Rc<RefCell<Vec<(String, Outcome)>>>,
}

impl RecordingObserver {
    pub fn checks(&self) -> Vec<(String, bool, String)> {
        self.checks.borrow().clone()
    }

    pub fn blocks(&self) -> Vec<(String, Outcome)> {
        self.blocks.borrow().clone()
    }
}

impl CheckObserver for RecordingObserver {
    fn on_check(&mut self, signature: &str, condition: bool, reference: &str) {
        self.checks
            .borrow_mut()
            .push((signature.to_string(), condition, reference.to_string()));
    }

    fn on_block(&mut self, signature: &str, outcome: Outcome) {
        self.blocks
            .borrow_mut()
            .push((signature.to_string(), outcome));
    }
}

/// Item metadata for a test function `name` defined in `tests/suite.rs`.
pub fn item(name: &str) -> ItemMetadata {
    ItemMetadata::new(name, format!("tests/suite.rs::{name}"))
}

/// Enabled reporter configuration for `project_key` with a fixed run suffix.
pub fn reporting_config(project_key: &str) -> ReporterConfig {
    ReporterConfig {
        enabled: true,
        project_key: Some(project_key.to_string()),
        test_run_suffix: Some("nightly".to_string()),
        run_wait_poll_ms: 10,
        run_wait_timeout_secs: 1,
        ..ReporterConfig::default()
    }
}

/// CI metadata of a local developer run.
pub fn local_ci() -> CiInfo {
    CiInfo {
        user: "tester".to_string(),
        ..CiInfo::default()
    }
}

/// Short duration used for timeouts in tests.
pub fn short_timeout() -> Duration {
    Duration::from_millis(50)
}

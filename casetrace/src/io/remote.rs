//! Remote test-management capability.
//!
//! The [`TestManagement`] trait decouples reporting from the HTTP client of a
//! concrete service. The step controller and report synchronizer only decide
//! what to send and when; tests use an in-memory implementation that records
//! every call.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::core::status::Status;
use crate::core::types::{Attachment, StepOutcome};

/// Remote result of one test case inside a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub status: Status,
    pub comment: String,
    pub script_results: Vec<StepOutcome>,
}

impl TestResult {
    /// Step result stored for 1-based `step`.
    pub fn script_result(&self, step: u32) -> Option<&StepOutcome> {
        self.script_results
            .iter()
            .find(|result| result.index + 1 == step)
    }
}

/// Parameters for creating a fresh result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewResult {
    pub run_key: String,
    pub case_key: String,
    pub environment: Option<String>,
    pub executor: String,
    pub assignee: String,
}

/// Case-level status transition.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultUpdate {
    pub run_key: String,
    pub case_key: String,
    pub environment: Option<String>,
    pub status: Status,
    /// `None` leaves the remote comment untouched.
    pub comment: Option<String>,
    pub execute_time: Duration,
    pub executor: String,
    pub assignee: String,
}

/// Step-level status transition. `step` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptUpdate {
    pub run_key: String,
    pub case_key: String,
    pub step: u32,
    pub environment: Option<String>,
    pub status: Status,
    /// `None` leaves the remote step comment untouched.
    pub comment: Option<String>,
    pub executor: String,
    pub assignee: String,
}

/// CI traceability fields pushed onto a test case.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CaseUpdate {
    pub labels: Vec<String>,
    pub build_urls: Vec<String>,
    pub code_bases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CaseInfo {
    pub key: String,
    pub name: Option<String>,
    pub priority: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunInfo {
    pub key: String,
    pub name: String,
    pub project_key: Option<String>,
    /// Test case keys contained in the run.
    pub case_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRun {
    pub project_key: String,
    pub plan_key: Option<String>,
    pub name: String,
    pub case_keys: Vec<String>,
    pub folder: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlanInfo {
    pub key: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPlan {
    pub project_key: String,
    pub name: String,
    pub folder: Option<String>,
}

/// Abstraction over the remote test-management service.
///
/// Errors are transport failures; callers propagate them without retrying.
pub trait TestManagement {
    fn get_result(&self, run_key: &str, case_key: &str) -> Result<Option<TestResult>>;
    fn create_result(&self, request: &NewResult) -> Result<()>;
    fn edit_result_status(&self, update: &ResultUpdate) -> Result<()>;
    fn edit_script_status(&self, update: &ScriptUpdate) -> Result<()>;
    fn add_result_attachment(
        &self,
        run_key: &str,
        case_key: &str,
        attachment: &Attachment,
    ) -> Result<()>;
    fn add_script_attachment(
        &self,
        run_key: &str,
        case_key: &str,
        step: u32,
        attachment: &Attachment,
    ) -> Result<()>;

    fn get_case(&self, case_key: &str) -> Result<Option<CaseInfo>>;
    fn edit_case(&self, case_key: &str, update: &CaseUpdate) -> Result<()>;
    /// Case search, e.g. `projectKey IN ("PRJ", "TEST")`.
    fn get_cases(&self, search: &str) -> Result<Vec<CaseInfo>>;

    fn get_run(&self, run_key: &str) -> Result<Option<RunInfo>>;
    fn get_run_by_name(&self, name: &str) -> Result<Option<RunInfo>>;
    /// Create a run and return its key.
    fn create_run(&self, request: &NewRun) -> Result<String>;

    /// Plans matching a search, e.g. `projectKey = "PRJ"`.
    fn get_plans(&self, search: &str) -> Result<Vec<PlanInfo>>;
    fn get_plan(&self, plan_key: &str) -> Result<Option<PlanInfo>>;
    /// Create a plan and return its key.
    fn create_plan(&self, request: &NewPlan) -> Result<String>;
    /// Link runs to a plan.
    fn edit_plan(&self, plan_key: &str, run_keys: &[String]) -> Result<()>;

    /// Environment names known for a project.
    fn get_environments(&self, project_key: &str) -> Result<Vec<String>>;
    fn create_environment(&self, project_key: &str, name: &str) -> Result<()>;
}

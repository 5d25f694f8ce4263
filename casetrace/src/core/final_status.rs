//! Per-item reports and the overall session verdict consumed by CI pipelines.

use serde::{Deserialize, Serialize};

use crate::core::types::Outcome;
use crate::exit_codes;

pub const PRIORITY_HIGH: &str = "High";

/// Local summary of one executed item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemReport {
    /// Item identity (fullname).
    pub key: String,
    pub test_case_key: Option<String>,
    pub test_case_name: Option<String>,
    pub priority: Option<String>,
    pub outcome: Outcome,
    pub duration_secs: f64,
    /// Item comment, block/skip reason and step sub-record notes.
    pub details: String,
    /// Set when the item ended with an error other than a check or block/skip.
    pub unexpected_exception: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalStatus {
    Failure,
    Unstable,
    Aborted,
    NotBuilt,
    Success,
}

impl FinalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FinalStatus::Failure => "FAILURE",
            FinalStatus::Unstable => "UNSTABLE",
            FinalStatus::Aborted => "ABORTED",
            FinalStatus::NotBuilt => "NOT_BUILT",
            FinalStatus::Success => "SUCCESS",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub status: FinalStatus,
    pub high_prios_failed: usize,
    pub exceptions_raised: usize,
}

/// Fold item reports and the session exit code into a verdict.
pub fn evaluate(reports: &[ItemReport], exit_code: i32) -> Verdict {
    let exceptions_raised = reports.iter().filter(|r| r.unexpected_exception).count();
    let high_prios_failed = reports
        .iter()
        .filter(|r| r.outcome == Outcome::Failed && r.priority.as_deref() == Some(PRIORITY_HIGH))
        .count();
    let not_built = reports
        .iter()
        .all(|r| !matches!(r.outcome, Outcome::Passed | Outcome::Failed));

    let status = if exceptions_raised > 0
        || high_prios_failed > 0
        || exit_code == exit_codes::INTERNAL_ERROR
        || exit_code == exit_codes::USAGE_ERROR
    {
        FinalStatus::Failure
    } else if exit_code == exit_codes::TESTS_FAILED {
        FinalStatus::Unstable
    } else if exit_code == exit_codes::INTERRUPTED {
        FinalStatus::Aborted
    } else if exit_code == exit_codes::NO_TESTS || not_built {
        FinalStatus::NotBuilt
    } else {
        FinalStatus::Success
    };

    Verdict {
        status,
        high_prios_failed,
        exceptions_raised,
    }
}

/// Remote keys the session reported to; printed in the final status line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportTargets {
    pub project_key: Option<String>,
    pub test_plan_key: Option<String>,
    pub test_run_keys: Vec<String>,
}

/// `final_status (<STATUS>): <project>, <plan>, <runs>, ...` line.
pub fn status_line(verdict: &Verdict, targets: &ReportTargets, exit_code: i32) -> String {
    let runs = if targets.test_run_keys.is_empty() {
        "None".to_string()
    } else {
        targets.test_run_keys.join(", ")
    };
    format!(
        "final_status ({}): {}, {}, {}, {} high prio tc(s) failed, {} exception(s) raised, exitstatus={}",
        verdict.status.as_str(),
        targets.project_key.as_deref().unwrap_or("None"),
        targets.test_plan_key.as_deref().unwrap_or("None"),
        runs,
        verdict.high_prios_failed,
        verdict.exceptions_raised,
        exit_code
    )
}

//! Shared deterministic types for step control and reporting.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use serde::{Deserialize, Serialize};

use crate::core::markers::Markers;
use crate::core::status::Status;
use crate::exit_codes;

/// Result of one executed step as stored remotely.
///
/// `index` is zero-based; step `n` of a test case lives at index `n - 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub index: u32,
    pub status: Status,
    pub comment: String,
}

/// Policy applied when a checked condition does not hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// Record a soft failure, mark the block failed and keep executing.
    #[default]
    FailContext,
    /// Skip the rest of this block, mark it blocked, continue with the next block.
    StopContext,
    /// Skip the rest of the test method and mark it failed.
    FailMethod,
    /// Skip the rest of the test method and mark it blocked.
    StopMethod,
    /// Fail the test method and block every item that has not started yet.
    FailSession,
    /// Block the test method and every item that has not started yet.
    StopSession,
    /// Block the test method and end the session (tests failed exit code).
    StopExitSession,
    /// Block the test method and end the session (interrupted exit code).
    FailExitSession,
}

impl Action {
    /// Control-flow command the step controller executes for this policy.
    pub fn directive(self) -> Directive {
        match self {
            Action::FailContext => Directive::Continue,
            Action::StopContext => Directive::AbortStep,
            Action::FailMethod => Directive::AbortMethod { blocked: false },
            Action::StopMethod => Directive::AbortMethod { blocked: true },
            Action::FailSession => Directive::AbortSessionAsFailed,
            Action::StopSession => Directive::AbortSessionAsBlocked,
            Action::StopExitSession => Directive::TerminateSession {
                exit_code: exit_codes::TESTS_FAILED,
            },
            Action::FailExitSession => Directive::TerminateSession {
                exit_code: exit_codes::INTERRUPTED,
            },
        }
    }
}

/// Tagged control-flow command produced by a failed check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Continue,
    AbortStep,
    AbortMethod { blocked: bool },
    AbortSessionAsBlocked,
    AbortSessionAsFailed,
    TerminateSession { exit_code: i32 },
}

/// Local outcome of a block or test item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Passed,
    Failed,
    Skipped,
    Blocked,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Passed => "passed",
            Outcome::Failed => "failed",
            Outcome::Skipped => "skipped",
            Outcome::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipKind {
    Block,
    Skip,
}

/// Block or skip decision attached to a reported result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipStatus {
    pub kind: SkipKind,
    pub reason: String,
}

impl SkipStatus {
    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            kind: SkipKind::Block,
            reason: reason.into(),
        }
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        Self {
            kind: SkipKind::Skip,
            reason: reason.into(),
        }
    }

    pub fn is_block(&self) -> bool {
        self.kind == SkipKind::Block
    }
}

/// Binary content queued for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub content: Vec<u8>,
    pub filename: String,
    /// Step the attachment belongs to, 0 for the test case itself.
    pub step: u32,
}

/// Typed metadata of one collected test item.
///
/// Populated once at collection time and passed explicitly into the step
/// controller instead of being looked up from runner internals.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ItemMetadata {
    /// Function name, including the parameterization suffix (e.g. `test_T1[a]`).
    pub name: String,
    /// Stable identity derived from source location (e.g. `tests/login.rs::test_T1[a]`).
    pub fullname: String,
    /// Explicit test-case marker given by the author (project-less `T1` or full `PRJ-T1`).
    pub marker_case_key: Option<String>,
    /// Explicit step marker given by the author.
    pub marker_step_key: Option<u32>,
    /// Explicit project marker (method or class level).
    pub project_key: Option<String>,
    /// Project attribute of the enclosing class, if any.
    pub class_project_key: Option<String>,
    /// Static block/skip markers.
    pub markers: Markers,
    /// Reporting marker assigned at collection: `(project, PRJ-T<n>, step)`.
    pub testcase: Option<TestCaseMarker>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCaseMarker {
    pub project_key: String,
    pub test_case_key: String,
    pub test_step_key: Option<u32>,
}

impl ItemMetadata {
    pub fn new(name: impl Into<String>, fullname: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fullname: fullname.into(),
            ..Self::default()
        }
    }

    /// Parameterization suffix of this item (`[...]` part of the fullname).
    pub fn spec(&self) -> String {
        crate::core::selection::param_suffix(&self.fullname)
    }
}

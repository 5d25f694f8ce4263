//! Report synchronizer: pushes step and case results to the remote service.
//!
//! A remote result is reused only while its refresh token matches the active
//! run; otherwise a fresh result is created first. Step publishes recompute
//! the case aggregate from all step results through the status lattice and
//! merge a short note into the case comment without duplicating it.

use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, info, instrument};

use crate::core::comment::{
    Badge, compose, html_row, insert_note, parameterization_preamble, session_header, step_note,
};
use crate::core::refresh::RefreshTokens;
use crate::core::registry::ItemRecord;
use crate::core::status::{Status, merge};
use crate::core::types::{SkipKind, SkipStatus};
use crate::io::ci::CiInfo;
use crate::io::remote::{NewResult, ResultUpdate, ScriptUpdate, TestManagement, TestResult};

/// One result to publish.
#[derive(Debug, Clone, Copy)]
pub struct Publication<'a> {
    pub case_key: &'a str,
    /// 1-based step, or `None` for the case itself.
    pub step: Option<u32>,
    pub elapsed: Duration,
    pub skip: Option<&'a SkipStatus>,
    pub passed: bool,
    pub record: &'a ItemRecord,
    /// Parameterization suffix of the item (`[...]`), empty if not parameterized.
    pub specs: &'a str,
}

/// Publishes results of one session into its active run.
#[derive(Debug)]
pub struct ReportSync<R> {
    remote: R,
    run_key: Option<String>,
    selected: Vec<String>,
    environment: Option<String>,
    ci: CiInfo,
    tokens: RefreshTokens,
}

impl<R: TestManagement> ReportSync<R> {
    pub fn new(remote: R, ci: CiInfo) -> Self {
        Self {
            remote,
            run_key: None,
            selected: Vec::new(),
            environment: None,
            ci,
            tokens: RefreshTokens::new(),
        }
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn ci(&self) -> &CiInfo {
        &self.ci
    }

    pub fn run_key(&self) -> Option<&str> {
        self.run_key.as_deref()
    }

    pub fn set_run_key(&mut self, run_key: Option<String>) {
        self.run_key = run_key;
    }

    pub fn selected_cases(&self) -> &[String] {
        &self.selected
    }

    pub fn set_selected_cases(&mut self, case_keys: Vec<String>) {
        self.selected = case_keys;
    }

    pub fn is_selected(&self, case_key: &str) -> bool {
        self.selected.iter().any(|key| key == case_key)
    }

    pub fn environment(&self) -> Option<&str> {
        self.environment.as_deref()
    }

    pub fn set_environment(&mut self, environment: Option<String>) {
        self.environment = environment;
    }

    pub fn tokens(&self) -> &RefreshTokens {
        &self.tokens
    }

    pub fn tokens_mut(&mut self) -> &mut RefreshTokens {
        &mut self.tokens
    }

    /// Remote and refresh tokens at once, for run resolution.
    pub fn remote_and_tokens(&mut self) -> (&R, &mut RefreshTokens) {
        (&self.remote, &mut self.tokens)
    }

    /// Push one step or case result. Transport errors propagate unchanged.
    #[instrument(skip_all, fields(case_key = publication.case_key, step = ?publication.step))]
    pub fn publish(&mut self, publication: &Publication<'_>) -> Result<()> {
        let Some(run_key) = self.run_key.clone() else {
            debug!("no active run, skipping publish");
            return Ok(());
        };
        if !self.is_selected(publication.case_key) {
            debug!("case not selected, skipping publish");
            return Ok(());
        }

        let result = self.fresh_result(&run_key, publication.case_key, publication.specs)?;

        let header = if publication.specs.is_empty() {
            String::new()
        } else {
            session_header(&chrono::Local::now().format("%Y-%m-%d %H:%M").to_string())
        };
        let preamble = parameterization_preamble(&header, publication.specs);

        if publication.skip.is_none() && publication.step.is_none() {
            self.remote
                .edit_case(publication.case_key, &self.ci.case_update())?;
        }

        match publication.step {
            Some(step) => self.publish_step(&run_key, publication, step, &result, &preamble),
            None => self.publish_case(&run_key, publication, &result, &preamble),
        }
    }

    /// Fetch the result of `case_key`, creating a fresh one unless this run already touched it.
    fn fresh_result(&mut self, run_key: &str, case_key: &str, specs: &str) -> Result<TestResult> {
        let token_key = format!("{case_key}{specs}");
        let mut result = self.remote.get_result(run_key, case_key)?;
        if result.is_none() || !self.tokens.is_current(&token_key, run_key) {
            info!(run_key, case_key, "creating fresh test result");
            self.remote.create_result(&NewResult {
                run_key: run_key.to_string(),
                case_key: case_key.to_string(),
                environment: self.environment.clone(),
                executor: self.ci.user.clone(),
                assignee: self.ci.user.clone(),
            })?;
            result = self.remote.get_result(run_key, case_key)?;
            self.tokens.touch(&token_key, run_key);
        }
        self.tokens.touch_related(case_key, run_key);
        result.ok_or_else(|| anyhow!("no test result for {case_key} in run {run_key}"))
    }

    fn publish_step(
        &self,
        run_key: &str,
        publication: &Publication<'_>,
        step: u32,
        result: &TestResult,
        preamble: &str,
    ) -> Result<()> {
        let last = result.script_result(step);
        let last_failed = last.is_some_and(|outcome| outcome.status == Status::Fail);

        let status = match publication.skip {
            Some(skip) if !last_failed => match skip.kind {
                SkipKind::Block => Status::Blocked,
                SkipKind::Skip => Status::NotExecuted,
            },
            _ if publication.passed && !last_failed => Status::Pass,
            _ => Status::Fail,
        };

        let (comment, description) = message_parts(publication);
        let comment = if status == Status::Blocked {
            html_row(Badge::Blocked, &comment)
        } else {
            comment
        };
        let replay = match last {
            Some(outcome) if !publication.specs.is_empty() => outcome.comment.as_str(),
            _ => "",
        };
        let step_comment = compose(preamble, &comment, &description, replay);

        debug!(step, status = %status, "updating step result");
        self.remote.edit_script_status(&ScriptUpdate {
            run_key: run_key.to_string(),
            case_key: publication.case_key.to_string(),
            step,
            environment: self.environment.clone(),
            status,
            comment: (!publication.specs.is_empty() || !last_failed).then_some(step_comment),
            executor: self.ci.user.clone(),
            assignee: self.ci.user.clone(),
        })?;

        if publication.skip.is_none() {
            for attachment in &publication.record.step_attachments {
                self.remote
                    .add_script_attachment(run_key, publication.case_key, step, attachment)?;
            }
        }

        let refreshed = self
            .remote
            .get_result(run_key, publication.case_key)?
            .ok_or_else(|| anyhow!("test result for {} vanished", publication.case_key))?;
        let aggregate = merge(&refreshed.script_results);

        let note = step_note(step, publication.skip, publication.passed, &comment);
        let case_comment = if !comment.is_empty() && refreshed.comment.contains(&note) {
            None
        } else {
            Some(insert_note(&refreshed.comment, &note))
        };

        debug!(status = %aggregate, "updating case aggregate");
        self.remote.edit_result_status(&ResultUpdate {
            run_key: run_key.to_string(),
            case_key: publication.case_key.to_string(),
            environment: self.environment.clone(),
            status: aggregate,
            comment: case_comment,
            execute_time: publication.elapsed,
            executor: self.ci.user.clone(),
            assignee: self.ci.user.clone(),
        })
    }

    fn publish_case(
        &self,
        run_key: &str,
        publication: &Publication<'_>,
        result: &TestResult,
        preamble: &str,
    ) -> Result<()> {
        let previous = result.status;
        let status = match publication.skip {
            Some(skip) if previous == Status::NotExecuted => match skip.kind {
                SkipKind::Block => Status::Blocked,
                SkipKind::Skip => Status::NotExecuted,
            },
            skip if previous == Status::Fail || (!publication.passed && skip.is_none()) => {
                Status::Fail
            }
            _ if previous == Status::NotExecuted => {
                if publication.passed {
                    Status::Pass
                } else {
                    Status::Fail
                }
            }
            _ => previous,
        };

        let (comment, description) = message_parts(publication);
        let head = compose(preamble, &comment, &description, "");
        let case_comment = if head.is_empty() || result.comment.contains(&head) {
            None
        } else {
            Some(format!("{head}{}", result.comment))
        };

        debug!(status = %status, previous = %previous, "updating case result");
        self.remote.edit_result_status(&ResultUpdate {
            run_key: run_key.to_string(),
            case_key: publication.case_key.to_string(),
            environment: self.environment.clone(),
            status,
            comment: case_comment,
            execute_time: publication.elapsed,
            executor: self.ci.user.clone(),
            assignee: self.ci.user.clone(),
        })?;

        if publication.skip.is_none() {
            for attachment in publication
                .record
                .case_attachments
                .iter()
                .chain(publication.record.attachment.as_ref())
            {
                self.remote
                    .add_result_attachment(run_key, publication.case_key, attachment)?;
            }
        }
        Ok(())
    }
}

/// Comment and description to send: the skip reason alone for skipped results.
fn message_parts(publication: &Publication<'_>) -> (String, String) {
    match publication.skip {
        Some(skip) => (skip.reason.clone(), String::new()),
        None => (
            publication.record.comment.clone(),
            publication.record.description.clone(),
        ),
    }
}

//! Step controller ("meta block") wrapping a test method body or one of its steps.
//!
//! A block is entered with a deadline, runs the caller's body and, on exit,
//! classifies how the body ended:
//!
//! - normally, possibly with soft check failures (`FAIL_CONTEXT`)
//! - through an [`Interrupt`] raised by a failed check, an explicit
//!   block/skip, an expired deadline, an error or a panic
//!
//! It then writes the block's comment rows into the registry, adjusts the
//! parent item's `blocked` flag and, for numbered steps of an item without a
//! step marker, publishes the step result itself.
//!
//! Control flow is carried by `Result<(), Interrupt>`: a failed check returns
//! `Err` and `?` unwinds to the block that owns the directive.

use std::any::Any;
use std::fmt;
use std::fs;
use std::panic::{self, AssertUnwindSafe, Location};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::core::budget::Deadline;
use crate::core::comment::{Badge, html_row};
use crate::core::registry::{ItemRecord, Registry};
use crate::core::types::{Action, Attachment, Directive, ItemMetadata, Outcome, SkipStatus};
use crate::io::remote::TestManagement;
use crate::report_sync::Publication;
use crate::session::SessionState;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);
pub const TIMEOUT_MESSAGE: &str = "The test step exceeded its timewindow and timed out.";

static NEXT_INTERRUPT_ID: AtomicU64 = AtomicU64::new(1);

/// Why a block body stopped early.
#[derive(Debug)]
pub enum Signal {
    /// A failed check with a non-continuing action.
    Directive(Directive),
    /// Explicit request to block the item.
    Block,
    /// Explicit request to skip the item.
    Skip,
    /// The block's deadline expired.
    TimedOut,
    /// Error or panic raised by the body.
    Failure,
    /// Remote call failed; passes through every block untouched.
    Transport(anyhow::Error),
}

/// Control value unwinding a block body.
///
/// Each interrupt has a unique id so the same failure is reported only once
/// even when several nested blocks see it.
#[derive(Debug)]
pub struct Interrupt {
    id: u64,
    signal: Signal,
    message: String,
    location: Option<String>,
}

impl Interrupt {
    fn new(signal: Signal, message: impl Into<String>, location: Option<String>) -> Self {
        Self {
            id: NEXT_INTERRUPT_ID.fetch_add(1, Ordering::Relaxed),
            signal,
            message: message.into(),
            location,
        }
    }

    fn directive(directive: Directive, message: impl Into<String>) -> Self {
        Self::new(Signal::Directive(directive), message, None)
    }

    /// Block the current item with `reason`.
    pub fn block(reason: impl Into<String>) -> Self {
        Self::new(Signal::Block, reason, None)
    }

    /// Skip the current item with `reason`.
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::new(Signal::Skip, reason, None)
    }

    /// Assertion-style failure: abort the test method and mark it failed.
    pub fn fail(message: impl Into<String>) -> Self {
        Self::directive(Directive::AbortMethod { blocked: false }, message)
    }

    /// Unexpected failure recorded with the caller's location.
    #[track_caller]
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Signal::Failure, message, Some(caller_location()))
    }

    /// Remote-call failure.
    pub fn transport(err: anyhow::Error) -> Self {
        let message = format!("{err:#}");
        Self::new(Signal::Transport(err), message, None)
    }

    #[track_caller]
    fn timed_out() -> Self {
        Self::new(
            Signal::TimedOut,
            "The test step exceeded its timewindow and timed out",
            Some(caller_location()),
        )
    }

    fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "panic".to_string()
        };
        Self::new(Signal::Failure, message, None)
    }

    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    pub fn is_transport(&self) -> bool {
        matches!(self.signal, Signal::Transport(_))
    }

    /// Error or timeout rather than a deliberate check, block or skip.
    pub fn is_unexpected(&self) -> bool {
        matches!(self.signal, Signal::Failure | Signal::TimedOut)
    }

    pub fn into_transport(self) -> Option<anyhow::Error> {
        match self.signal {
            Signal::Transport(err) => Some(err),
            _ => None,
        }
    }

    fn is_abort_step(&self) -> bool {
        matches!(self.signal, Signal::Directive(Directive::AbortStep))
    }

    /// Skip-style signals end the item without reporting a failure row.
    fn is_skip_like(&self) -> bool {
        matches!(
            self.signal,
            Signal::Skip | Signal::Directive(Directive::AbortMethod { blocked: true })
        )
    }

    fn first_line(&self) -> &str {
        self.message.lines().next().unwrap_or_default()
    }

    /// One-line description: message only for deliberate failures, message and location otherwise.
    fn describe(&self) -> String {
        match (&self.signal, &self.location) {
            (Signal::Failure | Signal::TimedOut, Some(location)) => {
                format!("{} ({location})", self.first_line())
            }
            _ => self.first_line().to_string(),
        }
    }
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl From<anyhow::Error> for Interrupt {
    #[track_caller]
    fn from(err: anyhow::Error) -> Self {
        Self::new(Signal::Failure, format!("{err:#}"), Some(caller_location()))
    }
}

#[track_caller]
fn caller_location() -> String {
    let location = Location::caller();
    format!("{}, line {}", location.file(), location.line())
}

/// Notifications for external tooling correlating checks across runs.
///
/// Observers never influence control flow.
pub trait CheckObserver {
    fn on_check(&mut self, _signature: &str, _condition: bool, _reference: &str) {}
    fn on_block(&mut self, _signature: &str, _outcome: Outcome) {}
}

/// Timeout policy of a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockOptions {
    pub timeout: Duration,
    pub action_on_timeout: Action,
    pub message_on_timeout: String,
}

impl Default for BlockOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            action_on_timeout: Action::StopMethod,
            message_on_timeout: TIMEOUT_MESSAGE.to_string(),
        }
    }
}

impl BlockOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn on_timeout(mut self, action: Action, message: impl Into<String>) -> Self {
        self.action_on_timeout = action;
        self.message_on_timeout = message.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AttachmentSource {
    Bytes { content: Vec<u8>, filename: String },
    File { path: PathBuf, filename: Option<String> },
}

/// Options of one check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Check {
    message_on_fail: Option<String>,
    message_on_pass: Option<String>,
    action: Action,
    description: Option<String>,
    attachment: Option<AttachmentSource>,
}

impl Check {
    pub fn new() -> Self {
        Self::default()
    }

    /// Message reported when the condition does not hold.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message_on_fail = Some(message.into());
        self
    }

    /// Message reported when the condition holds.
    pub fn on_pass(mut self, message: impl Into<String>) -> Self {
        self.message_on_pass = Some(message.into());
        self
    }

    pub fn action(mut self, action: Action) -> Self {
        self.action = action;
        self
    }

    /// Details appended to the result description (e.g. an HTML table).
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn attachment(mut self, content: impl Into<Vec<u8>>, filename: impl Into<String>) -> Self {
        self.attachment = Some(AttachmentSource::Bytes {
            content: content.into(),
            filename: filename.into(),
        });
        self
    }

    /// Attach a file; the upload is named after the file unless `filename` is given.
    pub fn attachment_file(mut self, path: impl Into<PathBuf>, filename: Option<String>) -> Self {
        self.attachment = Some(AttachmentSource::File {
            path: path.into(),
            filename,
        });
        self
    }
}

/// How a block ended, after classification.
#[derive(Debug)]
pub struct BlockReport {
    pub outcome: Outcome,
    pub passed: bool,
    pub skip: Option<SkipStatus>,
    pub elapsed: Duration,
    /// Interrupt leaving the block (step aborts are swallowed).
    pub escaped: Option<Interrupt>,
}

impl BlockReport {
    pub fn into_result(self) -> Result<(), Interrupt> {
        match self.escaped {
            Some(interrupt) => Err(interrupt),
            None => Ok(()),
        }
    }
}

/// One entered block. Created by the session for each item and by [`MetaBlock::step`].
pub struct MetaBlock<'s, R> {
    state: &'s mut SessionState<R>,
    meta: &'s ItemMetadata,
    step: Option<u32>,
    key: String,
    item_name: String,
    options: BlockOptions,
    deadline: Deadline,
    started: Instant,
    assumptions_at_entry: usize,
}

impl<'s, R: TestManagement> MetaBlock<'s, R> {
    /// Enter a block for `meta`, or for one of its numbered steps.
    pub fn enter(
        state: &'s mut SessionState<R>,
        meta: &'s ItemMetadata,
        step: Option<u32>,
        options: BlockOptions,
    ) -> Self {
        let key = Registry::block_key(&meta.fullname, step);
        state.registry.entry(&key);
        let item_name = match step {
            Some(step) => format!("{}_{step}", meta.name),
            None => meta.name.clone(),
        };
        debug!(item = %item_name, timeout_secs = options.timeout.as_secs(), "entering meta block");
        Self {
            assumptions_at_entry: state.assumptions,
            state,
            meta,
            step,
            key,
            item_name,
            deadline: Deadline::after(options.timeout),
            options,
            started: Instant::now(),
        }
    }

    pub fn step_number(&self) -> Option<u32> {
        self.step
    }

    pub fn item(&self) -> &ItemMetadata {
        self.meta
    }

    /// Record of this block (the item's own record for a method-level block).
    pub fn record(&mut self) -> &mut ItemRecord {
        self.state.registry.entry(&self.key)
    }

    /// Item-level record, e.g. to attach data to the whole test case.
    pub fn meta_data(&mut self) -> &mut ItemRecord {
        self.state.registry.entry(&self.meta.fullname)
    }

    /// Run `body` as numbered step `step` with the session's default options.
    pub fn step<F>(&mut self, step: u32, body: F) -> Result<(), Interrupt>
    where
        F: FnOnce(&mut MetaBlock<'_, R>) -> Result<(), Interrupt>,
    {
        let options = self.state.block_options.clone();
        self.step_with(step, options, body)
    }

    /// Run `body` as numbered step `step` with explicit timeout options.
    pub fn step_with<F>(&mut self, step: u32, options: BlockOptions, body: F) -> Result<(), Interrupt>
    where
        F: FnOnce(&mut MetaBlock<'_, R>) -> Result<(), Interrupt>,
    {
        MetaBlock::enter(&mut *self.state, self.meta, Some(step), options)
            .run(body)
            .into_result()
    }

    /// Fail with the timeout interrupt once the deadline has passed.
    #[track_caller]
    pub fn checkpoint(&self) -> Result<(), Interrupt> {
        if self.deadline.is_expired() {
            return Err(Interrupt::timed_out());
        }
        Ok(())
    }

    /// Sleep, waking early with the timeout interrupt when the deadline passes first.
    #[track_caller]
    pub fn sleep(&self, duration: Duration) -> Result<(), Interrupt> {
        match self.deadline.remaining() {
            Some(remaining) if remaining > duration => {
                thread::sleep(duration);
                Ok(())
            }
            Some(remaining) => {
                thread::sleep(remaining);
                Err(Interrupt::timed_out())
            }
            None => Err(Interrupt::timed_out()),
        }
    }

    /// Check `condition`, continuing on failure (`FAIL_CONTEXT`).
    #[track_caller]
    pub fn check(&mut self, condition: bool, message: &str) -> Result<(), Interrupt> {
        self.check_with(condition, Check::new().message(message))
    }

    /// Check `condition`, applying `action` on failure.
    #[track_caller]
    pub fn check_or(&mut self, condition: bool, message: &str, action: Action) -> Result<(), Interrupt> {
        self.check_with(condition, Check::new().message(message).action(action))
    }

    /// Check `condition` with full options.
    #[track_caller]
    pub fn check_with(&mut self, condition: bool, check: Check) -> Result<(), Interrupt> {
        self.checkpoint()?;

        let Check {
            message_on_fail,
            message_on_pass,
            action,
            description,
            attachment,
        } = check;
        let message_on_fail = message_on_fail.unwrap_or_default();
        let message_on_pass = message_on_pass.unwrap_or_default();

        if let Some(source) = attachment
            && self.state.enabled
        {
            let attachment = self.read_attachment(source)?;
            let step = self.step;
            let record = self.record();
            match step {
                Some(_) => record.step_attachments.push(attachment),
                None => record.case_attachments.push(attachment),
            }
        }

        let record = self.state.registry.entry(&self.key);
        if !condition && !message_on_fail.is_empty() {
            record.append_comment(&html_row(Badge::Failed, &message_on_fail));
        } else if condition && !message_on_pass.is_empty() {
            record.append_comment(&html_row(Badge::Passed, &message_on_pass));
        }
        if let Some(description) = description.as_deref() {
            record.append_description(description);
        }
        record.numchecks += 1;
        let numchecks = record.numchecks;

        let signature = self.signature(Some(numchecks));
        let reference = if condition {
            &message_on_pass
        } else {
            &message_on_fail
        };
        if let Some(observer) = self.state.observer.as_mut() {
            observer.on_check(&signature, condition, reference);
        }

        if condition {
            return Ok(());
        }
        debug!(signature = %signature, ?action, "check failed");
        self.fail_condition(action, &message_on_fail)
    }

    fn read_attachment(&self, source: AttachmentSource) -> Result<Attachment, Interrupt> {
        let step = self.step.unwrap_or(0);
        match source {
            AttachmentSource::Bytes { content, filename } => Ok(Attachment {
                content,
                filename,
                step,
            }),
            AttachmentSource::File { path, filename } => {
                let content = fs::read(&path).map_err(|err| {
                    Interrupt::error(format!("read attachment {}: {err}", path.display()))
                })?;
                let filename = filename.unwrap_or_else(|| {
                    path.file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .unwrap_or_default()
                });
                Ok(Attachment {
                    content,
                    filename,
                    step,
                })
            }
        }
    }

    /// Apply `action` for a failed condition described by `message`.
    fn fail_condition(&mut self, action: Action, message: &str) -> Result<(), Interrupt> {
        let directive = action.directive();
        match directive {
            Directive::Continue => {
                self.state.assumptions += 1;
                Ok(())
            }
            Directive::AbortStep => {
                self.record().blocked = Some(true);
                Err(Interrupt::directive(directive, message))
            }
            Directive::AbortMethod { blocked: false } => Err(Interrupt::directive(directive, message)),
            Directive::AbortMethod { blocked: true } => {
                self.record().blocked = Some(true);
                Err(Interrupt::directive(
                    directive,
                    format!("Blocked. {} failed: {message}", self.item_name),
                ))
            }
            Directive::AbortSessionAsBlocked => {
                let reason = format!("Blocked. {} failed: {message}", self.item_name);
                warn!(item = %self.item_name, "blocking remaining items of the session");
                self.state.control.block_remaining = Some(reason);
                self.meta_data().blocked = Some(true);
                Err(Interrupt::directive(directive, message))
            }
            Directive::AbortSessionAsFailed => {
                let reason = format!("Blocked. {} failed: {message}", self.item_name);
                warn!(item = %self.item_name, "blocking remaining items of the session");
                self.state.control.block_remaining = Some(reason);
                Err(Interrupt::directive(directive, message))
            }
            Directive::TerminateSession { exit_code } => {
                let reason = format!("Exiting session. {} failed: {message}", self.item_name);
                warn!(item = %self.item_name, exit_code, "terminating session");
                self.record().blocked = Some(true);
                self.meta_data().blocked = Some(true);
                self.state.control.terminate = Some((exit_code, reason.clone()));
                Err(Interrupt::directive(directive, reason))
            }
        }
    }

    fn signature(&self, numchecks: Option<u32>) -> String {
        let step = self
            .step
            .map_or_else(|| "x".to_string(), |step| step.to_string());
        let mut parts: Vec<String> = Vec::with_capacity(4);
        if let Some(prefix) = &self.state.worker_prefix {
            parts.push(prefix.clone());
        }
        parts.push(self.meta.name.clone());
        parts.push(step);
        if let Some(numchecks) = numchecks {
            parts.push(numchecks.to_string());
        }
        parts.join("_")
    }

    /// Run `body` inside this block and classify how it ended.
    ///
    /// Panics are caught and reported as unexpected failures.
    pub fn run<F>(mut self, body: F) -> BlockReport
    where
        F: FnOnce(&mut MetaBlock<'_, R>) -> Result<(), Interrupt>,
    {
        let result = match panic::catch_unwind(AssertUnwindSafe(|| body(&mut self))) {
            Ok(result) => result,
            Err(payload) => Err(Interrupt::from_panic(payload)),
        };
        self.finish(result)
    }

    fn finish(mut self, result: Result<(), Interrupt>) -> BlockReport {
        let elapsed = self.started.elapsed();
        let mut escaped = match result {
            Ok(()) if self.deadline.is_expired() => Some(Interrupt::timed_out()),
            Ok(()) => None,
            Err(interrupt) => Some(interrupt),
        };

        if escaped.as_ref().is_some_and(Interrupt::is_transport) {
            return BlockReport {
                outcome: Outcome::Failed,
                passed: false,
                skip: None,
                elapsed,
                escaped,
            };
        }

        if escaped
            .as_ref()
            .is_some_and(|interrupt| matches!(interrupt.signal, Signal::TimedOut))
        {
            warn!(item = %self.item_name, "meta block timed out");
            let action = self.options.action_on_timeout;
            let message = self.options.message_on_timeout.clone();
            if let Err(replacement) = self.fail_condition(action, &message) {
                escaped = Some(replacement);
            }
        }

        let skip = self.skip_status(escaped.as_ref());
        self.record_failure(escaped.as_ref(), skip.as_ref());

        let passed = escaped.is_none() && self.state.assumptions == self.assumptions_at_entry;
        let record_blocked = self.record().is_blocked();
        let outcome = match &skip {
            Some(status) if status.is_block() || record_blocked => Outcome::Blocked,
            Some(_) => Outcome::Skipped,
            None if passed => Outcome::Passed,
            None => Outcome::Failed,
        };

        let signature = self.signature(None);
        if let Some(observer) = self.state.observer.as_mut() {
            observer.on_block(&signature, outcome);
        }
        debug!(item = %self.item_name, outcome = outcome.as_str(), "meta block finished");

        let parent = self.state.registry.entry(&self.meta.fullname);
        if parent.is_blocked() && !passed && skip.is_none() {
            parent.blocked = None;
        } else if record_blocked {
            parent.blocked = Some(true);
        }

        let escaped = escaped.filter(|interrupt| !interrupt.is_abort_step());
        let mut report = BlockReport {
            outcome,
            passed,
            skip,
            elapsed,
            escaped,
        };

        if let Err(err) = self.publish(&report) {
            report.escaped = Some(Interrupt::transport(err));
        }
        report
    }

    /// Block/skip status derived from the escaping interrupt and the block's record.
    fn skip_status(&mut self, escaped: Option<&Interrupt>) -> Option<SkipStatus> {
        let record = self.state.registry.entry(&self.key);
        let record_blocked = record.is_blocked();
        let signal = escaped.map(|interrupt| &interrupt.signal);
        match signal {
            Some(
                Signal::Block
                | Signal::Skip
                | Signal::Directive(
                    Directive::AbortMethod { blocked: true }
                    | Directive::AbortSessionAsBlocked
                    | Directive::TerminateSession { .. },
                ),
            ) => {
                let reason = if record.comment.is_empty() {
                    escaped
                        .map(|interrupt| interrupt.first_line().to_string())
                        .unwrap_or_default()
                } else {
                    record.comment.clone()
                };
                let block = record_blocked
                    || matches!(
                        signal,
                        Some(
                            Signal::Block
                                | Signal::Directive(
                                    Directive::AbortSessionAsBlocked
                                        | Directive::TerminateSession { .. }
                                )
                        )
                    );
                Some(if block {
                    SkipStatus::block(reason)
                } else {
                    SkipStatus::skip(reason)
                })
            }
            None | Some(Signal::Directive(Directive::AbortStep)) if record_blocked => {
                Some(SkipStatus::block(record.comment.clone()))
            }
            _ => None,
        }
    }

    /// Append a failure row for the escaping interrupt, once per item.
    fn record_failure(&mut self, escaped: Option<&Interrupt>, skip: Option<&SkipStatus>) {
        let Some(interrupt) = escaped.filter(|interrupt| !interrupt.is_abort_step()) else {
            return;
        };
        if !self
            .state
            .registry
            .entry(&self.meta.fullname)
            .register_failure(interrupt.id)
        {
            return;
        }
        let info = interrupt.describe();
        let record = self.state.registry.entry(&self.key);
        if !info.is_empty()
            && !record.comment.contains(&info)
            && !interrupt.is_skip_like()
            && skip.is_none()
        {
            record.append_comment(&html_row(Badge::Failed, &info));
        }
    }

    /// Publish a numbered step of an item without a step marker, then mark the record done.
    fn publish(&mut self, report: &BlockReport) -> anyhow::Result<()> {
        if !self.state.enabled {
            return Ok(());
        }
        let meta = self.meta;
        let (Some(marker), Some(step)) = (&meta.testcase, self.step) else {
            return Ok(());
        };
        if marker.test_step_key.is_some() {
            return Ok(());
        }
        let specs = meta.spec();
        let state = &mut *self.state;
        let empty = ItemRecord::default();
        let record = state.registry.get(&self.key).unwrap_or(&empty);
        state.sync.publish(&Publication {
            case_key: &marker.test_case_key,
            step: Some(step),
            elapsed: report.elapsed,
            skip: report.skip.as_ref(),
            passed: report.passed,
            record,
            specs: &specs,
        })?;
        self.record().done = true;
        Ok(())
    }
}

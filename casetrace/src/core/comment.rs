//! Comment fragments pushed to the remote service.
//!
//! Comments are HTML. Each check or failure becomes one badge row; repeated
//! parameterized runs are separated by a dated delimiter line so notes of
//! earlier runs survive later updates.

use crate::core::status::Status;
use crate::core::types::{SkipKind, SkipStatus};

/// Dash rule used in session headers; `"<rule> "` marks the first header in a comment.
pub const DELIMITER_RULE: &str = "----------------------------------------";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Badge {
    Passed,
    Failed,
    Blocked,
}

impl Badge {
    fn colors(self) -> (&'static str, Status) {
        match self {
            Badge::Passed => ("rgb(58, 187, 75)", Status::Pass),
            Badge::Failed => ("rgb(223, 47, 54)", Status::Fail),
            Badge::Blocked => ("rgb(75, 136, 231)", Status::Blocked),
        }
    }
}

/// One colored status badge followed by `message`. Empty messages produce nothing.
pub fn html_row(badge: Badge, message: &str) -> String {
    if message.is_empty() {
        return String::new();
    }
    let (background, label) = badge.colors();
    format!(
        "<div style='padding: 2pt'><span style='width: auto; margin-right: 4pt; padding: 2pt; \
         border-radius: 4px; background-color: {background}; color: white; font-family: monospace; \
         font-size: 10pt; font-weight: bold;'>{label}</span>{message}</div>"
    )
}

/// Dated header separating parameterized runs.
pub fn session_header(timestamp: &str) -> String {
    format!("{DELIMITER_RULE} {timestamp} {DELIMITER_RULE}")
}

/// Parameterization preamble, or empty for non-parameterized items.
pub fn parameterization_preamble(header: &str, specs: &str) -> String {
    if specs.is_empty() {
        return String::new();
    }
    format!("{header}<br>parameterization {specs}<br><br>")
}

/// Join the parts of a result comment; empty parts are dropped.
pub fn compose(preamble: &str, comment: &str, description: &str, tail: &str) -> String {
    let mut out = String::from(preamble);
    if !comment.is_empty() {
        out.push_str(comment);
        out.push_str("<br>");
    }
    if !description.is_empty() {
        out.push_str(description);
        out.push_str("<br>");
    }
    out.push_str(tail);
    out
}

/// Case-level note describing what happened to a step.
pub fn step_note(step: u32, skip: Option<&SkipStatus>, passed: bool, comment: &str) -> String {
    match skip {
        Some(status) => {
            let verb = match status.kind {
                SkipKind::Block => "blocked",
                SkipKind::Skip => "skipped",
            };
            format!("Step {step} {verb}")
        }
        None if !passed => {
            if comment.is_empty() {
                format!("Step {step} failed:")
            } else {
                format!("Step {step}<br>{comment}<br> failed:")
            }
        }
        None => String::new(),
    }
}

/// Insert `note` before the first session delimiter of `existing`, or append it.
pub fn insert_note(existing: &str, note: &str) -> String {
    let marker = format!("{DELIMITER_RULE} ");
    match existing.find(&marker) {
        Some(index) => format!("{}{}{}", &existing[..index], note, &existing[index..]),
        None => format!("{existing}{note}"),
    }
}

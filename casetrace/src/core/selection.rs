//! Deterministic selection of test cases at collection time.
//!
//! Test functions map to remote cases either by name
//! (`test_[<PROJECT>_]T<n>[_<step>]`) or by an explicit marker. Selection then
//! decides which items are reported, which are skipped as not requested and
//! in which order cases execute.

use std::collections::HashSet;
use std::sync::LazyLock;

use crate::core::types::{ItemMetadata, SkipStatus, TestCaseMarker};

pub const DEFAULT_PROJECT: &str = "TEST";
pub const SKIPPED_AS_REQUESTED: &str = "skipped as requested";

static TEST_NAME_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)^test_(([A-Z]+[A-Z0-9_]*[^_])_)?(T[1-9]+[0-9]*)(_([1-9]+[0-9]*))*")
        .unwrap()
});

/// Test-case reference extracted from a function name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub project_key: Option<String>,
    pub test_case: String,
    pub step: Option<u32>,
}

/// Parse `test_[<PROJECT>_]T<n>[_<step>]` names.
pub fn parse_test_name(name: &str) -> Option<ParsedName> {
    let captures = TEST_NAME_RE.captures(name)?;
    let test_case = captures.get(3)?.as_str().to_string();
    Some(ParsedName {
        project_key: captures.get(2).map(|m| m.as_str().to_string()),
        test_case,
        step: captures.get(5).and_then(|m| m.as_str().parse().ok()),
    })
}

/// Parameterization suffix of an item id: `a.rs::test_T1[x-1]` -> `[x-1]`.
pub fn param_suffix(fullname: &str) -> String {
    match fullname.split_once('[') {
        Some((_, rest)) => format!("[{}", rest.trim()),
        None => String::new(),
    }
}

/// Elements of `a` that are also in `b`, in the order of `a`, without duplicates.
pub fn intersection(a: &[String], b: &[String]) -> Vec<String> {
    let wanted: HashSet<&str> = b.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    a.iter()
        .filter(|key| wanted.contains(key.as_str()) && seen.insert(key.as_str()))
        .cloned()
        .collect()
}

/// Settings that drive per-item assignment.
#[derive(Debug, Clone, Default)]
pub struct SelectionRules {
    /// Configured project used when neither name nor markers name one.
    pub default_project: Option<String>,
    /// Case keys eligible for this session (empty = all).
    pub case_keys: Vec<String>,
    /// Report items even if their case is not part of `case_keys`.
    pub append_to_cycle: bool,
    /// Skip functions that are not mapped to a test case.
    pub skip_ntc_methods: bool,
}

impl SelectionRules {
    /// Restrict eligible case keys to those of an existing run.
    ///
    /// With configured keys the intersection is used; an empty intersection
    /// keeps a sentinel so that every item ends up skipped.
    pub fn restrict_to_run(&mut self, run_cases: &[String]) {
        if self.case_keys.is_empty() {
            self.case_keys = run_cases.to_vec();
        } else {
            let kept = intersection(&self.case_keys, run_cases);
            self.case_keys = if kept.is_empty() {
                vec![String::new()]
            } else {
                kept
            };
        }
    }
}

/// Per-item result of collection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Assignment {
    /// Reporting marker, set when the item's case is reported.
    pub testcase: Option<TestCaseMarker>,
    /// Case the item was collected under (drives ordering).
    pub collected_case: Option<String>,
    /// Project the item belongs to.
    pub project_key: Option<String>,
    /// Refresh token key (`<case><param suffix>`).
    pub refresh_key: Option<String>,
    /// Static skip added by selection.
    pub skip: Option<SkipStatus>,
}

/// Assign an item to a test case according to `rules`.
pub fn assign(item: &ItemMetadata, rules: &SelectionRules) -> Assignment {
    let (mut project, case, step) = match parse_test_name(&item.name) {
        Some(parsed) => (parsed.project_key, Some(parsed.test_case), parsed.step),
        None => match &item.marker_case_key {
            Some(case) => (item.project_key.clone(), Some(case.clone()), item.marker_step_key),
            None => (None, None, None),
        },
    };

    let Some(case) = case else {
        return Assignment {
            skip: rules.skip_ntc_methods.then(|| SkipStatus::skip("")),
            ..Assignment::default()
        };
    };

    if project.is_none() {
        project = item
            .project_key
            .clone()
            .or_else(|| item.class_project_key.clone());
    }
    let project = project
        .or_else(|| rules.default_project.clone())
        .unwrap_or_else(|| DEFAULT_PROJECT.to_string());

    let case_key = if case.starts_with(&format!("{project}-")) {
        case
    } else {
        format!("{project}-{case}")
    };

    let listed = rules.case_keys.iter().any(|key| key == &case_key);
    let reported = listed || rules.case_keys.is_empty() || rules.append_to_cycle;
    let excluded = !rules.append_to_cycle && !rules.case_keys.is_empty() && !listed;

    Assignment {
        testcase: reported.then(|| TestCaseMarker {
            project_key: project.clone(),
            test_case_key: case_key.clone(),
            test_step_key: step,
        }),
        collected_case: (!excluded).then(|| case_key.clone()),
        project_key: Some(project),
        refresh_key: Some(format!("{case_key}{}", item.spec())),
        skip: excluded.then(|| SkipStatus::skip(SKIPPED_AS_REQUESTED)),
    }
}

/// Order case keys: keys listed in `order` first (in that order), then the rest.
pub fn order_cases(collected: &[String], order: &[String]) -> Vec<String> {
    let mut ordered: Vec<String> = Vec::with_capacity(collected.len());
    for key in order {
        if collected.contains(key) && !ordered.contains(key) {
            ordered.push(key.clone());
        }
    }
    for key in collected {
        if !ordered.contains(key) {
            ordered.push(key.clone());
        }
    }
    ordered
}

/// Split ordered case keys by `[start, end, start, end, ...]` ranges.
///
/// Returns `(kept, excluded)`. An empty range keeps everything. A trailing
/// start without end keeps everything from that start on.
pub fn apply_case_range(ordered: &[String], range: &[String]) -> (Vec<String>, Vec<String>) {
    if ordered.is_empty() || range.is_empty() {
        return (ordered.to_vec(), Vec::new());
    }

    let mut kept = Vec::new();
    let mut excluded = Vec::new();
    let mut out_of_range = true;
    let mut i = 0;
    for key in ordered {
        if i < range.len() && key == &range[i] {
            out_of_range = false;
        }

        if out_of_range {
            excluded.push(key.clone());
        } else {
            kept.push(key.clone());
        }

        if i + 1 < range.len() && key == &range[i + 1] {
            out_of_range = true;
            i += 2;
        }
    }
    (kept, excluded)
}

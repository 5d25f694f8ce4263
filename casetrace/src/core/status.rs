//! Status lattice for folding step results into a test-case verdict.
//!
//! Each status carries a 4-bit code; the aggregate of several steps is the
//! bitwise AND of their codes mapped back to a status:
//!
//! ```text
//! Not Executed = 1011
//! Pass         = 0111
//! In Progress  = 0011
//! Blocked      = 0001
//! Fail         = 0000
//! ```
//!
//! The codes encode the remote service's meet table exactly. Note that
//! `Pass` combined with `Not Executed` yields `In Progress`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Remote status of a test result or one of its step results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "Not Executed")]
    NotExecuted,
    #[serde(rename = "Pass")]
    Pass,
    #[serde(rename = "In Progress")]
    InProgress,
    #[serde(rename = "Blocked")]
    Blocked,
    #[serde(rename = "Fail")]
    Fail,
}

impl Status {
    pub const ALL: [Status; 5] = [
        Status::NotExecuted,
        Status::Pass,
        Status::InProgress,
        Status::Blocked,
        Status::Fail,
    ];

    fn code(self) -> u8 {
        match self {
            Status::NotExecuted => 0b1011,
            Status::Pass => 0b0111,
            Status::InProgress => 0b0011,
            Status::Blocked => 0b0001,
            Status::Fail => 0b0000,
        }
    }

    fn from_code(code: u8) -> Status {
        match code {
            0b1011 => Status::NotExecuted,
            0b0111 => Status::Pass,
            0b0011 => Status::InProgress,
            0b0001 => Status::Blocked,
            0b0000 => Status::Fail,
            other => unreachable!("status codes are closed under AND, got {other:#06b}"),
        }
    }

    /// Label used by the remote service.
    pub fn as_str(self) -> &'static str {
        match self {
            Status::NotExecuted => "Not Executed",
            Status::Pass => "Pass",
            Status::InProgress => "In Progress",
            Status::Blocked => "Blocked",
            Status::Fail => "Fail",
        }
    }

    /// Meet of two statuses.
    pub fn and(self, other: Status) -> Status {
        Status::from_code(self.code() & other.code())
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['_', '-'], " ");
        match normalized.as_str() {
            "not executed" => Ok(Status::NotExecuted),
            "pass" => Ok(Status::Pass),
            "in progress" => Ok(Status::InProgress),
            "blocked" => Ok(Status::Blocked),
            "fail" => Ok(Status::Fail),
            _ => Err(format!("unknown status '{s}'")),
        }
    }
}

/// Fold statuses into one aggregate. Empty input is `Not Executed`.
pub fn merge_statuses<I>(statuses: I) -> Status
where
    I: IntoIterator<Item = Status>,
{
    let mut iter = statuses.into_iter();
    let Some(first) = iter.next() else {
        return Status::NotExecuted;
    };
    iter.fold(first, Status::and)
}

/// Aggregate status of a test case from its step outcomes.
pub fn merge<'a, I>(outcomes: I) -> Status
where
    I: IntoIterator<Item = &'a crate::core::types::StepOutcome>,
{
    merge_statuses(outcomes.into_iter().map(|outcome| outcome.status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::StepOutcome;

    fn outcomes(statuses: &[Status]) -> Vec<StepOutcome> {
        statuses
            .iter()
            .enumerate()
            .map(|(index, status)| StepOutcome {
                index: index as u32,
                status: *status,
                comment: String::new(),
            })
            .collect()
    }

    #[test]
    fn empty_is_not_executed() {
        assert_eq!(merge(&outcomes(&[])), Status::NotExecuted);
    }

    #[test]
    fn single_status_is_identity() {
        for status in Status::ALL {
            assert_eq!(merge(&outcomes(&[status])), status);
        }
    }

    /// Spot checks of the remote meet table.
    #[test]
    fn meet_table() {
        use Status::{Blocked, Fail, InProgress, NotExecuted, Pass};

        let table = [
            (Blocked, NotExecuted, Blocked),
            (Blocked, InProgress, Blocked),
            (Blocked, Pass, Blocked),
            (Blocked, Fail, Fail),
            (Fail, NotExecuted, Fail),
            (Fail, InProgress, Fail),
            (Fail, Pass, Fail),
            (Pass, NotExecuted, InProgress),
            (Pass, InProgress, InProgress),
            (InProgress, NotExecuted, InProgress),
            (Pass, Pass, Pass),
            (NotExecuted, NotExecuted, NotExecuted),
        ];
        for (a, b, expected) in table {
            assert_eq!(merge(&outcomes(&[a, b])), expected, "{a} & {b}");
        }
    }

    /// Merge is commutative and associative: every ordering of a multiset agrees.
    #[test]
    fn merge_is_order_independent() {
        let samples = [
            vec![Status::Pass, Status::Blocked, Status::NotExecuted],
            vec![Status::Pass, Status::InProgress, Status::Fail, Status::Blocked],
            vec![Status::NotExecuted, Status::Pass, Status::Pass],
        ];
        for sample in samples {
            let expected = merge_statuses(sample.iter().copied());
            for perm in permutations(&sample) {
                assert_eq!(merge_statuses(perm.iter().copied()), expected);
            }
        }

        for a in Status::ALL {
            for b in Status::ALL {
                assert_eq!(a.and(b), b.and(a));
                for c in Status::ALL {
                    assert_eq!(a.and(b).and(c), a.and(b.and(c)));
                }
            }
        }
    }

    #[test]
    fn parses_remote_labels() {
        assert_eq!("Not Executed".parse::<Status>(), Ok(Status::NotExecuted));
        assert_eq!("in_progress".parse::<Status>(), Ok(Status::InProgress));
        assert!("done".parse::<Status>().is_err());
    }

    #[test]
    fn serializes_with_remote_labels() {
        let json = serde_json::to_string(&Status::InProgress).expect("serialize");
        assert_eq!(json, "\"In Progress\"");
    }

    fn permutations(items: &[Status]) -> Vec<Vec<Status>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for index in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(index);
            for mut tail in permutations(&rest) {
                tail.insert(0, head);
                out.push(tail);
            }
        }
        out
    }
}

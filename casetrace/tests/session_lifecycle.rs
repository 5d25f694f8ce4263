//! End-to-end session tests against the in-memory test-management service.
//!
//! Each test builds a session of items, runs it and inspects what the remote
//! ended up with: step statuses, case aggregates, comments and the item
//! reports returned to the caller.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use casetrace::core::markers::{Marker, Markers};
use casetrace::core::selection::SKIPPED_AS_REQUESTED;
use casetrace::core::status::Status;
use casetrace::core::types::{Action, Outcome};
use casetrace::exit_codes;
use casetrace::io::config::ReporterConfig;
use casetrace::io::session_report::SessionReport;
use casetrace::meta_block::{BlockOptions, TIMEOUT_MESSAGE};
use casetrace::session::{Session, TestItem};
use casetrace::test_support::{
    InMemoryTestManagement, item, local_ci, reporting_config, short_timeout,
};

type Remote = InMemoryTestManagement;

fn session(config: ReporterConfig, remote: &Remote) -> Session<Remote> {
    Session::new(config, remote.clone(), local_ci()).expect("session")
}

const RUN: &str = "PRJ-C1";

/// Steps `[check(true), check(false)]`: step 1 passes, step 2 fails, case fails.
#[test]
fn failing_second_step_fails_the_case() {
    let remote = Remote::new().with_case("PRJ-T1", 2, None);
    let mut session = session(reporting_config("PRJ"), &remote);
    session.add_item(TestItem::new(item("test_T1"), |block| {
        block.step(1, |step| step.check(true, "login works"))?;
        block.step(2, |step| step.check(false, "logout button missing"))
    }));

    let summary = session.run().expect("run");

    assert_eq!(remote.created_runs().len(), 1);
    assert_eq!(remote.created_runs()[0].name, "PRJ nightly");
    assert_eq!(remote.step_status(RUN, "PRJ-T1", 1), Some(Status::Pass));
    assert_eq!(remote.step_status(RUN, "PRJ-T1", 2), Some(Status::Fail));
    let result = remote.result(RUN, "PRJ-T1").expect("result");
    assert_eq!(result.status, Status::Fail);
    assert!(result.comment.contains("logout button missing"));

    assert_eq!(summary.exit_code, exit_codes::TESTS_FAILED);
    assert_eq!(summary.reports.len(), 1);
    assert_eq!(summary.reports[0].outcome, Outcome::Failed);
    assert_eq!(summary.reports[0].test_case_name.as_deref(), Some("PRJ-T1 name"));
    assert_eq!(summary.targets.test_run_keys, vec![RUN]);
}

/// `STOP_CONTEXT` in step 1 blocks that step only; step 2 passes; the case is blocked.
#[test]
fn stop_context_blocks_step_and_case() {
    let remote = Remote::new().with_case("PRJ-T1", 2, None);
    let mut session = session(reporting_config("PRJ"), &remote);
    session.add_item(TestItem::new(item("test_T1"), |block| {
        block.step(1, |step| {
            step.check_or(false, "no admin rights", Action::StopContext)?;
            step.check(false, "admin page renders")
        })?;
        block.step(2, |step| step.check(true, "guest page renders"))
    }));

    let summary = session.run().expect("run");

    assert_eq!(remote.step_status(RUN, "PRJ-T1", 1), Some(Status::Blocked));
    assert_eq!(remote.step_status(RUN, "PRJ-T1", 2), Some(Status::Pass));
    let result = remote.result(RUN, "PRJ-T1").expect("result");
    assert_eq!(result.status, Status::Blocked);
    let step_comment = &result.script_results[0].comment;
    assert!(step_comment.contains("no admin rights"));
    assert!(!step_comment.contains("admin page renders"));

    assert_eq!(summary.reports[0].outcome, Outcome::Blocked);
    assert_eq!(summary.exit_code, exit_codes::OK);
}

/// A, B (`STOP_SESSION`), C: A keeps its status, B and C are blocked, C never runs.
#[test]
fn stop_session_blocks_remaining_items_only() {
    let remote = Remote::new()
        .with_case("PRJ-T1", 1, None)
        .with_case("PRJ-T2", 1, None)
        .with_case("PRJ-T3", 1, None);
    let mut session = session(reporting_config("PRJ"), &remote);
    let c_ran = Rc::new(Cell::new(false));
    let flag = Rc::clone(&c_ran);

    session.add_item(TestItem::new(item("test_T1"), |block| block.check(true, "a")));
    session.add_item(TestItem::new(item("test_T2"), |block| {
        block.check_or(false, "database down", Action::StopSession)
    }));
    session.add_item(TestItem::new(item("test_T3"), move |_| {
        flag.set(true);
        Ok(())
    }));

    let summary = session.run().expect("run");

    assert!(!c_ran.get());
    let outcomes: Vec<Outcome> = summary.reports.iter().map(|r| r.outcome).collect();
    assert_eq!(outcomes, vec![Outcome::Passed, Outcome::Blocked, Outcome::Blocked]);
    assert_eq!(remote.result(RUN, "PRJ-T1").expect("a").status, Status::Pass);
    assert_eq!(remote.result(RUN, "PRJ-T2").expect("b").status, Status::Blocked);
    let c = remote.result(RUN, "PRJ-T3").expect("c");
    assert_eq!(c.status, Status::Blocked);
    assert!(c.comment.contains("Blocked. test_T2 failed: database down"));
    assert_eq!(summary.reports[2].details, "Blocked. test_T2 failed: database down");
}

/// `FAIL_SESSION` fails the triggering item and blocks the rest.
#[test]
fn fail_session_fails_trigger_and_blocks_rest() {
    let remote = Remote::new()
        .with_case("PRJ-T1", 1, None)
        .with_case("PRJ-T2", 1, None);
    let mut session = session(reporting_config("PRJ"), &remote);
    session.add_item(TestItem::new(item("test_T1"), |block| {
        block.check_or(false, "corrupt fixture", Action::FailSession)
    }));
    session.add_item(TestItem::new(item("test_T2"), |block| block.check(true, "b")));

    let summary = session.run().expect("run");

    assert_eq!(summary.reports[0].outcome, Outcome::Failed);
    assert_eq!(summary.reports[1].outcome, Outcome::Blocked);
    assert_eq!(remote.result(RUN, "PRJ-T1").expect("a").status, Status::Fail);
    assert_eq!(remote.result(RUN, "PRJ-T2").expect("b").status, Status::Blocked);
    assert_eq!(summary.exit_code, exit_codes::TESTS_FAILED);
}

/// Exit-session actions stop the queue; the triggering item is still reported.
#[test]
fn exit_session_stops_the_queue() {
    let remote = Remote::new()
        .with_case("PRJ-T1", 1, None)
        .with_case("PRJ-T2", 1, None);
    let mut session = session(reporting_config("PRJ"), &remote);
    let second_ran = Rc::new(Cell::new(false));
    let flag = Rc::clone(&second_ran);
    session.add_item(TestItem::new(item("test_T1"), |block| {
        block.check_or(false, "license expired", Action::FailExitSession)
    }));
    session.add_item(TestItem::new(item("test_T2"), move |_| {
        flag.set(true);
        Ok(())
    }));

    let summary = session.run().expect("run");

    assert!(!second_ran.get());
    assert_eq!(summary.exit_code, exit_codes::INTERRUPTED);
    assert_eq!(summary.reports.len(), 1);
    assert_eq!(summary.reports[0].outcome, Outcome::Blocked);
    assert_eq!(remote.result(RUN, "PRJ-T1").expect("a").status, Status::Blocked);
    assert_eq!(
        remote.result(RUN, "PRJ-T2").expect("untouched").status,
        Status::NotExecuted
    );
}

/// Items whose case is not configured are skipped as requested and not reported.
#[test]
fn unlisted_cases_are_skipped_as_requested() {
    let remote = Remote::new()
        .with_case("PRJ-T1", 1, None)
        .with_case("PRJ-T2", 1, None);
    let config = ReporterConfig {
        test_case_keys: vec!["PRJ-T1".to_string()],
        ..reporting_config("PRJ")
    };
    let mut session = session(config, &remote);
    session.add_item(TestItem::new(item("test_T1"), |block| block.check(true, "a")));
    session.add_item(TestItem::new(item("test_T2"), |block| block.check(true, "b")));

    let summary = session.run().expect("run");

    assert_eq!(summary.reports[1].outcome, Outcome::Skipped);
    assert_eq!(summary.reports[1].details, SKIPPED_AS_REQUESTED);
    assert_eq!(remote.created_runs()[0].case_keys, vec!["PRJ-T1"]);
    assert!(remote.result(RUN, "PRJ-T2").is_none());
}

/// Configured order runs listed cases first; ranges skip cases outside them.
#[test]
fn order_and_range_shape_the_queue() {
    let remote = Remote::new()
        .with_case("PRJ-T1", 1, None)
        .with_case("PRJ-T2", 1, None)
        .with_case("PRJ-T3", 1, None);
    let config = ReporterConfig {
        test_case_order: vec!["PRJ-T3".to_string(), "PRJ-T1".to_string()],
        test_case_range: vec!["PRJ-T3".to_string(), "PRJ-T1".to_string()],
        ..reporting_config("PRJ")
    };
    let mut session = session(config, &remote);
    for name in ["test_T1", "test_T2", "test_T3"] {
        session.add_item(TestItem::new(item(name), |block| block.check(true, "ok")));
    }

    let summary = session.run().expect("run");

    let order: Vec<(&str, Outcome)> = summary
        .reports
        .iter()
        .map(|r| (r.key.as_str(), r.outcome))
        .collect();
    assert_eq!(
        order,
        vec![
            ("tests/suite.rs::test_T3", Outcome::Passed),
            ("tests/suite.rs::test_T1", Outcome::Passed),
            ("tests/suite.rs::test_T2", Outcome::Skipped),
        ]
    );
    assert_eq!(remote.created_runs()[0].case_keys, vec!["PRJ-T3", "PRJ-T1"]);
}

/// Static markers: class-level block wins, method-level skip wins.
#[test]
fn static_markers_short_circuit_items() {
    let remote = Remote::new()
        .with_case("PRJ-T1", 1, None)
        .with_case("PRJ-T2", 1, None);
    let mut session = session(reporting_config("PRJ"), &remote);

    let mut blocked = item("test_T1");
    blocked.markers = Markers {
        class: vec![Marker::Block {
            reason: "rack offline".to_string(),
        }],
        method: vec![Marker::Block {
            reason: "method reason".to_string(),
        }],
    };
    let mut skipped = item("test_T2");
    skipped.markers = Markers::method(Marker::SkipIf {
        conditions: vec![false, true],
        reason: "windows only".to_string(),
    });
    session.add_item(TestItem::new(blocked, |_| panic!("must not run")));
    session.add_item(TestItem::new(skipped, |_| panic!("must not run")));

    let summary = session.run().expect("run");

    assert_eq!(summary.reports[0].outcome, Outcome::Blocked);
    assert_eq!(summary.reports[0].details, "rack offline");
    assert_eq!(summary.reports[1].outcome, Outcome::Skipped);
    let blocked = remote.result(RUN, "PRJ-T1").expect("blocked");
    assert_eq!(blocked.status, Status::Blocked);
    assert_eq!(blocked.comment, "rack offline<br>");
    assert_eq!(
        remote.result(RUN, "PRJ-T2").expect("skipped").status,
        Status::NotExecuted
    );
}

/// A conditional block without reason is a usage error reported as an unexpected failure.
#[test]
fn blockif_without_reason_fails_the_item() {
    let remote = Remote::new().with_case("PRJ-T1", 1, None);
    let mut session = session(reporting_config("PRJ"), &remote);
    let mut meta = item("test_T1");
    meta.markers = Markers::method(Marker::BlockIf {
        conditions: vec![true],
        reason: String::new(),
    });
    session.add_item(TestItem::new(meta, |_| Ok(())));

    let summary = session.run().expect("run");

    assert_eq!(summary.reports[0].outcome, Outcome::Failed);
    assert!(summary.reports[0].unexpected_exception);
    assert!(summary.reports[0].details.contains("You need to specify a reason"));
}

/// Parameterized variants share one remote result created with the run.
#[test]
fn parameterized_variants_share_the_run_result() {
    let remote = Remote::new().with_case("PRJ-T1", 1, None);
    let mut session = session(reporting_config("PRJ"), &remote);
    session.add_item(TestItem::new(item("test_T1[chrome]"), |block| {
        block.check(true, "chrome")
    }));
    session.add_item(TestItem::new(item("test_T1[firefox]"), |block| {
        block.check(false, "firefox renders blank page")
    }));

    session.run().expect("run");

    assert!(remote.created_results().is_empty());
    let result = remote.result(RUN, "PRJ-T1").expect("result");
    assert_eq!(result.status, Status::Fail);
    assert!(result.comment.contains("parameterization [firefox]"));
    assert!(result.comment.contains("firefox renders blank page"));
}

/// A result left over from an earlier session under the same run key is replaced.
#[test]
fn existing_run_results_are_refreshed() {
    let remote = Remote::new()
        .with_case("PRJ-T1", 1, None)
        .with_run("PRJ-C7", "weekly", "PRJ", &["PRJ-T1"]);
    remote.seed_result(
        "PRJ-C7",
        "PRJ-T1",
        casetrace::io::remote::TestResult {
            status: Status::Fail,
            comment: "stale failure".to_string(),
            script_results: Vec::new(),
        },
    );
    let config = ReporterConfig {
        test_run_key: Some("PRJ-C7".to_string()),
        ..reporting_config("PRJ")
    };
    let mut session = session(config, &remote);
    session.add_item(TestItem::new(item("test_T1"), |block| block.check(true, "ok")));

    session.run().expect("run");

    assert!(remote.created_runs().is_empty());
    assert_eq!(remote.created_results().len(), 1);
    let result = remote.result("PRJ-C7", "PRJ-T1").expect("result");
    assert_eq!(result.status, Status::Pass);
    assert!(!result.comment.contains("stale failure"));
}

/// Cases outside a configured run are skipped; with configured keys the intersection is used.
#[test]
fn configured_run_restricts_cases() {
    let remote = Remote::new()
        .with_case("PRJ-T1", 1, None)
        .with_case("PRJ-T2", 1, None)
        .with_run("PRJ-C7", "weekly", "PRJ", &["PRJ-T1"]);
    let config = ReporterConfig {
        test_run_key: Some("PRJ-C7".to_string()),
        ..reporting_config("PRJ")
    };
    let mut session = session(config, &remote);
    session.add_item(TestItem::new(item("test_T1"), |block| block.check(true, "ok")));
    session.add_item(TestItem::new(item("test_T2"), |block| block.check(true, "ok")));

    let summary = session.run().expect("run");

    assert_eq!(summary.reports[1].outcome, Outcome::Skipped);
    assert!(remote.result("PRJ-C7", "PRJ-T2").is_none());
}

#[test]
fn disabled_reporting_makes_no_remote_calls() {
    let remote = Remote::new().with_case("PRJ-T1", 1, None);
    let config = ReporterConfig {
        enabled: false,
        ..reporting_config("PRJ")
    };
    let mut session = session(config, &remote);
    session.add_item(TestItem::new(item("test_T1"), |block| block.check(false, "bad")));

    let summary = session.run().expect("run");

    assert!(remote.calls().is_empty());
    assert_eq!(summary.reports[0].outcome, Outcome::Failed);
    assert!(summary.reports[0].details.contains("bad"));
    assert!(summary.targets.test_run_keys.is_empty());
}

/// A remote failure stops the session with an error.
#[test]
fn remote_failure_stops_the_session() {
    let remote = Remote::new()
        .with_case("PRJ-T1", 1, None)
        .failing_on("edit_script_status");
    let mut session = session(reporting_config("PRJ"), &remote);
    session.add_item(TestItem::new(item("test_T1"), |block| {
        block.step(1, |step| step.check(true, "ok"))
    }));

    let err = session.run().expect_err("transport failure");
    assert!(format!("{err:#}").contains("connection refused"));
}

#[test]
fn empty_session_reports_no_tests() {
    let remote = Remote::new();
    let mut session = session(reporting_config("PRJ"), &remote);
    let summary = session.run().expect("run");
    assert_eq!(summary.exit_code, exit_codes::NO_TESTS);
    assert!(summary.reports.is_empty());
}

/// Step sub-records are appended to the item's details.
#[test]
fn details_include_step_records() {
    let remote = Remote::new().with_case("PRJ-T1", 2, Some("High"));
    let mut session = session(reporting_config("PRJ"), &remote);
    session.add_item(TestItem::new(item("test_T1"), |block| {
        block.step(1, |step| step.check(false, "first broken"))?;
        block.step(2, |step| step.check(false, "second broken"))
    }));

    let summary = session.run().expect("run");

    assert_eq!(summary.reports[0].outcome, Outcome::Failed);
    let details = &summary.reports[0].details;
    assert!(details.contains("tests/suite.rs::test_T1_1:"));
    assert!(details.contains("first broken"));
    assert!(details.contains("tests/suite.rs::test_T1_2:"));
    assert!(details.contains("second broken"));
    assert_eq!(summary.reports[0].priority.as_deref(), Some("High"));

    let report: SessionReport = summary.into();
    assert_eq!(report.test_run_keys, vec![RUN]);
    assert_eq!(report.items.len(), 1);
}

/// A blocked item reports its block reason only, without step sub-records.
#[test]
fn blocked_item_details_omit_step_records() {
    let remote = Remote::new().with_case("PRJ-T1", 2, None);
    let mut session = session(reporting_config("PRJ"), &remote);
    session.add_item(TestItem::new(item("test_T1"), |block| {
        block.step(1, |step| step.check(false, "first broken"))?;
        block.step(2, |step| step.check_or(false, "second blocked", Action::StopContext))
    }));

    let summary = session.run().expect("run");

    assert_eq!(summary.reports[0].outcome, Outcome::Blocked);
    let details = &summary.reports[0].details;
    assert!(!details.contains("test_T1_1"));
    assert!(!details.contains("test_T1_2"));
}

/// Non-skipped case reports carry CI traceability to the test case.
#[test]
fn case_reports_update_ci_traceability() {
    let remote = Remote::new().with_case("PRJ-T1", 1, None);
    let mut session = session(reporting_config("PRJ"), &remote);
    session.add_item(TestItem::new(item("test_T1"), |block| block.check(true, "ok")));

    session.run().expect("run");

    let updates = remote.case_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0, "PRJ-T1");
    assert_eq!(updates[0].1.labels, vec!["automated"]);
}

/// The finished session is persisted for the `summary` command.
#[test]
fn session_report_is_written() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join(".casetrace/session_report.json");
    let remote = Remote::new().with_case("PRJ-T1", 1, None);
    let mut session = session(reporting_config("PRJ"), &remote).with_report_path(&path);
    session.add_item(TestItem::new(item("test_T1"), |block| block.check(true, "ok")));

    let summary = session.run().expect("run");

    let report = casetrace::io::session_report::load_session_report(&path).expect("load");
    assert_eq!(report.exit_code, exit_codes::OK);
    assert_eq!(report.test_run_keys, vec![RUN]);
    assert_eq!(report.items, summary.reports);
}

/// `STOP_METHOD` skips the method's later steps; the next item runs normally.
#[test]
fn stop_method_isolates_the_method() {
    let remote = Remote::new()
        .with_case("PRJ-T1", 2, None)
        .with_case("PRJ-T2", 1, None);
    let mut session = session(reporting_config("PRJ"), &remote);
    let second_step_ran = Rc::new(Cell::new(false));
    let flag = Rc::clone(&second_step_ran);
    session.add_item(TestItem::new(item("test_T1"), move |block| {
        block.step(1, |step| {
            step.check_or(false, "no license server", Action::StopMethod)
        })?;
        block.step(2, |_| {
            flag.set(true);
            Ok(())
        })
    }));
    session.add_item(TestItem::new(item("test_T2"), |block| block.check(true, "ok")));

    let summary = session.run().expect("run");

    assert!(!second_step_ran.get());
    assert_eq!(remote.step_status(RUN, "PRJ-T1", 1), Some(Status::Blocked));
    assert_eq!(remote.step_status(RUN, "PRJ-T1", 2), Some(Status::NotExecuted));
    assert_eq!(remote.result(RUN, "PRJ-T1").expect("a").status, Status::Blocked);
    assert_eq!(summary.reports[0].outcome, Outcome::Blocked);
    assert_eq!(summary.reports[1].outcome, Outcome::Passed);
    assert_eq!(remote.result(RUN, "PRJ-T2").expect("b").status, Status::Pass);
}

/// A body sleeping past its budget is blocked and stops at the sleep.
#[test]
fn timed_out_item_is_blocked() {
    let remote = Remote::new().with_case("PRJ-T1", 0, None);
    let mut session = session(reporting_config("PRJ"), &remote);
    session
        .state_mut()
        .set_block_options(BlockOptions::default().with_timeout(short_timeout()));
    let finished = Rc::new(Cell::new(false));
    let flag = Rc::clone(&finished);
    session.add_item(TestItem::new(item("test_T1"), move |block| {
        block.sleep(Duration::from_secs(5))?;
        flag.set(true);
        Ok(())
    }));

    let summary = session.run().expect("run");

    assert!(!finished.get());
    assert_eq!(summary.reports[0].outcome, Outcome::Blocked);
    assert!(summary.reports[0].details.contains(TIMEOUT_MESSAGE));
    assert_eq!(remote.result(RUN, "PRJ-T1").expect("result").status, Status::Blocked);
}

/// Steps published by the step controller are marked done; the item record is not.
#[test]
fn published_steps_are_marked_done() {
    let remote = Remote::new().with_case("PRJ-T1", 2, None);
    let mut session = session(reporting_config("PRJ"), &remote);
    session.add_item(TestItem::new(item("test_T1"), |block| {
        block.step(1, |step| step.check(true, "one"))?;
        block.step(2, |step| step.check(true, "two"))
    }));

    session.run().expect("run");

    let registry = session.state().registry();
    for key in ["tests/suite.rs::test_T1_1", "tests/suite.rs::test_T1_2"] {
        assert!(registry.get(key).expect("step record").done, "{key}");
    }
    assert!(!registry.get("tests/suite.rs::test_T1").expect("item record").done);
}

/// Nothing is marked done when reporting is disabled.
#[test]
fn unpublished_steps_are_not_done() {
    let remote = Remote::new().with_case("PRJ-T1", 1, None);
    let config = ReporterConfig {
        enabled: false,
        ..reporting_config("PRJ")
    };
    let mut session = session(config, &remote);
    session.add_item(TestItem::new(item("test_T1"), |block| {
        block.step(1, |step| step.check(true, "one"))
    }));

    session.run().expect("run");

    let step = session
        .state()
        .registry()
        .get("tests/suite.rs::test_T1_1")
        .expect("step record");
    assert!(!step.done);
}

//! Test-management traceability helpers.
//!
//! Folds step statuses through the status lattice, prints the final status
//! line of a recorded session and shows the resolved reporter configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;

use casetrace::core::final_status::{FinalStatus, evaluate, status_line};
use casetrace::core::status::{Status, merge_statuses};
use casetrace::exit_codes;
use casetrace::io::config::{DEFAULT_CONFIG_PATH, ReporterConfig, load_config, write_config};
use casetrace::io::session_report::{DEFAULT_REPORT_PATH, load_session_report};
use casetrace::logging;

#[derive(Parser)]
#[command(
    name = "casetrace",
    version,
    about = "Step result aggregation and reporting for test-management runs"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the aggregate of the given step statuses (e.g. "Pass" "Not Executed").
    Merge {
        #[arg(required = true, value_parser = parse_status)]
        statuses: Vec<Status>,
    },
    /// Print the final status line of a recorded session.
    Summary {
        #[arg(long, default_value = DEFAULT_REPORT_PATH)]
        report: PathBuf,
        /// Override the exit status recorded in the report.
        #[arg(long)]
        exit_status: Option<i32>,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        plan: Option<String>,
        #[arg(long)]
        run: Vec<String>,
    },
    /// Print the resolved reporter configuration as TOML.
    Config {
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        path: PathBuf,
        /// Write the default configuration if the file does not exist.
        #[arg(long)]
        init: bool,
    },
}

fn parse_status(value: &str) -> Result<Status, String> {
    value.parse()
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INTERNAL_ERROR);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Merge { statuses } => {
            println!("{}", merge_statuses(statuses));
            Ok(exit_codes::OK)
        }
        Command::Summary {
            report,
            exit_status,
            project,
            plan,
            run,
        } => cmd_summary(&report, exit_status, project, plan, run),
        Command::Config { path, init } => cmd_config(&path, init),
    }
}

fn cmd_summary(
    path: &Path,
    exit_status: Option<i32>,
    project: Option<String>,
    plan: Option<String>,
    runs: Vec<String>,
) -> Result<i32> {
    let report = load_session_report(path)?;
    let exit_code = exit_status.unwrap_or(report.exit_code);
    let mut targets = report.targets();
    if project.is_some() {
        targets.project_key = project;
    }
    if plan.is_some() {
        targets.test_plan_key = plan;
    }
    if !runs.is_empty() {
        targets.test_run_keys = runs;
    }
    let verdict = evaluate(&report.items, exit_code);
    debug!(status = verdict.status.as_str(), "evaluated session");
    println!("{}", status_line(&verdict, &targets, exit_code));
    Ok(summary_exit_code(verdict.status))
}

/// Exit code of `summary` for a final status.
fn summary_exit_code(status: FinalStatus) -> i32 {
    match status {
        FinalStatus::Success => exit_codes::OK,
        FinalStatus::Unstable | FinalStatus::Failure => exit_codes::TESTS_FAILED,
        FinalStatus::Aborted => exit_codes::INTERRUPTED,
        FinalStatus::NotBuilt => exit_codes::NO_TESTS,
    }
}

fn cmd_config(path: &Path, init: bool) -> Result<i32> {
    if init && !path.exists() {
        write_config(path, &ReporterConfig::default())
            .with_context(|| format!("initialize {}", path.display()))?;
    }
    let cfg = match load_config(path) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("{err:#}");
            return Ok(exit_codes::USAGE_ERROR);
        }
    };
    print!("{}", toml::to_string_pretty(&cfg).context("serialize config toml")?);
    Ok(exit_codes::OK)
}

//! Step-result aggregation and execution control for test-management traceability.
//!
//! Test items run inside step controllers ([`meta_block`]) that classify
//! every check, abort, block, skip or timeout and push step and case results
//! to a remote test-management service. The architecture keeps a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (status lattice, registry, comments,
//!   selection, final status). No I/O, fully testable in isolation.
//! - **[`io`]**: Side effects and seams (remote service trait, configuration,
//!   CI metadata, git, session report files).
//!
//! Orchestration modules ([`meta_block`], [`report_sync`], [`coordinator`],
//! [`session`]) combine both to execute and report a session.

pub mod coordinator;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod meta_block;
pub mod report_sync;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

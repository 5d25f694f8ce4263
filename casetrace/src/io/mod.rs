//! I/O seams for reporting: remote service, configuration, CI metadata, files.

pub mod ci;
pub mod config;
pub mod git;
pub mod process;
pub mod remote;
pub mod session_report;

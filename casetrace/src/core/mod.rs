//! Deterministic, pure logic shared by the step controller and reporting.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod comment;
pub mod final_status;
pub mod markers;
pub mod refresh;
pub mod registry;
pub mod selection;
pub mod status;
pub mod template;
pub mod types;

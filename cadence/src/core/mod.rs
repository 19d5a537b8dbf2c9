//! Deterministic, pure logic shared by the scheduler.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! records and return deterministic outputs suitable for tests.

pub mod complexity;
pub mod graph;
pub mod resolver;
pub mod transitions;
pub mod types;

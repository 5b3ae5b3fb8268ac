//! Deterministic, pure logic shared by the evaluator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod cache_validation;
pub mod command;
pub mod invariants;
pub mod normalize;
pub mod path;
pub mod sanitize;
pub mod types;

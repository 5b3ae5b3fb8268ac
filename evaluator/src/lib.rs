//! Evidence-backed evaluation of user stories against a repository checkout.
//!
//! A model investigates the repository through a small set of read-only tools
//! and answers with a verdict backed by file-and-line evidence. The crate
//! enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (types, invariants, path
//!   containment, command policy, cache validation, normalization). No I/O.
//! - **[`io`]**: Side-effecting adapters behind traits (sandbox, model, docs,
//!   cache store, result persistence, prompts, trace artifacts).
//! - **[`tools`]**: The closed set of tools the model may call.
//!
//! Orchestration modules ([`tool_loop`], [`cache`], [`evaluate`], [`batch`])
//! coordinate core logic with I/O to implement evaluations.

pub mod batch;
pub mod cache;
pub mod contract;
pub mod core;
pub mod evaluate;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tool_loop;
pub mod tools;

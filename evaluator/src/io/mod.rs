//! I/O adapters for the evaluation loop.

pub mod cache_store;
pub mod config;
pub mod docs;
pub mod model;
pub mod process;
pub mod prompt;
pub mod results;
pub mod sandbox;
pub mod trace_log;

//! Stable exit codes for evaluator CLI commands.

use crate::core::types::AnalysisStatus;

/// Command succeeded, or every evaluated story passed.
pub const OK: i32 = 0;
/// Command failed due to invalid input/config or other errors.
pub const INVALID: i32 = 1;
/// At least one story failed.
pub const FAIL: i32 = 2;
/// At least one story is blocked (and none failed).
pub const BLOCKED: i32 = 3;
/// At least one evaluation ended with an `error` verdict.
pub const ERROR: i32 = 4;

/// Exit code for a single terminal status.
pub fn for_status(status: AnalysisStatus) -> i32 {
    match status {
        AnalysisStatus::Pass => OK,
        AnalysisStatus::Fail => FAIL,
        AnalysisStatus::Blocked | AnalysisStatus::Running => BLOCKED,
        AnalysisStatus::Error => ERROR,
    }
}

/// Exit code for several stories: `error` beats `fail` beats `blocked`.
pub fn for_statuses(statuses: impl IntoIterator<Item = AnalysisStatus>) -> i32 {
    statuses
        .into_iter()
        .map(for_status)
        .max_by_key(|code| match *code {
            ERROR => 3,
            FAIL => 2,
            BLOCKED => 1,
            _ => 0,
        })
        .unwrap_or(OK)
}

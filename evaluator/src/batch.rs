//! Sequential evaluation of several stories against one sandbox.
//!
//! A sandbox is a stateful resource that supports one tool call at a time, so
//! stories run strictly one after another.

use anyhow::Result;
use tracing::{info, warn};

use crate::core::types::{AnalysisStatus, EvaluationRequest};
use crate::evaluate::{EvaluationDeps, EvaluationOutcome, run_evaluation};
use crate::io::config::EvaluatorConfig;

/// Per-story result of a batch. A propagated error does not stop the batch.
#[derive(Debug)]
pub struct StoryReport {
    pub story_id: String,
    pub outcome: Result<EvaluationOutcome>,
}

impl StoryReport {
    /// Terminal status, or `None` when the evaluation itself failed.
    pub fn status(&self) -> Option<AnalysisStatus> {
        self.outcome.as_ref().ok().map(EvaluationOutcome::status)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub pass: usize,
    pub fail: usize,
    pub blocked: usize,
    pub error: usize,
    /// Evaluations that returned an error instead of a result.
    pub failed: usize,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub reports: Vec<StoryReport>,
}

impl BatchOutcome {
    pub fn summary(&self) -> BatchSummary {
        let mut summary = BatchSummary::default();
        for report in &self.reports {
            match report.status() {
                Some(AnalysisStatus::Pass) => summary.pass += 1,
                Some(AnalysisStatus::Fail) => summary.fail += 1,
                Some(AnalysisStatus::Blocked | AnalysisStatus::Running) => summary.blocked += 1,
                Some(AnalysisStatus::Error) => summary.error += 1,
                None => summary.failed += 1,
            }
        }
        summary
    }
}

/// Evaluate `requests` in order with concurrency 1.
///
/// `on_story` runs after each story, whether or not it succeeded.
pub fn evaluate_stories<F: FnMut(&StoryReport)>(
    requests: &[EvaluationRequest],
    deps: &EvaluationDeps<'_>,
    config: &EvaluatorConfig,
    mut on_story: F,
) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();
    for (index, request) in requests.iter().enumerate() {
        info!(
            story_id = %request.story.id,
            position = index + 1,
            total = requests.len(),
            "batch evaluation"
        );
        let result = run_evaluation(request, deps, config);
        if let Err(err) = &result {
            warn!(
                story_id = %request.story.id,
                error = %format!("{err:#}"),
                "story evaluation failed"
            );
        }
        let report = StoryReport {
            story_id: request.story.id.clone(),
            outcome: result,
        };
        on_story(&report);
        outcome.reports.push(report);
    }
    let summary = outcome.summary();
    info!(
        pass = summary.pass,
        fail = summary.fail,
        blocked = summary.blocked,
        error = summary.error,
        failed = summary.failed,
        "batch finished"
    );
    outcome
}

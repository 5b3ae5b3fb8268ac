//! Semantic invariants not expressible via JSON Schema.

use crate::core::types::{AnswerAnalysis, EvidenceItem, ModelAnswer};

/// Check answer invariants the output schema cannot express:
/// - Non-blank explanation
/// - Non-blank evidence file paths
/// - `start_line <= end_line` when both are present
///
/// Evidence presence for `pass`/`fail` is not checked here; the
/// normalizer downgrades unsupported verdicts instead of rejecting the run.
pub fn validate_answer(answer: &ModelAnswer) -> Vec<String> {
    let mut errors = Vec::new();
    if let Some(analysis) = &answer.analysis {
        validate_analysis(analysis, &mut errors);
    }
    errors
}

fn validate_analysis(analysis: &AnswerAnalysis, errors: &mut Vec<String>) {
    if analysis.explanation.trim().is_empty() {
        errors.push("analysis.explanation must not be blank".to_string());
    }
    for (index, item) in analysis.evidence.iter().enumerate() {
        errors.extend(validate_evidence(item).into_iter().map(|err| {
            format!("analysis.evidence[{index}]: {err}")
        }));
    }
}

/// Check a single evidence item.
pub fn validate_evidence(item: &EvidenceItem) -> Vec<String> {
    let mut errors = Vec::new();
    if item.file_path.trim().is_empty() {
        errors.push("filePath must not be blank".to_string());
    }
    if let (Some(start), Some(end)) = (item.start_line, item.end_line)
        && start > end
    {
        errors.push(format!("startLine {start} exceeds endLine {end}"));
    }
    if item.start_line == Some(0) || item.end_line == Some(0) {
        errors.push("line numbers are 1-based".to_string());
    }
    errors
}

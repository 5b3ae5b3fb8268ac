//! Conversion of a validated model answer into the persisted result row.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::core::types::{
    ANALYSIS_VERSION, AnalysisResult, AnalysisStatus, Conclusion, EvidenceItem, ModelAnswer,
    StepAnalysis, StoryTestResult,
};

pub const MISSING_ANALYSIS_EXPLANATION: &str =
    "Model did not supply analysis; no findings were recorded for this evaluation.";

/// ISO-8601 with millisecond precision, UTC `Z` suffix.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// The row inserted when an evaluation starts.
pub fn running_placeholder(started_at: DateTime<Utc>) -> StoryTestResult {
    StoryTestResult {
        status: AnalysisStatus::Running,
        analysis_version: ANALYSIS_VERSION,
        analysis: None,
        started_at: format_timestamp(started_at),
        completed_at: None,
        duration_ms: None,
        metadata: None,
    }
}

/// Build the storage payload for a finished evaluation.
///
/// - `completed_at` earlier than `started_at` is clamped, so `duration_ms` is
///   never negative and always equals the difference of the two timestamps.
/// - `running` answers are stored without analysis.
/// - terminal answers always carry a non-blank explanation; a missing analysis
///   gets a placeholder.
/// - a `pass`/`fail` verdict with no evidence is downgraded to `blocked`.
pub fn normalize_story_test_result(
    answer: &ModelAnswer,
    story_name: &str,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
) -> StoryTestResult {
    let completed_at = completed_at.max(started_at);
    let duration_ms = completed_at.timestamp_millis() - started_at.timestamp_millis();

    let (status, analysis) = match answer.status {
        AnalysisStatus::Running => (AnalysisStatus::Running, None),
        status => {
            let analysis = normalize_analysis(answer, status, story_name);
            (analysis.status, Some(analysis))
        }
    };

    StoryTestResult {
        status,
        analysis_version: ANALYSIS_VERSION,
        analysis,
        started_at: format_timestamp(started_at),
        completed_at: Some(format_timestamp(completed_at)),
        duration_ms: Some(u64::try_from(duration_ms).unwrap_or(0)),
        metadata: None,
    }
}

fn normalize_analysis(
    answer: &ModelAnswer,
    status: AnalysisStatus,
    story_name: &str,
) -> AnalysisResult {
    let Some(raw) = &answer.analysis else {
        let status = if status.is_verdict() {
            AnalysisStatus::Blocked
        } else {
            status
        };
        return AnalysisResult {
            version: ANALYSIS_VERSION,
            status,
            explanation: MISSING_ANALYSIS_EXPLANATION.to_string(),
            evidence: Vec::new(),
            steps: None,
        };
    };

    let mut explanation = raw.explanation.trim().to_string();
    if explanation.is_empty() {
        explanation = MISSING_ANALYSIS_EXPLANATION.to_string();
    }

    let mut status = status;
    if status.is_verdict() && raw.evidence.is_empty() {
        explanation = format!(
            "Model concluded '{}' without citing any evidence, so the verdict cannot be trusted. Model explanation: {explanation}",
            status.as_str()
        );
        status = AnalysisStatus::Blocked;
    }

    let steps = derive_steps(&raw.evidence, story_name);
    AnalysisResult {
        version: ANALYSIS_VERSION,
        status,
        explanation,
        evidence: raw.evidence.clone(),
        steps: (!steps.is_empty()).then_some(steps),
    }
}

/// Group evidence by `step` in first-appearance order.
///
/// Items without a `step` belong to an implicit step named after the story. A
/// step fails when any of its evidence fails.
pub fn derive_steps(evidence: &[EvidenceItem], story_name: &str) -> Vec<StepAnalysis> {
    let mut steps: Vec<StepAnalysis> = Vec::new();
    for item in evidence {
        let name = item.step.as_deref().unwrap_or(story_name);
        let index = match steps.iter().position(|step| step.step == name) {
            Some(index) => index,
            None => {
                steps.push(StepAnalysis {
                    index: steps.len(),
                    step: name.to_string(),
                    conclusion: Conclusion::Pass,
                    evidence: Vec::new(),
                });
                steps.len() - 1
            }
        };
        let step = &mut steps[index];
        if item.conclusion == Conclusion::Fail {
            step.conclusion = Conclusion::Fail;
        }
        step.evidence.push(item.clone());
    }
    steps
}

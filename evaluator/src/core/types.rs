//! Shared deterministic types for story evaluation.
//!
//! These types define the stable contracts between the tool loop, the evidence
//! cache and the persistence gateway. Field names serialize in camelCase because
//! the persisted payloads are consumed by non-Rust callers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Canonical analysis schema version. Answers tagged with any other version are
/// rejected by the output contract.
pub const ANALYSIS_VERSION: u32 = 3;

/// Per-evidence verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Conclusion {
    Pass,
    Fail,
}

/// Overall status of a story evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Pass,
    Fail,
    Blocked,
    Error,
    Running,
}

impl AnalysisStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisStatus::Pass => "pass",
            AnalysisStatus::Fail => "fail",
            AnalysisStatus::Blocked => "blocked",
            AnalysisStatus::Error => "error",
            AnalysisStatus::Running => "running",
        }
    }

    /// Everything except `running`.
    pub fn is_terminal(self) -> bool {
        self != AnalysisStatus::Running
    }

    /// `pass` and `fail` are the only statuses that assert something about the
    /// repository, and therefore the only ones that require evidence.
    pub fn is_verdict(self) -> bool {
        matches!(self, AnalysisStatus::Pass | AnalysisStatus::Fail)
    }
}

/// A user story under evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub id: String,
    pub name: String,
    pub text: String,
    pub repo_id: String,
    pub branch_name: String,
    pub commit_sha: Option<String>,
}

/// Repository identity as known to the metadata provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoIdentity {
    pub id: String,
    /// `{owner}/{repo}`.
    pub slug: String,
}

/// One evaluation attempt. Ephemeral; never persisted directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationRequest {
    pub story: Story,
    pub repo: RepoIdentity,
    pub run_id: Option<String>,
    /// Identifier of the sandbox the repository was materialized in.
    pub sandbox_id: String,
    pub model_id: String,
    pub max_steps: u32,
}

/// A concrete, re-verifiable code location backing part of a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceItem {
    /// Gherkin-style requirement this evidence belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    pub file_path: String,
    #[serde(default)]
    pub start_line: Option<u32>,
    #[serde(default)]
    pub end_line: Option<u32>,
    pub note: String,
    pub conclusion: Conclusion,
}

/// Evidence grouped under one story step, in discovery order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepAnalysis {
    pub index: usize,
    pub step: String,
    pub conclusion: Conclusion,
    pub evidence: Vec<EvidenceItem>,
}

/// Storage-ready analysis for a terminal evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub version: u32,
    pub status: AnalysisStatus,
    pub explanation: String,
    /// Ordered by discovery; never re-sorted.
    #[serde(default)]
    pub evidence: Vec<EvidenceItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<StepAnalysis>>,
}

/// The structured final answer the model must produce to end the loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelAnswer {
    pub status: AnalysisStatus,
    #[serde(default)]
    pub analysis: Option<AnswerAnalysis>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerAnalysis {
    pub version: u32,
    pub explanation: String,
    #[serde(default)]
    pub evidence: Vec<EvidenceItem>,
}

impl ModelAnswer {
    /// Build an answer synthesized by the evaluator rather than the model.
    pub fn synthesized(
        status: AnalysisStatus,
        explanation: impl Into<String>,
        evidence: Vec<EvidenceItem>,
    ) -> Self {
        Self {
            status,
            analysis: Some(AnswerAnalysis {
                version: ANALYSIS_VERSION,
                explanation: explanation.into(),
                evidence,
            }),
        }
    }

    pub fn evidence(&self) -> &[EvidenceItem] {
        self.analysis
            .as_ref()
            .map(|analysis| analysis.evidence.as_slice())
            .unwrap_or(&[])
    }
}

/// Why the tool loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The model produced a valid structured answer.
    Answer,
    /// The model produced an answer that failed the output contract.
    InvalidAnswer,
    /// The step budget ran out before an answer was produced.
    StepBudgetExhausted,
    /// Evidence was served entirely from the cache; no loop ran.
    Cached,
    /// A loop-fatal infrastructure failure ended the evaluation.
    Aborted,
}

/// How the evidence cache contributed to an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheUsage {
    Disabled,
    Miss,
    Partial,
    Hit,
}

/// Agent bookkeeping attached to a persisted result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetadata {
    pub model_id: String,
    pub finish_reason: FinishReason,
    pub step_count: u32,
    pub tool_call_count: u32,
    pub cache: CacheUsage,
}

/// Persisted row for one story evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryTestResult {
    pub status: AnalysisStatus,
    pub analysis_version: u32,
    pub analysis: Option<AnalysisResult>,
    /// ISO-8601.
    pub started_at: String,
    pub completed_at: Option<String>,
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<AgentMetadata>,
}

/// Previously verified evidence for one (story, commit) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub id: String,
    pub story_id: String,
    pub commit_sha: String,
    pub branch_name: String,
    /// SHA-256 of the story text the evidence was gathered for.
    pub story_text_hash: String,
    /// Verdict the evidence supported; only `pass` and `fail` are cached.
    pub status: AnalysisStatus,
    pub explanation: String,
    pub cache_data: CacheData,
    pub run_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheData {
    /// Keyed by step index.
    pub steps: BTreeMap<usize, CachedStep>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedStep {
    pub step: String,
    /// Keyed by assertion index within the step.
    pub assertions: BTreeMap<usize, CachedAssertion>,
}

/// One evidence item together with the content hashes it was verified against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedAssertion {
    pub evidence: EvidenceItem,
    /// File path to SHA-256 hex digest at cache-write time.
    pub file_hashes: BTreeMap<String, String>,
    /// Index of this evidence item in the verdict's evidence list.
    #[serde(default)]
    pub position: usize,
}

/// Outcome of re-hashing the files a cache entry depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    pub invalid_steps: Vec<usize>,
    pub invalid_assertions: Vec<AssertionRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertionRef {
    pub step_index: usize,
    pub assertion_index: usize,
}

/// How a single tool dispatch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceOutcome {
    /// The tool ran; its output (possibly a non-zero exit) went to the model.
    Ok,
    /// The call was refused before execution (schema, path or policy).
    Rejected,
    /// The tool failed recoverably, or fatally when it is the last entry.
    Error,
}

/// Durable, size-capped record of one tool dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolTraceEntry {
    /// 1-based generation round that issued the call.
    pub step: u32,
    pub tool: String,
    pub input: serde_json::Value,
    pub output: String,
    pub outcome: TraceOutcome,
}

/// One line per generation round for human reviewers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSummary {
    pub iteration: u32,
    pub action: String,
    pub notes: String,
}

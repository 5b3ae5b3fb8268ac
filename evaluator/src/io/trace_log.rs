//! Evaluation artifacts under `{results_dir}/{result_id}/`.
//!
//! These are product output for reviewers and are always written, independent
//! of `RUST_LOG`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::types::{
    AnalysisStatus, CacheUsage, FinishReason, StepSummary, StoryTestResult, ToolTraceEntry,
};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationMeta {
    pub result_id: String,
    pub story_id: String,
    pub run_id: Option<String>,
    pub repo_slug: String,
    pub model_id: String,
    pub status: AnalysisStatus,
    pub finish_reason: FinishReason,
    pub cache: CacheUsage,
    pub step_count: u32,
    pub tool_call_count: u32,
    pub rejected_tool_calls: u32,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct EvaluationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub output_path: PathBuf,
    pub trace_path: PathBuf,
    pub steps_path: PathBuf,
}

impl EvaluationPaths {
    pub fn new(results_dir: &Path, result_id: &str) -> Self {
        let dir = results_dir.join(result_id);
        Self {
            dir: dir.clone(),
            meta_path: dir.join("meta.json"),
            output_path: dir.join("output.json"),
            trace_path: dir.join("trace.json"),
            steps_path: dir.join("steps.json"),
        }
    }
}

pub struct TraceWriteRequest<'a> {
    pub results_dir: &'a Path,
    pub meta: &'a EvaluationMeta,
    pub output: &'a StoryTestResult,
    pub trace: &'a [ToolTraceEntry],
    pub steps: &'a [StepSummary],
}

pub fn write_trace(request: &TraceWriteRequest<'_>) -> Result<EvaluationPaths> {
    let paths = EvaluationPaths::new(request.results_dir, &request.meta.result_id);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create evaluation dir {}", paths.dir.display()))?;

    // Write in deterministic order to keep logs stable.
    write_json(&paths.meta_path, request.meta)?;
    write_json(&paths.output_path, request.output)?;
    write_json(&paths.trace_path, &request.trace)?;
    write_json(&paths.steps_path, &request.steps)?;

    Ok(paths)
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::normalize::running_placeholder;
    use crate::core::types::TraceOutcome;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn evaluation_paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = EvaluationPaths::new(temp.path(), "story-1-20260101");

        assert!(paths.dir.ends_with("story-1-20260101"));
        assert!(paths.meta_path.ends_with("meta.json"));
        assert!(paths.output_path.ends_with("output.json"));
        assert!(paths.trace_path.ends_with("trace.json"));
        assert!(paths.steps_path.ends_with("steps.json"));
    }

    #[test]
    fn writes_all_artifacts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let output = running_placeholder(Utc::now());
        let meta = EvaluationMeta {
            result_id: "r1".to_string(),
            story_id: "story-1".to_string(),
            run_id: None,
            repo_slug: "acme/web".to_string(),
            model_id: "gpt-5-mini".to_string(),
            status: AnalysisStatus::Blocked,
            finish_reason: FinishReason::StepBudgetExhausted,
            cache: CacheUsage::Miss,
            step_count: 3,
            tool_call_count: 2,
            rejected_tool_calls: 0,
            started_at: output.started_at.clone(),
            completed_at: None,
            duration_ms: None,
        };
        let trace = vec![ToolTraceEntry {
            step: 1,
            tool: "readFile".to_string(),
            input: json!({"path": "src/a.ts"}),
            output: "export {}".to_string(),
            outcome: TraceOutcome::Ok,
        }];

        let paths = write_trace(&TraceWriteRequest {
            results_dir: temp.path(),
            meta: &meta,
            output: &output,
            trace: &trace,
            steps: &[],
        })
        .expect("write trace");

        assert!(paths.meta_path.is_file());
        assert!(paths.output_path.is_file());
        let written = fs::read_to_string(&paths.trace_path).expect("read");
        assert!(written.contains("\"tool\": \"readFile\""));
        assert!(paths.steps_path.is_file());
    }
}

//! Orchestration for a single story evaluation.
//!
//! Order of operations: insert the running placeholder, consult the evidence
//! cache, run the tool loop (fully, partially, or not at all), merge with
//! retained evidence, normalize, persist, write the trace, refresh the cache.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use tracing::{Span, error, info, info_span, warn};

use crate::cache::{
    CacheLookup, build_cache_entry, build_evidence_hash_map, cached_answer,
    lookup_and_validate_cache, merge_partial, partition_steps, write_cache_best_effort,
};
use crate::contract::OutputContract;
use crate::core::normalize::{format_timestamp, normalize_story_test_result, running_placeholder};
use crate::core::types::{
    AgentMetadata, AnalysisResult, AnalysisStatus, CacheEntry, CacheUsage, EvaluationRequest,
    FinishReason, ModelAnswer, StoryTestResult,
};
use crate::io::cache_store::EvidenceCacheStore;
use crate::io::config::EvaluatorConfig;
use crate::io::docs::DocsProvider;
use crate::io::model::ModelClient;
use crate::io::results::ResultSink;
use crate::io::sandbox::Sandbox;
use crate::io::trace_log::{EvaluationMeta, EvaluationPaths, TraceWriteRequest, write_trace};
use crate::tool_loop::{
    LoopCollaborators, LoopFatalError, LoopInputs, LoopMetrics, LoopRecord, LoopSettings,
    run_tool_loop,
};
use crate::tools::ToolSet;

/// External collaborators for one evaluation.
pub struct EvaluationDeps<'a> {
    pub model: &'a dyn ModelClient,
    pub sandbox: &'a dyn Sandbox,
    pub docs: &'a dyn DocsProvider,
    /// `None` disables the evidence cache.
    pub cache: Option<&'a dyn EvidenceCacheStore>,
    pub sink: &'a dyn ResultSink,
}

/// Per-evaluation telemetry handle. Everything the evaluation logs happens
/// inside this span.
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    span: Span,
}

impl EvaluationContext {
    pub fn new(request: &EvaluationRequest) -> Self {
        let span = info_span!(
            "evaluation",
            story_id = %request.story.id,
            run_id = request.run_id.as_deref().unwrap_or("-"),
            repo = %request.repo.slug,
            model_id = %request.model_id,
        );
        Self { span }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

#[derive(Debug, Clone)]
pub struct EvaluationOutcome {
    pub result_id: String,
    pub result: StoryTestResult,
    pub finish_reason: FinishReason,
    pub cache: CacheUsage,
    pub metrics: LoopMetrics,
    pub paths: EvaluationPaths,
}

impl EvaluationOutcome {
    pub fn status(&self) -> AnalysisStatus {
        self.result.status
    }

    pub fn analysis(&self) -> Option<&AnalysisResult> {
        self.result.analysis.as_ref()
    }
}

struct Investigation {
    answer: ModelAnswer,
    finish_reason: FinishReason,
    cache: CacheUsage,
    record: LoopRecord,
    previous: Option<CacheEntry>,
}

/// Evaluate one story end to end.
///
/// Loop-fatal failures end as a persisted `error` verdict. Other failures mark
/// the placeholder row as `error` and are returned.
pub fn run_evaluation(
    request: &EvaluationRequest,
    deps: &EvaluationDeps<'_>,
    config: &EvaluatorConfig,
) -> Result<EvaluationOutcome> {
    let ctx = EvaluationContext::new(request);
    let _entered = ctx.span().enter();

    if request.max_steps == 0 {
        bail!("max_steps must be at least 1");
    }
    if deps.sandbox.id() != request.sandbox_id {
        bail!(
            "sandbox mismatch: request names {} but handle is {}",
            request.sandbox_id,
            deps.sandbox.id()
        );
    }

    let started_at = Utc::now();
    let result_id = deps
        .sink
        .begin(
            &request.story,
            request.run_id.as_deref(),
            &running_placeholder(started_at),
        )
        .context("insert running result")?;
    info!(result_id = %result_id, "evaluation started");

    let investigation = match investigate(request, deps, config) {
        Ok(investigation) => investigation,
        Err(err) => match err.downcast::<LoopFatalError>() {
            Ok(fatal) => Investigation {
                answer: ModelAnswer::synthesized(
                    AnalysisStatus::Error,
                    format!("Evaluation aborted: {}", fatal.message),
                    Vec::new(),
                ),
                finish_reason: FinishReason::Aborted,
                cache: if cache_store(deps, config).is_some() {
                    CacheUsage::Miss
                } else {
                    CacheUsage::Disabled
                },
                record: fatal.record,
                previous: None,
            },
            Err(err) => {
                mark_failed(deps.sink, &result_id, &request.story.name, started_at, &err);
                return Err(err);
            }
        },
    };

    let completed_at = Utc::now();
    let mut result = normalize_story_test_result(
        &investigation.answer,
        &request.story.name,
        started_at,
        completed_at,
    );
    let metrics = investigation.record.metrics;
    result.metadata = Some(AgentMetadata {
        model_id: request.model_id.clone(),
        finish_reason: investigation.finish_reason,
        step_count: metrics.step_count,
        tool_call_count: metrics.tool_call_count,
        cache: investigation.cache,
    });

    deps.sink
        .complete(&result_id, &result)
        .context("update result")?;
    info!(
        status = result.status.as_str(),
        finish_reason = ?investigation.finish_reason,
        cache = ?investigation.cache,
        duration_ms = result.duration_ms.unwrap_or(0),
        "evaluation finished"
    );

    let meta = EvaluationMeta {
        result_id: result_id.clone(),
        story_id: request.story.id.clone(),
        run_id: request.run_id.clone(),
        repo_slug: request.repo.slug.clone(),
        model_id: request.model_id.clone(),
        status: result.status,
        finish_reason: investigation.finish_reason,
        cache: investigation.cache,
        step_count: metrics.step_count,
        tool_call_count: metrics.tool_call_count,
        rejected_tool_calls: metrics.rejected_tool_calls,
        started_at: result.started_at.clone(),
        completed_at: result.completed_at.clone(),
        duration_ms: result.duration_ms,
    };
    let paths = write_trace(&TraceWriteRequest {
        results_dir: &config.results_dir,
        meta: &meta,
        output: &result,
        trace: &investigation.record.trace,
        steps: &investigation.record.steps,
    })?;

    if investigation.cache != CacheUsage::Hit {
        refresh_cache(request, deps, config, &result, investigation.previous.as_ref());
    }

    Ok(EvaluationOutcome {
        result_id,
        result,
        finish_reason: investigation.finish_reason,
        cache: investigation.cache,
        metrics,
        paths,
    })
}

fn investigate(
    request: &EvaluationRequest,
    deps: &EvaluationDeps<'_>,
    config: &EvaluatorConfig,
) -> Result<Investigation> {
    let tools = ToolSet::new()?;
    let contract = OutputContract::new()?;
    let settings = LoopSettings::from_config(config, request.max_steps);
    let collab = LoopCollaborators {
        model: deps.model,
        sandbox: deps.sandbox,
        docs: deps.docs,
        tools: &tools,
        contract: &contract,
    };
    let story = &request.story;
    let mut inputs = LoopInputs {
        story,
        repo: &request.repo,
        run_id: request.run_id.as_deref(),
        model_id: &request.model_id,
        retained: &[],
        focus: &[],
    };

    let (store, commit_sha) = match (cache_store(deps, config), story.commit_sha.as_deref()) {
        (Some(store), Some(commit_sha)) => (store, commit_sha),
        _ => {
            let outcome = run_tool_loop(&inputs, &collab, &settings)?;
            return Ok(Investigation {
                answer: outcome.answer,
                finish_reason: outcome.finish_reason,
                cache: CacheUsage::Disabled,
                record: outcome.record,
                previous: None,
            });
        }
    };

    let lookup =
        lookup_and_validate_cache(store, story, commit_sha, deps.sandbox, &config.workspace_dir);
    let CacheLookup::Hit { entry, validation } = lookup else {
        let outcome = run_tool_loop(&inputs, &collab, &settings)?;
        return Ok(Investigation {
            answer: outcome.answer,
            finish_reason: outcome.finish_reason,
            cache: CacheUsage::Miss,
            record: outcome.record,
            previous: None,
        });
    };

    if validation.is_valid {
        info!("all cached evidence still valid; skipping the tool loop");
        return Ok(Investigation {
            answer: cached_answer(&entry),
            finish_reason: FinishReason::Cached,
            cache: CacheUsage::Hit,
            record: LoopRecord::default(),
            previous: Some(entry),
        });
    }

    let (retained, focus) = partition_steps(&entry, &validation);
    if retained.is_empty() {
        info!("no cached step survived validation; running a full evaluation");
        let outcome = run_tool_loop(&inputs, &collab, &settings)?;
        return Ok(Investigation {
            answer: outcome.answer,
            finish_reason: outcome.finish_reason,
            cache: CacheUsage::Miss,
            record: outcome.record,
            previous: Some(entry),
        });
    }

    info!(
        retained = retained.len(),
        focus = focus.len(),
        "re-evaluating invalidated steps"
    );
    inputs.retained = &retained;
    inputs.focus = &focus;
    let outcome = run_tool_loop(&inputs, &collab, &settings)?;
    let answer = merge_partial(&entry, &validation, &outcome.answer, &story.name);
    Ok(Investigation {
        answer,
        finish_reason: outcome.finish_reason,
        cache: CacheUsage::Partial,
        record: outcome.record,
        previous: Some(entry),
    })
}

fn cache_store<'a>(
    deps: &EvaluationDeps<'a>,
    config: &EvaluatorConfig,
) -> Option<&'a dyn EvidenceCacheStore> {
    deps.cache.filter(|_| config.cache.enabled)
}

/// Store fresh `pass`/`fail` evidence. Never fails the evaluation.
fn refresh_cache(
    request: &EvaluationRequest,
    deps: &EvaluationDeps<'_>,
    config: &EvaluatorConfig,
    result: &StoryTestResult,
    previous: Option<&CacheEntry>,
) {
    let (Some(store), Some(commit_sha)) = (
        cache_store(deps, config),
        request.story.commit_sha.as_deref(),
    ) else {
        return;
    };
    let Some(analysis) = result
        .analysis
        .as_ref()
        .filter(|analysis| analysis.status.is_verdict())
    else {
        return;
    };

    let hashes =
        match build_evidence_hash_map(&analysis.evidence, deps.sandbox, &config.workspace_dir) {
            Ok(hashes) => hashes,
            Err(err) => {
                warn!(error = %err, "could not hash evidence; cache not updated");
                return;
            }
        };
    let Some(entry) = build_cache_entry(
        &request.story,
        commit_sha,
        request.run_id.as_deref(),
        analysis,
        &hashes,
        previous,
        Utc::now(),
    ) else {
        warn!("evidence cites files that could not be hashed; cache not updated");
        return;
    };
    write_cache_best_effort(store, &entry);
}

/// Best effort: the original error is what the caller sees.
fn mark_failed(
    sink: &dyn ResultSink,
    result_id: &str,
    story_name: &str,
    started_at: DateTime<Utc>,
    err: &anyhow::Error,
) {
    let answer = ModelAnswer::synthesized(
        AnalysisStatus::Error,
        format!("Evaluation failed: {err:#}"),
        Vec::new(),
    );
    let result = normalize_story_test_result(&answer, story_name, started_at, Utc::now());
    if let Err(update_err) = sink.complete(result_id, &result) {
        error!(
            result_id,
            started_at = %format_timestamp(started_at),
            error = %format!("{update_err:#}"),
            "could not mark result as failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Conclusion;
    use crate::io::docs::NoDocs;
    use crate::io::sandbox::SandboxError;
    use crate::test_support::{
        MemoryCacheStore, MemoryResultSink, MemorySandbox, ScriptedModel, answer_turn, evidence,
        request, tool_turn,
    };
    use serde_json::json;

    fn config(results_dir: &std::path::Path) -> EvaluatorConfig {
        EvaluatorConfig {
            results_dir: results_dir.to_path_buf(),
            ..EvaluatorConfig::default()
        }
    }

    fn sandbox() -> MemorySandbox {
        MemorySandbox::new("sb-1")
            .with_command_prefix("tree -L", 0, ".\n└── src\n")
            .with_file("workspace/repo/src/auth/github.ts", "export function callback() {}\n")
    }

    fn pass_turn() -> crate::io::model::ModelTurn {
        answer_turn(
            "pass",
            "GitHub OAuth callback is implemented.",
            vec![evidence("src/auth/github.ts", 1, 1, Conclusion::Pass)],
        )
    }

    #[test]
    fn pass_is_persisted_with_metadata_and_trace() {
        let temp = tempfile::tempdir().expect("tempdir");
        let model = ScriptedModel::new(vec![pass_turn()]);
        let sandbox = sandbox();
        let sink = MemoryResultSink::default();
        let docs = NoDocs;
        let deps = EvaluationDeps {
            model: &model,
            sandbox: &sandbox,
            docs: &docs,
            cache: None,
            sink: &sink,
        };

        let outcome = run_evaluation(&request("story-1", "sb-1", 5), &deps, &config(temp.path()))
            .expect("evaluate");
        assert_eq!(outcome.status(), AnalysisStatus::Pass);
        assert_eq!(outcome.cache, CacheUsage::Disabled);
        let metadata = outcome.result.metadata.as_ref().expect("metadata");
        assert_eq!(metadata.finish_reason, FinishReason::Answer);
        assert_eq!(metadata.step_count, 1);

        let stored = sink.get(&outcome.result_id).expect("row");
        assert_eq!(stored.status, AnalysisStatus::Pass);
        assert_eq!(sink.history(&outcome.result_id)[0].status, AnalysisStatus::Running);
        assert!(outcome.paths.meta_path.is_file());
    }

    #[test]
    fn sandbox_mismatch_is_rejected_before_any_row() {
        let temp = tempfile::tempdir().expect("tempdir");
        let model = ScriptedModel::new(vec![pass_turn()]);
        let sandbox = sandbox();
        let sink = MemoryResultSink::default();
        let docs = NoDocs;
        let deps = EvaluationDeps {
            model: &model,
            sandbox: &sandbox,
            docs: &docs,
            cache: None,
            sink: &sink,
        };
        let err = run_evaluation(&request("story-1", "sb-2", 5), &deps, &config(temp.path()))
            .unwrap_err();
        assert!(err.to_string().contains("sandbox mismatch"), "{err}");
        assert!(sink.is_empty());
    }

    #[test]
    fn loop_fatal_failure_becomes_an_error_verdict() {
        let temp = tempfile::tempdir().expect("tempdir");
        let model = ScriptedModel::new(vec![tool_turn(
            "c1",
            "readFile",
            json!({"path": "src/auth/github.ts"}),
        )]);
        let sandbox = sandbox().with_download_error("workspace/repo/src/auth/github.ts", || {
            SandboxError::Unreachable {
                sandbox_id: "sb-1".to_string(),
                reason: "connection reset".to_string(),
            }
        });
        let sink = MemoryResultSink::default();
        let docs = NoDocs;
        let deps = EvaluationDeps {
            model: &model,
            sandbox: &sandbox,
            docs: &docs,
            cache: None,
            sink: &sink,
        };
        let outcome = run_evaluation(&request("story-1", "sb-1", 5), &deps, &config(temp.path()))
            .expect("evaluate");
        assert_eq!(outcome.status(), AnalysisStatus::Error);
        assert_eq!(outcome.finish_reason, FinishReason::Aborted);
        let explanation = &outcome.analysis().expect("analysis").explanation;
        assert!(explanation.contains("connection reset"), "{explanation}");
        assert_eq!(sink.get(&outcome.result_id).expect("row").status, AnalysisStatus::Error);
    }

    #[test]
    fn result_update_failure_propagates() {
        let temp = tempfile::tempdir().expect("tempdir");
        let model = ScriptedModel::new(vec![pass_turn()]);
        let sandbox = sandbox();
        let sink = MemoryResultSink::default().fail_first_completion();
        let docs = NoDocs;
        let deps = EvaluationDeps {
            model: &model,
            sandbox: &sandbox,
            docs: &docs,
            cache: None,
            sink: &sink,
        };
        let err = run_evaluation(&request("story-1", "sb-1", 5), &deps, &config(temp.path()))
            .unwrap_err();
        assert!(format!("{err:#}").contains("update result"), "{err:#}");
    }

    #[test]
    fn second_run_is_served_from_cache() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sandbox = sandbox();
        let sink = MemoryResultSink::default();
        let store = MemoryCacheStore::default();
        let docs = NoDocs;
        let cfg = config(temp.path());

        let first = ScriptedModel::new(vec![pass_turn()]);
        let deps = EvaluationDeps {
            model: &first,
            sandbox: &sandbox,
            docs: &docs,
            cache: Some(&store),
            sink: &sink,
        };
        let outcome = run_evaluation(&request("story-1", "sb-1", 5), &deps, &cfg).expect("first");
        assert_eq!(outcome.cache, CacheUsage::Miss);
        assert_eq!(store.len(), 1);

        let second = ScriptedModel::new(Vec::new());
        let deps = EvaluationDeps {
            model: &second,
            ..deps
        };
        let outcome = run_evaluation(&request("story-1", "sb-1", 5), &deps, &cfg).expect("second");
        assert_eq!(outcome.cache, CacheUsage::Hit);
        assert_eq!(outcome.finish_reason, FinishReason::Cached);
        assert_eq!(outcome.status(), AnalysisStatus::Pass);
        assert_eq!(second.calls(), 0);
    }
}

//! The bounded tool loop that drives one model investigation.
//!
//! Each round is one generation call followed by strictly sequential dispatch
//! of the tool calls it proposed. The loop ends on the first structured
//! answer, on budget exhaustion, or on a loop-fatal failure.

use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::contract::OutputContract;
use crate::core::sanitize::{observation, sanitize_json, truncate_chars};
use crate::core::types::{
    AnalysisStatus, EvidenceItem, FinishReason, ModelAnswer, RepoIdentity, StepSummary, Story,
    ToolTraceEntry, TraceOutcome,
};
use crate::io::config::EvaluatorConfig;
use crate::io::docs::DocsProvider;
use crate::io::model::{GenerationRequest, Message, ModelClient, ModelTurn, ToolCallRequest};
use crate::io::prompt::{InstructionInputs, PromptBuilder, RetainedStep, StoryPromptInputs};
use crate::io::sandbox::Sandbox;
use crate::tools::{ToolCall, ToolContext, ToolOutcome, ToolSet, execute};

/// Tool calls honored per round; extras are answered with an error.
pub const MAX_TOOL_CALLS_PER_ROUND: usize = 8;

const NUDGE: &str = "Continue the investigation with a tool call, or give your final answer as JSON matching the answer schema.";

/// Loop limits derived from [`EvaluatorConfig`].
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub max_steps: u32,
    pub outline_depth: u32,
    pub workspace_dir: String,
    pub observation_limit_chars: usize,
    pub trace_field_limit_chars: usize,
    pub prompt_budget_bytes: usize,
    pub command_timeout: Duration,
}

impl LoopSettings {
    pub fn from_config(cfg: &EvaluatorConfig, max_steps: u32) -> Self {
        Self {
            max_steps,
            outline_depth: cfg.outline_depth,
            workspace_dir: cfg.workspace_dir.clone(),
            observation_limit_chars: cfg.observation_limit_chars,
            trace_field_limit_chars: cfg.trace_field_limit_chars,
            prompt_budget_bytes: cfg.prompt_budget_bytes,
            command_timeout: cfg.command_timeout(),
        }
    }
}

/// What the loop is asked to investigate.
#[derive(Debug, Clone)]
pub struct LoopInputs<'a> {
    pub story: &'a Story,
    pub repo: &'a RepoIdentity,
    pub run_id: Option<&'a str>,
    pub model_id: &'a str,
    /// Still-valid cached steps during partial re-evaluation.
    pub retained: &'a [RetainedStep],
    pub focus: &'a [String],
}

pub struct LoopCollaborators<'a> {
    pub model: &'a dyn ModelClient,
    pub sandbox: &'a dyn Sandbox,
    pub docs: &'a dyn DocsProvider,
    pub tools: &'a ToolSet,
    pub contract: &'a OutputContract,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopMetrics {
    pub step_count: u32,
    pub tool_call_count: u32,
    pub rejected_tool_calls: u32,
}

/// Everything the loop observed, kept even when it aborts.
#[derive(Debug, Clone, Default)]
pub struct LoopRecord {
    pub trace: Vec<ToolTraceEntry>,
    pub steps: Vec<StepSummary>,
    pub metrics: LoopMetrics,
}

#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub answer: ModelAnswer,
    pub finish_reason: FinishReason,
    pub record: LoopRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalCause {
    /// The repository outline could not be produced.
    Outline,
    /// A tool hit an infrastructure failure.
    Sandbox,
    /// The model provider failed.
    Provider,
}

/// The loop could not reach a verdict because infrastructure failed.
///
/// Carries the partial record so the caller can still persist a trace.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct LoopFatalError {
    pub cause: FatalCause,
    pub message: String,
    pub record: LoopRecord,
}

/// Run the tool loop to a terminal answer.
///
/// Budget exhaustion and invalid answers are terminal answers, not errors.
/// `Err` carries a [`LoopFatalError`] for infrastructure failures; any other
/// error is a local failure such as a broken prompt template.
#[instrument(skip_all, fields(max_steps = settings.max_steps, partial = !inputs.focus.is_empty()))]
pub fn run_tool_loop(
    inputs: &LoopInputs<'_>,
    collab: &LoopCollaborators<'_>,
    settings: &LoopSettings,
) -> Result<LoopOutcome> {
    let mut record = LoopRecord::default();
    let outline = match fetch_outline(collab.sandbox, settings) {
        Ok(outline) => outline,
        Err(message) => return Err(fatal(FatalCause::Outline, message, record)),
    };

    let specs = collab.tools.specs();
    let builder = PromptBuilder::new(settings.prompt_budget_bytes);
    let instructions = builder.build_instructions(&InstructionInputs {
        outline: &outline,
        tools: &specs,
        output_schema: collab.contract.schema(),
        max_steps: settings.max_steps,
        workspace_dir: &settings.workspace_dir,
    })?;
    let story_prompt = builder.build_story_prompt(&StoryPromptInputs {
        story: inputs.story,
        repo: inputs.repo,
        run_id: inputs.run_id,
        retained: inputs.retained,
        focus: inputs.focus,
    })?;

    let ctx = ToolContext {
        sandbox: collab.sandbox,
        docs: collab.docs,
        workspace_dir: &settings.workspace_dir,
        command_timeout: settings.command_timeout,
        observation_limit: settings.observation_limit_chars,
    };
    let mut messages = vec![Message::User {
        content: story_prompt,
    }];
    let mut provisional: Vec<EvidenceItem> = Vec::new();

    for step in 1..=settings.max_steps {
        record.metrics.step_count = step;
        let request = GenerationRequest {
            model_id: inputs.model_id,
            instructions: &instructions,
            messages: &messages,
            tools: &specs,
            output_schema: collab.contract.schema(),
            step,
            max_steps: settings.max_steps,
        };
        let turn = match collab.model.next_turn(&request) {
            Ok(turn) => turn,
            Err(err) => {
                let message = format!("model provider failed at step {step}: {err:#}");
                return Err(fatal(FatalCause::Provider, message, record));
            }
        };

        if let Some(text) = turn.text.as_deref().filter(|t| !t.trim().is_empty()) {
            messages.push(Message::Assistant {
                content: text.to_string(),
            });
        }

        if let Some(raw) = answer_candidate(&turn) {
            if !turn.tool_calls.is_empty() {
                warn!(
                    step,
                    ignored = turn.tool_calls.len(),
                    "final answer present; ignoring tool calls from the same round"
                );
            }
            return Ok(finish_with_answer(raw, step, collab.contract, record));
        }

        if turn.tool_calls.is_empty() {
            debug!(step, "round produced neither tool calls nor an answer");
            record.steps.push(StepSummary {
                iteration: step,
                action: "idle".to_string(),
                notes: "no tool call or answer; nudged the model".to_string(),
            });
            messages.push(Message::User {
                content: NUDGE.to_string(),
            });
            continue;
        }

        let mut names = Vec::with_capacity(turn.tool_calls.len());
        for (index, call) in turn.tool_calls.iter().enumerate() {
            names.push(call.name.clone());
            record.metrics.tool_call_count += 1;
            messages.push(Message::ToolCall {
                id: call.id.clone(),
                name: call.name.clone(),
                input: call.input.clone(),
            });

            let dispatched = if index < MAX_TOOL_CALLS_PER_ROUND {
                dispatch(call, collab.tools, &ctx, &mut provisional)
            } else {
                Dispatched::Done(
                    format!(
                        "Skipped: at most {MAX_TOOL_CALLS_PER_ROUND} tool calls are executed per round."
                    ),
                    TraceOutcome::Rejected,
                )
            };

            let (content, outcome) = match dispatched {
                Dispatched::Done(content, outcome) => (content, outcome),
                Dispatched::Fatal(message) => {
                    record.trace.push(trace_entry(
                        step,
                        call,
                        &message,
                        TraceOutcome::Error,
                        settings,
                    ));
                    record.steps.push(StepSummary {
                        iteration: step,
                        action: "aborted".to_string(),
                        notes: message.clone(),
                    });
                    return Err(fatal(FatalCause::Sandbox, message, record));
                }
            };
            if outcome == TraceOutcome::Rejected {
                record.metrics.rejected_tool_calls += 1;
            }
            let content = truncate_chars(&content, settings.observation_limit_chars);
            record.trace.push(trace_entry(step, call, &content, outcome, settings));
            messages.push(Message::ToolResult {
                id: call.id.clone(),
                name: call.name.clone(),
                content,
                is_error: outcome != TraceOutcome::Ok,
            });
        }

        record.steps.push(StepSummary {
            iteration: step,
            action: "tools".to_string(),
            notes: names.join(", "),
        });
    }

    info!(
        steps = settings.max_steps,
        provisional = provisional.len(),
        "step budget exhausted without a final answer"
    );
    let explanation = format!(
        "The investigation used all {} steps without reaching a final answer, so the story could not be verified. Evidence gathered so far is attached; a deeper investigation is needed.",
        settings.max_steps
    );
    Ok(LoopOutcome {
        answer: ModelAnswer::synthesized(AnalysisStatus::Blocked, explanation, provisional),
        finish_reason: FinishReason::StepBudgetExhausted,
        record,
    })
}

fn fatal(cause: FatalCause, message: String, record: LoopRecord) -> anyhow::Error {
    warn!(?cause, message = %message, "tool loop aborted");
    LoopFatalError {
        cause,
        message,
        record,
    }
    .into()
}

/// Directory listing embedded in the instructions. Any failure is loop-fatal.
fn fetch_outline(sandbox: &dyn Sandbox, settings: &LoopSettings) -> Result<String, String> {
    let command = format!(
        "tree -L {} -I 'node_modules|.git|dist|build'",
        settings.outline_depth
    );
    let result = sandbox
        .execute_command(&command, &settings.workspace_dir, settings.command_timeout)
        .map_err(|err| format!("could not list the repository outline: {err}"))?;
    let output = observation(&result.output, usize::MAX);
    if result.exit_code != 0 {
        return Err(format!(
            "repository outline command exited with {}: {}",
            result.exit_code,
            truncate_chars(output.trim(), 300)
        ));
    }
    debug!(bytes = output.len(), "fetched repository outline");
    Ok(output)
}

/// Raw answer text for this round, if any.
///
/// An explicit answer always counts. Free text only counts when the round has
/// no tool calls and the text looks like JSON.
fn answer_candidate(turn: &ModelTurn) -> Option<&str> {
    if let Some(answer) = turn.answer.as_deref() {
        return Some(answer);
    }
    if !turn.tool_calls.is_empty() {
        return None;
    }
    let text = turn.text.as_deref()?.trim();
    (text.starts_with('{') || text.starts_with("```")).then_some(text)
}

fn finish_with_answer(
    raw: &str,
    step: u32,
    contract: &OutputContract,
    mut record: LoopRecord,
) -> LoopOutcome {
    match contract.parse_answer(raw) {
        Ok(answer) if answer.status == AnalysisStatus::Running => {
            warn!(step, "model answered with non-terminal status");
            record.steps.push(StepSummary {
                iteration: step,
                action: "answer".to_string(),
                notes: "running, treated as blocked".to_string(),
            });
            let evidence = answer.evidence().to_vec();
            let explanation = match answer.analysis {
                Some(analysis) => format!(
                    "The model ended the investigation without a verdict. Model explanation: {}",
                    analysis.explanation
                ),
                None => "The model ended the investigation without a verdict.".to_string(),
            };
            LoopOutcome {
                answer: ModelAnswer::synthesized(AnalysisStatus::Blocked, explanation, evidence),
                finish_reason: FinishReason::Answer,
                record,
            }
        }
        Ok(answer) => {
            info!(
                step,
                status = answer.status.as_str(),
                evidence = answer.evidence().len(),
                "final answer accepted"
            );
            record.steps.push(StepSummary {
                iteration: step,
                action: "answer".to_string(),
                notes: answer.status.as_str().to_string(),
            });
            LoopOutcome {
                answer,
                finish_reason: FinishReason::Answer,
                record,
            }
        }
        Err(violation) => {
            warn!(step, violation = %violation, "final answer rejected");
            record.steps.push(StepSummary {
                iteration: step,
                action: "invalid_answer".to_string(),
                notes: truncate_chars(&violation, 300),
            });
            LoopOutcome {
                answer: ModelAnswer::synthesized(
                    AnalysisStatus::Error,
                    format!("The model's final answer was rejected: {violation}"),
                    Vec::new(),
                ),
                finish_reason: FinishReason::InvalidAnswer,
                record,
            }
        }
    }
}

enum Dispatched {
    Done(String, TraceOutcome),
    Fatal(String),
}

fn dispatch(
    call: &ToolCallRequest,
    tools: &ToolSet,
    ctx: &ToolContext<'_>,
    provisional: &mut Vec<EvidenceItem>,
) -> Dispatched {
    let parsed = match tools.parse(&call.name, &call.input) {
        Ok(parsed) => parsed,
        Err(message) => {
            debug!(tool = %call.name, message = %message, "tool input rejected");
            return Dispatched::Done(message, TraceOutcome::Rejected);
        }
    };
    if let ToolCall::ShareThought(input) = &parsed {
        provisional.extend(input.evidence.iter().cloned());
    }
    match execute(&parsed, ctx) {
        Ok(ToolOutcome::Output(text)) => Dispatched::Done(text, TraceOutcome::Ok),
        Ok(ToolOutcome::Rejected(text)) => Dispatched::Done(text, TraceOutcome::Rejected),
        Ok(ToolOutcome::Failed(text)) => Dispatched::Done(text, TraceOutcome::Error),
        Err(err) if err.is_fatal() => {
            Dispatched::Fatal(format!("{} failed: {err}", call.name))
        }
        Err(err) => {
            debug!(tool = %call.name, error = %err, "tool failed recoverably");
            Dispatched::Done(format!("Tool error: {err}"), TraceOutcome::Error)
        }
    }
}

fn trace_entry(
    step: u32,
    call: &ToolCallRequest,
    output: &str,
    outcome: TraceOutcome,
    settings: &LoopSettings,
) -> ToolTraceEntry {
    let limit = settings.trace_field_limit_chars;
    ToolTraceEntry {
        step,
        tool: truncate_chars(&call.name, limit),
        input: sanitize_json(&call.input, limit),
        output: truncate_chars(output, limit),
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Conclusion;
    use crate::io::docs::NoDocs;
    use crate::io::sandbox::SandboxError;
    use crate::test_support::{
        MemorySandbox, ScriptedModel, answer_turn, evidence, repo, story, text_turn, tool_turn,
    };
    use serde_json::json;

    struct Fixture {
        tools: ToolSet,
        contract: OutputContract,
        story: Story,
        repo: RepoIdentity,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                tools: ToolSet::new().expect("tools"),
                contract: OutputContract::new().expect("contract"),
                story: story("story-1"),
                repo: repo(),
            }
        }

        fn run(
            &self,
            model: &ScriptedModel,
            sandbox: &MemorySandbox,
            max_steps: u32,
        ) -> Result<LoopOutcome> {
            let docs = NoDocs;
            run_tool_loop(
                &LoopInputs {
                    story: &self.story,
                    repo: &self.repo,
                    run_id: Some("run-1"),
                    model_id: "test-model",
                    retained: &[],
                    focus: &[],
                },
                &LoopCollaborators {
                    model,
                    sandbox,
                    docs: &docs,
                    tools: &self.tools,
                    contract: &self.contract,
                },
                &settings(max_steps),
            )
        }
    }

    fn settings(max_steps: u32) -> LoopSettings {
        LoopSettings {
            max_steps,
            outline_depth: 3,
            workspace_dir: "workspace/repo".to_string(),
            observation_limit_chars: 2_000,
            trace_field_limit_chars: 40,
            prompt_budget_bytes: 60_000,
            command_timeout: Duration::from_secs(5),
        }
    }

    fn sandbox() -> MemorySandbox {
        MemorySandbox::new("sb-1")
            .with_command_prefix("tree -L", 0, ".\n└── src\n    └── auth\n        └── github.ts\n")
            .with_file(
                "workspace/repo/src/auth/github.ts",
                "export function githubCallback() {}\n",
            )
    }

    #[test]
    fn outline_is_embedded_in_instructions() {
        let fixture = Fixture::new();
        let model = ScriptedModel::new(vec![answer_turn(
            "pass",
            "Login handler exists.",
            vec![evidence("src/auth/github.ts", 1, 1, Conclusion::Pass)],
        )]);
        fixture.run(&model, &sandbox(), 5).expect("loop");
        let instructions = model.instructions();
        assert!(instructions[0].contains("github.ts"), "{}", instructions[0]);
    }

    #[test]
    fn answer_in_first_round_ends_the_loop() {
        let fixture = Fixture::new();
        let model = ScriptedModel::new(vec![answer_turn(
            "pass",
            "Login handler exists.",
            vec![evidence("src/auth/github.ts", 1, 1, Conclusion::Pass)],
        )]);
        let outcome = fixture.run(&model, &sandbox(), 5).expect("loop");
        assert_eq!(outcome.finish_reason, FinishReason::Answer);
        assert_eq!(outcome.answer.status, AnalysisStatus::Pass);
        assert_eq!(outcome.record.metrics.step_count, 1);
        assert_eq!(model.calls(), 1);
    }

    #[test]
    fn answer_wins_over_tool_calls_in_the_same_round() {
        let fixture = Fixture::new();
        let mut turn = answer_turn(
            "fail",
            "No handler.",
            vec![evidence("src/auth/github.ts", 1, 1, Conclusion::Fail)],
        );
        turn.tool_calls =
            tool_turn("c1", "readFile", json!({"path": "src/auth/github.ts"})).tool_calls;
        let sandbox = sandbox();
        let model = ScriptedModel::new(vec![turn]);
        let outcome = fixture.run(&model, &sandbox, 5).expect("loop");
        assert_eq!(outcome.answer.status, AnalysisStatus::Fail);
        assert!(outcome.record.trace.is_empty());
        assert_eq!(sandbox.downloads(), 0);
    }

    #[test]
    fn tool_results_are_fed_back_in_order() {
        let fixture = Fixture::new();
        let model = ScriptedModel::new(vec![
            tool_turn("c1", "readFile", json!({"path": "src/auth/github.ts"})),
            answer_turn(
                "pass",
                "Found the callback.",
                vec![evidence("src/auth/github.ts", 1, 1, Conclusion::Pass)],
            ),
        ]);
        let outcome = fixture.run(&model, &sandbox(), 5).expect("loop");
        assert_eq!(outcome.record.metrics.tool_call_count, 1);
        assert_eq!(outcome.record.trace[0].outcome, TraceOutcome::Ok);

        let transcripts = model.transcripts();
        let second = &transcripts[1];
        assert!(matches!(
            second.last(),
            Some(Message::ToolResult { content, is_error: false, .. })
                if content.contains("githubCallback")
        ));
    }

    #[test]
    fn malformed_and_unknown_tool_calls_are_recoverable() {
        let fixture = Fixture::new();
        let model = ScriptedModel::new(vec![
            tool_turn("c1", "readFile", json!({"file": "x"})),
            tool_turn("c2", "writeFile", json!({"path": "x"})),
            answer_turn(
                "pass",
                "ok",
                vec![evidence("src/auth/github.ts", 1, 1, Conclusion::Pass)],
            ),
        ]);
        let outcome = fixture.run(&model, &sandbox(), 5).expect("loop");
        assert_eq!(outcome.record.metrics.rejected_tool_calls, 2);
        assert_eq!(outcome.answer.status, AnalysisStatus::Pass);
    }

    #[test]
    fn containment_violation_is_an_observation() {
        let fixture = Fixture::new();
        let model = ScriptedModel::new(vec![
            tool_turn("c1", "readFile", json!({"path": "/etc/passwd"})),
            answer_turn(
                "pass",
                "ok",
                vec![evidence("src/auth/github.ts", 1, 1, Conclusion::Pass)],
            ),
        ]);
        let sandbox = sandbox().with_file("etc/passwd", "root:x:0:0");
        let outcome = fixture.run(&model, &sandbox, 5).expect("loop");
        assert_eq!(outcome.record.trace[0].outcome, TraceOutcome::Rejected);
        let transcripts = model.transcripts();
        let Some(Message::ToolResult { content, is_error, .. }) = transcripts[1].last() else {
            panic!("expected tool result");
        };
        assert!(*is_error);
        assert!(!content.contains("root:x"));
    }

    #[test]
    fn budget_exhaustion_is_blocked_with_provisional_evidence() {
        let fixture = Fixture::new();
        let model = ScriptedModel::repeating(tool_turn(
            "c",
            "shareThought",
            json!({"message": "still looking", "evidence": [{
                "filePath": "src/auth/github.ts", "startLine": 1, "endLine": 1,
                "note": "callback", "conclusion": "pass"
            }]}),
        ));
        let outcome = fixture.run(&model, &sandbox(), 3).expect("loop");
        assert_eq!(model.calls(), 3);
        assert_eq!(outcome.finish_reason, FinishReason::StepBudgetExhausted);
        assert_eq!(outcome.answer.status, AnalysisStatus::Blocked);
        assert_eq!(outcome.answer.evidence().len(), 3);
        assert_eq!(outcome.record.steps.len(), 3);
    }

    #[test]
    fn malformed_shared_evidence_never_reaches_the_blocked_verdict() {
        let fixture = Fixture::new();
        let model = ScriptedModel::repeating(tool_turn(
            "c",
            "shareThought",
            json!({"message": "maybe here", "evidence": [{
                "filePath": "   ", "startLine": 40, "endLine": 10,
                "note": "callback", "conclusion": "pass"
            }]}),
        ));
        let outcome = fixture.run(&model, &sandbox(), 2).expect("loop");
        assert_eq!(outcome.finish_reason, FinishReason::StepBudgetExhausted);
        assert_eq!(outcome.answer.status, AnalysisStatus::Blocked);
        assert!(outcome.answer.evidence().is_empty());
        assert_eq!(outcome.record.metrics.rejected_tool_calls, 2);
        assert!(
            outcome
                .record
                .trace
                .iter()
                .all(|entry| entry.outcome == TraceOutcome::Rejected)
        );
    }

    #[test]
    fn invalid_final_answer_is_an_error_verdict() {
        let fixture = Fixture::new();
        let model = ScriptedModel::new(vec![answer_turn("maybe", "trust me", Vec::new())]);
        let outcome = fixture.run(&model, &sandbox(), 5).expect("loop");
        assert_eq!(outcome.finish_reason, FinishReason::InvalidAnswer);
        assert_eq!(outcome.answer.status, AnalysisStatus::Error);
        let explanation = &outcome.answer.analysis.as_ref().expect("analysis").explanation;
        assert!(explanation.contains("rejected"), "{explanation}");
        assert_eq!(model.calls(), 1);
    }

    #[test]
    fn prose_without_tool_calls_is_nudged() {
        let fixture = Fixture::new();
        let model = ScriptedModel::new(vec![
            text_turn("Let me think about this."),
            answer_turn(
                "pass",
                "ok",
                vec![evidence("src/auth/github.ts", 1, 1, Conclusion::Pass)],
            ),
        ]);
        let outcome = fixture.run(&model, &sandbox(), 5).expect("loop");
        assert_eq!(outcome.answer.status, AnalysisStatus::Pass);
        assert_eq!(outcome.record.steps[0].action, "idle");
    }

    #[test]
    fn fatal_sandbox_errors_abort_with_partial_record() {
        let fixture = Fixture::new();
        let model = ScriptedModel::new(vec![tool_turn(
            "c1",
            "terminalCommand",
            json!({"description": "search", "command": "rg oauth"}),
        )]);
        let sandbox =
            sandbox().with_command_error("rg oauth", || SandboxError::Timeout { secs: 5 });
        let err = fixture.run(&model, &sandbox, 5).unwrap_err();
        let fatal = err.downcast_ref::<LoopFatalError>().expect("fatal");
        assert_eq!(fatal.cause, FatalCause::Sandbox);
        assert_eq!(fatal.record.trace.len(), 1);
        assert_eq!(fatal.record.trace[0].outcome, TraceOutcome::Error);
    }

    #[test]
    fn outline_failure_is_fatal() {
        let fixture = Fixture::new();
        let model = ScriptedModel::new(Vec::new());
        let sandbox =
            MemorySandbox::new("sb-1").with_command_prefix("tree -L", 127, "tree: not found");
        let err = fixture.run(&model, &sandbox, 5).unwrap_err();
        let fatal = err.downcast_ref::<LoopFatalError>().expect("fatal");
        assert_eq!(fatal.cause, FatalCause::Outline);
        assert_eq!(model.calls(), 0);
    }

    #[test]
    fn provider_failure_is_fatal() {
        let fixture = Fixture::new();
        let model = ScriptedModel::new(Vec::new());
        let err = fixture.run(&model, &sandbox(), 5).unwrap_err();
        let fatal = err.downcast_ref::<LoopFatalError>().expect("fatal");
        assert_eq!(fatal.cause, FatalCause::Provider);
    }

    #[test]
    fn trace_fields_are_capped() {
        let fixture = Fixture::new();
        let long = "x".repeat(500);
        let model = ScriptedModel::new(vec![
            tool_turn(
                "c1",
                "terminalCommand",
                json!({"description": long, "command": "rg -n login"}),
            ),
            answer_turn(
                "pass",
                "ok",
                vec![evidence("src/auth/github.ts", 1, 1, Conclusion::Pass)],
            ),
        ]);
        let sandbox = sandbox().with_command("rg -n login", 0, &"y".repeat(500));
        let outcome = fixture.run(&model, &sandbox, 5).expect("loop");
        let entry = &outcome.record.trace[0];
        assert_eq!(entry.output.chars().count(), 40);
        let description = entry.input["description"].as_str().expect("string");
        assert_eq!(description.chars().count(), 40);
    }

    #[test]
    fn extra_tool_calls_in_one_round_are_skipped() {
        let fixture = Fixture::new();
        let mut turn = ModelTurn::default();
        for i in 0..(MAX_TOOL_CALLS_PER_ROUND + 2) {
            turn.tool_calls.push(ToolCallRequest {
                id: format!("c{i}"),
                name: "shareThought".to_string(),
                input: json!({"message": "note"}),
            });
        }
        let model = ScriptedModel::new(vec![
            turn,
            answer_turn(
                "pass",
                "ok",
                vec![evidence("src/auth/github.ts", 1, 1, Conclusion::Pass)],
            ),
        ]);
        let outcome = fixture.run(&model, &sandbox(), 5).expect("loop");
        assert_eq!(outcome.record.metrics.tool_call_count, 10);
        assert_eq!(outcome.record.metrics.rejected_tool_calls, 2);
    }
}

//! Test-only collaborators: a scripted model, an in-memory sandbox, cache
//! store and result sink, plus builders for common fixtures.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde_json::{Value, json};

use crate::core::types::{
    ANALYSIS_VERSION, CacheEntry, Conclusion, EvaluationRequest, EvidenceItem, RepoIdentity,
    Story, StoryTestResult,
};
use crate::io::cache_store::EvidenceCacheStore;
use crate::io::model::{GenerationRequest, Message, ModelClient, ModelTurn, ToolCallRequest};
use crate::io::results::ResultSink;
use crate::io::sandbox::{CommandResult, Sandbox, SandboxError};

pub const STORY_NAME: &str = "User can log in with GitHub";
pub const STORY_TEXT: &str =
    "Given I am signed out\nWhen I click \"Sign in with GitHub\"\nThen I am signed in";

pub fn story(id: &str) -> Story {
    Story {
        id: id.to_string(),
        name: STORY_NAME.to_string(),
        text: STORY_TEXT.to_string(),
        repo_id: "repo-1".to_string(),
        branch_name: "main".to_string(),
        commit_sha: Some("abc".to_string()),
    }
}

pub fn repo() -> RepoIdentity {
    RepoIdentity {
        id: "repo-1".to_string(),
        slug: "acme/web".to_string(),
    }
}

pub fn request(story_id: &str, sandbox_id: &str, max_steps: u32) -> EvaluationRequest {
    EvaluationRequest {
        story: story(story_id),
        repo: repo(),
        run_id: Some("run-1".to_string()),
        sandbox_id: sandbox_id.to_string(),
        model_id: "test-model".to_string(),
        max_steps,
    }
}

pub fn evidence(path: &str, start: u32, end: u32, conclusion: Conclusion) -> EvidenceItem {
    EvidenceItem {
        step: None,
        file_path: path.to_string(),
        start_line: Some(start),
        end_line: Some(end),
        note: format!("{path} lines {start}-{end}"),
        conclusion,
    }
}

/// Raw final-answer JSON as a model would emit it.
pub fn answer_json(status: &str, explanation: &str, evidence: &[EvidenceItem]) -> String {
    json!({
        "status": status,
        "analysis": {
            "version": ANALYSIS_VERSION,
            "explanation": explanation,
            "evidence": evidence,
        },
    })
    .to_string()
}

pub fn answer_turn(status: &str, explanation: &str, evidence: Vec<EvidenceItem>) -> ModelTurn {
    ModelTurn {
        answer: Some(answer_json(status, explanation, &evidence)),
        ..ModelTurn::default()
    }
}

pub fn tool_turn(id: &str, name: &str, input: Value) -> ModelTurn {
    ModelTurn {
        tool_calls: vec![ToolCallRequest {
            id: id.to_string(),
            name: name.to_string(),
            input,
        }],
        ..ModelTurn::default()
    }
}

pub fn text_turn(text: &str) -> ModelTurn {
    ModelTurn {
        text: Some(text.to_string()),
        ..ModelTurn::default()
    }
}

/// Model client that replays predetermined turns and records what it saw.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    turns: RefCell<VecDeque<ModelTurn>>,
    repeat: Option<ModelTurn>,
    calls: Cell<u32>,
    instructions: RefCell<Vec<String>>,
    transcripts: RefCell<Vec<Vec<Message>>>,
}

impl ScriptedModel {
    /// Fails once the script runs out.
    pub fn new(turns: Vec<ModelTurn>) -> Self {
        Self {
            turns: RefCell::new(turns.into()),
            ..Self::default()
        }
    }

    /// Returns the same turn forever.
    pub fn repeating(turn: ModelTurn) -> Self {
        Self {
            repeat: Some(turn),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.get()
    }

    pub fn instructions(&self) -> Vec<String> {
        self.instructions.borrow().clone()
    }

    pub fn transcripts(&self) -> Vec<Vec<Message>> {
        self.transcripts.borrow().clone()
    }
}

impl ModelClient for ScriptedModel {
    fn next_turn(&self, request: &GenerationRequest<'_>) -> Result<ModelTurn> {
        self.calls.set(self.calls.get() + 1);
        self.instructions
            .borrow_mut()
            .push(request.instructions.to_string());
        self.transcripts.borrow_mut().push(request.messages.to_vec());
        if let Some(turn) = self.turns.borrow_mut().pop_front() {
            return Ok(turn);
        }
        self.repeat
            .clone()
            .ok_or_else(|| anyhow!("scripted model has no more turns"))
    }
}

type ErrorFactory = Box<dyn Fn() -> SandboxError>;

/// Sandbox backed by in-memory files and canned command results.
///
/// Commands without a canned result exit 127.
#[derive(Default)]
pub struct MemorySandbox {
    id: String,
    files: HashMap<String, Vec<u8>>,
    commands: Vec<(String, bool, CommandResult)>,
    command_errors: HashMap<String, ErrorFactory>,
    download_errors: HashMap<String, ErrorFactory>,
    unreachable: bool,
    executed: RefCell<Vec<(String, String)>>,
    downloads: Cell<usize>,
}

impl MemorySandbox {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }

    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.with_bytes(path, content.as_bytes().to_vec())
    }

    pub fn with_bytes(mut self, path: &str, content: Vec<u8>) -> Self {
        self.files.insert(path.to_string(), content);
        self
    }

    /// Canned result for an exact command.
    pub fn with_command(mut self, command: &str, exit_code: i32, output: &str) -> Self {
        self.commands.push((command.to_string(), false, result(exit_code, output)));
        self
    }

    /// Canned result for any command starting with `prefix`.
    pub fn with_command_prefix(mut self, prefix: &str, exit_code: i32, output: &str) -> Self {
        self.commands.push((prefix.to_string(), true, result(exit_code, output)));
        self
    }

    pub fn with_command_error(
        mut self,
        command: &str,
        error: impl Fn() -> SandboxError + 'static,
    ) -> Self {
        self.command_errors
            .insert(command.to_string(), Box::new(error));
        self
    }

    pub fn with_download_error(
        mut self,
        path: &str,
        error: impl Fn() -> SandboxError + 'static,
    ) -> Self {
        self.download_errors.insert(path.to_string(), Box::new(error));
        self
    }

    /// Every call fails as if the environment were gone.
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    /// `(command, cwd)` pairs in execution order.
    pub fn executed(&self) -> Vec<(String, String)> {
        self.executed.borrow().clone()
    }

    pub fn downloads(&self) -> usize {
        self.downloads.get()
    }

    fn gone(&self) -> SandboxError {
        SandboxError::Unreachable {
            sandbox_id: self.id.clone(),
            reason: "sandbox stopped".to_string(),
        }
    }
}

fn result(exit_code: i32, output: &str) -> CommandResult {
    CommandResult {
        exit_code,
        output: output.as_bytes().to_vec(),
    }
}

impl Sandbox for MemorySandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn execute_command(
        &self,
        command: &str,
        cwd: &str,
        _timeout: Duration,
    ) -> Result<CommandResult, SandboxError> {
        if self.unreachable {
            return Err(self.gone());
        }
        self.executed
            .borrow_mut()
            .push((command.to_string(), cwd.to_string()));
        if let Some(error) = self.command_errors.get(command) {
            return Err(error());
        }
        let canned = self
            .commands
            .iter()
            .find(|(pattern, prefix, _)| !prefix && pattern == command)
            .or_else(|| {
                self.commands
                    .iter()
                    .find(|(pattern, prefix, _)| *prefix && command.starts_with(pattern.as_str()))
            });
        Ok(canned.map_or_else(
            || result(127, "sh: command not found"),
            |(_, _, canned)| canned.clone(),
        ))
    }

    fn download_file(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
        if self.unreachable {
            return Err(self.gone());
        }
        self.downloads.set(self.downloads.get() + 1);
        if let Some(error) = self.download_errors.get(path) {
            return Err(error());
        }
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| SandboxError::NotFound(path.to_string()))
    }
}

/// Cache store kept in memory; `failing()` errors on every call.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: RefCell<BTreeMap<(String, String), CacheEntry>>,
    failing: bool,
}

impl MemoryCacheStore {
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub fn entry(&self, story_id: &str, commit_sha: &str) -> Option<CacheEntry> {
        self.entries
            .borrow()
            .get(&(story_id.to_string(), commit_sha.to_string()))
            .cloned()
    }
}

impl EvidenceCacheStore for MemoryCacheStore {
    fn get(&self, story_id: &str, commit_sha: &str) -> Result<Option<CacheEntry>> {
        if self.failing {
            return Err(anyhow!("cache store offline"));
        }
        Ok(self.entry(story_id, commit_sha))
    }

    fn put(&self, entry: &CacheEntry) -> Result<()> {
        if self.failing {
            return Err(anyhow!("cache store offline"));
        }
        self.entries.borrow_mut().insert(
            (entry.story_id.clone(), entry.commit_sha.clone()),
            entry.clone(),
        );
        Ok(())
    }
}

/// Result sink that keeps every version of every row.
#[derive(Debug, Default)]
pub struct MemoryResultSink {
    rows: RefCell<BTreeMap<String, Vec<StoryTestResult>>>,
    next_id: Cell<u32>,
    fail_completions: Cell<u32>,
}

impl MemoryResultSink {
    /// The first `complete` call fails.
    pub fn fail_first_completion(self) -> Self {
        self.fail_completions.set(1);
        self
    }

    /// Latest version of a row.
    pub fn get(&self, result_id: &str) -> Option<StoryTestResult> {
        self.rows
            .borrow()
            .get(result_id)
            .and_then(|versions| versions.last().cloned())
    }

    /// Every version of a row, oldest first.
    pub fn history(&self, result_id: &str) -> Vec<StoryTestResult> {
        self.rows
            .borrow()
            .get(result_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.rows.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.borrow().is_empty()
    }
}

impl ResultSink for MemoryResultSink {
    fn begin(
        &self,
        story: &Story,
        _run_id: Option<&str>,
        placeholder: &StoryTestResult,
    ) -> Result<String> {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        let result_id = format!("{}-{id}", story.id);
        self.rows
            .borrow_mut()
            .insert(result_id.clone(), vec![placeholder.clone()]);
        Ok(result_id)
    }

    fn complete(&self, result_id: &str, result: &StoryTestResult) -> Result<()> {
        if self.fail_completions.get() > 0 {
            self.fail_completions.set(self.fail_completions.get() - 1);
            return Err(anyhow!("database unavailable"));
        }
        let mut rows = self.rows.borrow_mut();
        let versions = rows
            .get_mut(result_id)
            .ok_or_else(|| anyhow!("unknown result {result_id}"))?;
        versions.push(result.clone());
        Ok(())
    }
}

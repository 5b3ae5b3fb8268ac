//! Sandbox tools offered to the model.
//!
//! Tools form a closed set. Every call is validated against its kind's JSON
//! Schema, deserialized into a typed input and dispatched with a `match`, so
//! adding a tool means touching each of those places.

mod docs;
mod read_file;
mod symbols;
mod terminal;

use std::time::Duration;

use jsonschema::Validator;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::info;

use anyhow::Result;

use crate::contract::{compile_schema, schema_errors};
use crate::core::invariants::validate_evidence;
use crate::core::types::EvidenceItem;
use crate::io::docs::DocsProvider;
use crate::io::model::ToolSpec;
use crate::io::sandbox::{Sandbox, SandboxError};

pub use symbols::{Symbol, SymbolKind, extract_symbols};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    TerminalCommand,
    ReadFile,
    ResolveLibrary,
    GetLibraryDocs,
    ListSymbols,
    ShareThought,
}

impl ToolKind {
    pub const ALL: [ToolKind; 6] = [
        ToolKind::ShareThought,
        ToolKind::TerminalCommand,
        ToolKind::ReadFile,
        ToolKind::ListSymbols,
        ToolKind::ResolveLibrary,
        ToolKind::GetLibraryDocs,
    ];

    /// Name the model calls the tool by.
    pub fn name(self) -> &'static str {
        match self {
            ToolKind::TerminalCommand => "terminalCommand",
            ToolKind::ReadFile => "readFile",
            ToolKind::ResolveLibrary => "resolveLibrary",
            ToolKind::GetLibraryDocs => "getLibraryDocs",
            ToolKind::ListSymbols => "listSymbols",
            ToolKind::ShareThought => "shareThought",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn description(self) -> &'static str {
        match self {
            ToolKind::TerminalCommand => {
                "Run a read-only shell command (rg, fd, grep, git log, tree, sed -n) from the repository root. Non-zero exits are returned as {exitCode, output}. Commands that write are refused."
            }
            ToolKind::ReadFile => {
                "Read a text file from the repository by repository-relative path. Paths outside the repository are refused."
            }
            ToolKind::ResolveLibrary => {
                "Resolve a package name to a documentation library id. Documentation is supplementary; never cite it as evidence."
            }
            ToolKind::GetLibraryDocs => {
                "Fetch documentation for a library id returned by resolveLibrary, optionally focused on a topic."
            }
            ToolKind::ListSymbols => {
                "List declared symbols (functions, classes, types) in one file (scope \"document\") or search declarations across the repository (scope \"codebase\"). TypeScript, JavaScript and Python only."
            }
            ToolKind::ShareThought => {
                "Record your current intent, plan or discovery for human reviewers, optionally with the evidence gathered so far. Call it often."
            }
        }
    }

    fn schema_source(self) -> &'static str {
        match self {
            ToolKind::TerminalCommand => {
                include_str!("../../schemas/tools/terminal_command.schema.json")
            }
            ToolKind::ReadFile => include_str!("../../schemas/tools/read_file.schema.json"),
            ToolKind::ResolveLibrary => {
                include_str!("../../schemas/tools/resolve_library.schema.json")
            }
            ToolKind::GetLibraryDocs => {
                include_str!("../../schemas/tools/get_library_docs.schema.json")
            }
            ToolKind::ListSymbols => include_str!("../../schemas/tools/list_symbols.schema.json"),
            ToolKind::ShareThought => include_str!("../../schemas/tools/share_thought.schema.json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TerminalCommandInput {
    pub description: String,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReadFileInput {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResolveLibraryInput {
    pub library_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GetLibraryDocsInput {
    pub library_id: String,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "scope", rename_all = "lowercase")]
pub enum ListSymbolsInput {
    Document { path: String },
    Codebase { query: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ShareThoughtInput {
    pub message: String,
    #[serde(default)]
    pub evidence: Vec<EvidenceItem>,
}

/// A validated tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCall {
    TerminalCommand(TerminalCommandInput),
    ReadFile(ReadFileInput),
    ResolveLibrary(ResolveLibraryInput),
    GetLibraryDocs(GetLibraryDocsInput),
    ListSymbols(ListSymbolsInput),
    ShareThought(ShareThoughtInput),
}

impl ToolCall {
    pub fn kind(&self) -> ToolKind {
        match self {
            ToolCall::TerminalCommand(_) => ToolKind::TerminalCommand,
            ToolCall::ReadFile(_) => ToolKind::ReadFile,
            ToolCall::ResolveLibrary(_) => ToolKind::ResolveLibrary,
            ToolCall::GetLibraryDocs(_) => ToolKind::GetLibraryDocs,
            ToolCall::ListSymbols(_) => ToolKind::ListSymbols,
            ToolCall::ShareThought(_) => ToolKind::ShareThought,
        }
    }
}

/// Compiled input schemas for every tool kind.
pub struct ToolSet {
    tools: Vec<(ToolKind, Value, Validator)>,
}

impl ToolSet {
    pub fn new() -> Result<Self> {
        let tools = ToolKind::ALL
            .into_iter()
            .map(|kind| {
                let (schema, validator) = compile_schema(kind.name(), kind.schema_source())?;
                Ok((kind, schema, validator))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { tools })
    }

    /// Tool definitions advertised to the model, in a stable order.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .map(|(kind, schema, _)| ToolSpec {
                name: kind.name(),
                description: kind.description(),
                input_schema: schema.clone(),
            })
            .collect()
    }

    /// Validate raw model input. The error is shown to the model verbatim.
    pub fn parse(&self, name: &str, input: &Value) -> Result<ToolCall, String> {
        let Some((kind, _, validator)) = self.tools.iter().find(|(kind, _, _)| kind.name() == name)
        else {
            let known: Vec<&str> = self.tools.iter().map(|(kind, _, _)| kind.name()).collect();
            return Err(format!(
                "Unknown tool '{name}'. Available tools: {}.",
                known.join(", ")
            ));
        };

        let errors = schema_errors(validator, input);
        if !errors.is_empty() {
            return Err(format!(
                "Invalid input for {name}: {}. Fix the arguments and try again.",
                errors.join("; ")
            ));
        }

        let call = match kind {
            ToolKind::TerminalCommand => ToolCall::TerminalCommand(typed(name, input)?),
            ToolKind::ReadFile => ToolCall::ReadFile(typed(name, input)?),
            ToolKind::ResolveLibrary => ToolCall::ResolveLibrary(typed(name, input)?),
            ToolKind::GetLibraryDocs => ToolCall::GetLibraryDocs(typed(name, input)?),
            ToolKind::ListSymbols => ToolCall::ListSymbols(typed(name, input)?),
            ToolKind::ShareThought => {
                let input: ShareThoughtInput = typed(name, input)?;
                check_evidence(name, &input.evidence)?;
                ToolCall::ShareThought(input)
            }
        };
        Ok(call)
    }
}

/// Shared evidence must satisfy the same invariants as a final answer's.
fn check_evidence(name: &str, evidence: &[EvidenceItem]) -> Result<(), String> {
    let errors: Vec<String> = evidence
        .iter()
        .enumerate()
        .flat_map(|(index, item)| {
            validate_evidence(item)
                .into_iter()
                .map(move |err| format!("evidence[{index}]: {err}"))
        })
        .collect();
    if errors.is_empty() {
        return Ok(());
    }
    Err(format!(
        "Invalid input for {name}: {}. Fix the evidence and try again.",
        errors.join("; ")
    ))
}

fn typed<T: DeserializeOwned>(name: &str, input: &Value) -> Result<T, String> {
    T::deserialize(input).map_err(|err| format!("Invalid input for {name}: {err}."))
}

/// Collaborators a tool may touch during one evaluation.
pub struct ToolContext<'a> {
    pub sandbox: &'a dyn Sandbox,
    pub docs: &'a dyn DocsProvider,
    /// Repository root relative to the sandbox home.
    pub workspace_dir: &'a str,
    pub command_timeout: Duration,
    /// Observations are cut to this many characters.
    pub observation_limit: usize,
}

/// What a tool hands back to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    /// The tool ran. Empty results and non-zero exits are informative output.
    Output(String),
    /// The call was refused before touching the sandbox.
    Rejected(String),
    /// A collaborator other than the sandbox failed; the model may retry.
    Failed(String),
}

pub const THOUGHT_RECORDED: &str = "Thought recorded.";

/// Run a validated call.
///
/// `Err` carries sandbox failures; the caller decides between reporting them to
/// the model and ending the loop with [`SandboxError::is_fatal`].
pub fn execute(call: &ToolCall, ctx: &ToolContext<'_>) -> Result<ToolOutcome, SandboxError> {
    match call {
        ToolCall::TerminalCommand(input) => terminal::run(input, ctx),
        ToolCall::ReadFile(input) => read_file::run(input, ctx),
        ToolCall::ResolveLibrary(input) => Ok(docs::resolve(input, ctx)),
        ToolCall::GetLibraryDocs(input) => Ok(docs::fetch(input, ctx)),
        ToolCall::ListSymbols(input) => symbols::run(input, ctx),
        ToolCall::ShareThought(input) => {
            info!(
                thought = %input.message,
                evidence = input.evidence.len(),
                "model shared a thought"
            );
            Ok(ToolOutcome::Output(THOUGHT_RECORDED.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool_set() -> ToolSet {
        ToolSet::new().expect("tool set")
    }

    #[test]
    fn every_kind_round_trips_its_name() {
        for kind in ToolKind::ALL {
            assert_eq!(ToolKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(ToolKind::from_name("bash"), None);
    }

    #[test]
    fn specs_cover_every_kind_with_object_schemas() {
        let specs = tool_set().specs();
        assert_eq!(specs.len(), ToolKind::ALL.len());
        for spec in specs {
            assert!(
                spec.input_schema.get("type").is_some() || spec.input_schema.get("oneOf").is_some(),
                "{}",
                spec.name
            );
        }
    }

    #[test]
    fn parses_valid_inputs_into_typed_calls() {
        let tools = tool_set();
        let call = tools
            .parse(
                "terminalCommand",
                &json!({"description": "find oauth", "command": "rg -n oauth"}),
            )
            .expect("valid");
        assert_eq!(call.kind(), ToolKind::TerminalCommand);

        let call = tools
            .parse("listSymbols", &json!({"scope": "codebase", "query": "login"}))
            .expect("valid");
        assert_eq!(
            call,
            ToolCall::ListSymbols(ListSymbolsInput::Codebase {
                query: "login".to_string()
            })
        );

        let call = tools
            .parse(
                "shareThought",
                &json!({"message": "checking routes", "evidence": [{
                    "filePath": "src/routes.ts", "startLine": 1, "endLine": 4,
                    "note": "login route", "conclusion": "pass"
                }]}),
            )
            .expect("valid");
        let ToolCall::ShareThought(input) = call else {
            panic!("expected shareThought");
        };
        assert_eq!(input.evidence.len(), 1);
    }

    #[test]
    fn rejects_unknown_tools_and_bad_inputs_with_readable_errors() {
        let tools = tool_set();
        let err = tools.parse("deleteRepo", &json!({})).unwrap_err();
        assert!(err.contains("Unknown tool 'deleteRepo'"), "{err}");

        let err = tools.parse("readFile", &json!({"file": "a.ts"})).unwrap_err();
        assert!(err.starts_with("Invalid input for readFile"), "{err}");

        let err = tools
            .parse("listSymbols", &json!({"scope": "workspace", "query": "x"}))
            .unwrap_err();
        assert!(err.starts_with("Invalid input for listSymbols"), "{err}");
    }

    #[test]
    fn rejects_shared_evidence_with_blank_path_or_inverted_range() {
        let tools = tool_set();
        let err = tools
            .parse(
                "shareThought",
                &json!({"message": "found it", "evidence": [
                    {"filePath": "src/routes.ts", "startLine": 1, "endLine": 4,
                     "note": "route", "conclusion": "pass"},
                    {"filePath": "   ", "startLine": 40, "endLine": 10,
                     "note": "handler", "conclusion": "pass"}
                ]}),
            )
            .unwrap_err();
        assert!(err.starts_with("Invalid input for shareThought"), "{err}");
        assert!(err.contains("evidence[1]: filePath must not be blank"), "{err}");
        assert!(err.contains("startLine 40 exceeds endLine 10"), "{err}");
        assert!(!err.contains("evidence[0]"), "{err}");
    }
}

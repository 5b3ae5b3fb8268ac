//! Prompt builder for the story evaluation loop.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::core::types::{EvidenceItem, RepoIdentity, Story};
use crate::io::model::ToolSpec;

const INSTRUCTIONS_TEMPLATE: &str = include_str!("prompts/instructions.md");
const STORY_TEMPLATE: &str = include_str!("prompts/story.md");

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("valid regex")
});

/// Droppable sections removed first when the instructions exceed the budget.
/// The outline is never dropped outright; being last, it is truncated instead.
const DROP_ORDER: &[&str] = &["advice"];

#[derive(Debug, Clone, Serialize)]
struct ToolContext<'a> {
    name: &'a str,
    description: &'a str,
}

/// Steps kept from a still-valid cache entry during partial re-evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct RetainedStep {
    pub step: String,
    pub evidence: Vec<EvidenceItem>,
}

/// Inputs for the system instructions.
#[derive(Debug, Clone)]
pub struct InstructionInputs<'a> {
    pub outline: &'a str,
    pub tools: &'a [ToolSpec],
    pub output_schema: &'a Value,
    pub max_steps: u32,
    pub workspace_dir: &'a str,
}

/// Inputs for the opening user message.
#[derive(Debug, Clone)]
pub struct StoryPromptInputs<'a> {
    pub story: &'a Story,
    pub repo: &'a RepoIdentity,
    pub run_id: Option<&'a str>,
    /// Non-empty only for partial re-evaluation.
    pub retained: &'a [RetainedStep],
    /// Steps to re-derive during partial re-evaluation.
    pub focus: &'a [String],
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("instructions", INSTRUCTIONS_TEMPLATE)
            .context("load instructions template")?;
        env.add_template("story", STORY_TEMPLATE)
            .context("load story template")?;
        Ok(Self { env })
    }

    fn render_instructions(&self, input: &InstructionInputs<'_>) -> Result<String> {
        let tools: Vec<ToolContext<'_>> = input
            .tools
            .iter()
            .map(|tool| ToolContext {
                name: tool.name,
                description: tool.description,
            })
            .collect();
        let schema =
            serde_json::to_string_pretty(input.output_schema).context("serialize answer schema")?;
        let template = self.env.get_template("instructions")?;
        let rendered = template.render(context! {
            workspace_dir => input.workspace_dir,
            max_steps => input.max_steps,
            tools => tools,
            schema => schema,
            outline => input.outline.trim(),
        })?;
        Ok(rendered)
    }

    fn render_story(&self, input: &StoryPromptInputs<'_>) -> Result<String> {
        let template = self.env.get_template("story")?;
        let rendered = template.render(context! {
            story => input.story,
            repo => input.repo,
            run_id => input.run_id,
            retained => input.retained,
            focus => input.focus,
        })?;
        Ok(rendered)
    }
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    /// Section identifier (e.g., "rules", "outline").
    key: String,
    /// Whether this section is required (cannot be dropped).
    required: bool,
    /// Section content, marker excluded.
    content: String,
}

/// Parse sections from rendered template output using HTML comment markers.
///
/// Markers follow format: `<!-- section:KEY required|droppable -->`
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let matches: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();

    for (i, caps) in matches.iter().enumerate() {
        let (Some(marker), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let required = kind.as_str() == "required";
        let end = matches
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(rendered.len());

        let content = rendered[marker.end()..end].trim().to_string();
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }

    sections
}

/// Apply budget to parsed sections: drop sections in [`DROP_ORDER`], then
/// truncate the last section.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len =
        |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == *key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    if total_len(sections) <= budget {
        return;
    }
    let other_len: usize = sections
        .iter()
        .take(sections.len().saturating_sub(1))
        .map(|s| s.content.len())
        .sum();
    let allowed = budget.saturating_sub(other_len);
    let Some(last) = sections.last_mut() else {
        return;
    };
    let before_len = last.content.len();
    if before_len > allowed {
        if allowed > 12 {
            let keep = floor_char_boundary(&last.content, allowed - 12);
            last.content.truncate(keep);
            last.content.push_str("\n[truncated]");
        } else {
            let keep = floor_char_boundary(&last.content, allowed);
            last.content.truncate(keep);
        }
        debug!(
            section = last.key,
            before_len,
            after_len = last.content.len(),
            "truncated section for budget"
        );
    }
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    (0..=index)
        .rev()
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(0)
}

/// Render sections back to a single string.
fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .filter(|content| !content.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Builds prompts within a byte budget, dropping less critical sections first.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    /// Create a builder with the given byte budget for the instructions.
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    /// System instructions, with the repository outline embedded.
    pub fn build_instructions(&self, input: &InstructionInputs<'_>) -> Result<String> {
        let rendered = PromptEngine::new()?
            .render_instructions(input)
            .context("render instructions")?;
        let mut sections = parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        Ok(render_sections(&sections))
    }

    /// Opening user message. Story content is never trimmed.
    pub fn build_story_prompt(&self, input: &StoryPromptInputs<'_>) -> Result<String> {
        let rendered = PromptEngine::new()?
            .render_story(input)
            .context("render story prompt")?;
        Ok(render_sections(&parse_sections(&rendered)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Conclusion;
    use serde_json::json;

    fn tools() -> Vec<ToolSpec> {
        vec![ToolSpec {
            name: "readFile",
            description: "Read a file from the repository.",
            input_schema: json!({}),
        }]
    }

    fn story() -> Story {
        Story {
            id: "s1".to_string(),
            name: "GitHub login".to_string(),
            text: "Given I am signed out\nWhen I click \"Sign in with GitHub\"\nThen I am signed in"
                .to_string(),
            repo_id: "r1".to_string(),
            branch_name: "main".to_string(),
            commit_sha: Some("abc123".to_string()),
        }
    }

    fn repo() -> RepoIdentity {
        RepoIdentity {
            id: "r1".to_string(),
            slug: "acme/web".to_string(),
        }
    }

    /// Sections render in a fixed order: role, method, tools, advice, rules,
    /// schema, outline.
    #[test]
    fn instruction_ordering_is_stable() {
        let tools = tools();
        let schema = json!({"type": "object"});
        let content = PromptBuilder::new(60_000)
            .build_instructions(&InstructionInputs {
                outline: ".\n├── src\n└── package.json",
                tools: &tools,
                output_schema: &schema,
                max_steps: 30,
                workspace_dir: "workspace/repo",
            })
            .expect("render");

        let positions: Vec<usize> = [
            "expert software QA engineer",
            "## How to evaluate",
            "## Tools",
            "## Advice",
            "## Rules",
            "## Answer schema",
            "## Repository outline",
        ]
        .iter()
        .map(|needle| content.find(needle).expect(needle))
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{positions:?}");
        assert!(content.contains("- `readFile`: Read a file from the repository."));
        assert!(content.contains("at most 30 rounds"));
        assert!(!content.contains("<!--"));
    }

    /// With a tight budget the advice goes first, then the outline is cut.
    #[test]
    fn budget_drops_advice_then_truncates_outline() {
        let tools = tools();
        let schema = json!({"type": "object"});
        let outline = "src/\n".repeat(2_000);
        let input = InstructionInputs {
            outline: &outline,
            tools: &tools,
            output_schema: &schema,
            max_steps: 5,
            workspace_dir: "workspace/repo",
        };
        let content = PromptBuilder::new(4_000)
            .build_instructions(&input)
            .expect("render");

        assert!(!content.contains("## Advice"), "advice should be dropped");
        assert!(content.contains("## Rules"), "rules should remain");
        assert!(content.contains("## Answer schema"), "schema should remain");
        assert!(content.contains("## Repository outline"));
        assert!(content.ends_with("[truncated]"));
        assert!(content.len() <= 4_000 + "\n\n".len() * 6);
    }

    #[test]
    fn story_prompt_includes_run_and_commit() {
        let story = story();
        let repo = repo();
        let content = PromptBuilder::new(60_000)
            .build_story_prompt(&StoryPromptInputs {
                story: &story,
                repo: &repo,
                run_id: Some("run-42"),
                retained: &[],
                focus: &[],
            })
            .expect("render");
        assert!(content.starts_with("Story name: GitHub login"));
        assert!(content.contains("branch main, commit abc123"));
        assert!(content.contains("When I click \"Sign in with GitHub\""));
        assert!(content.contains("Run identifier: run-42"));
        assert!(!content.contains("Already verified"));
    }

    #[test]
    fn partial_prompt_lists_retained_and_focus_steps() {
        let story = story();
        let repo = repo();
        let retained = vec![RetainedStep {
            step: "Given I am signed out".to_string(),
            evidence: vec![EvidenceItem {
                step: Some("Given I am signed out".to_string()),
                file_path: "src/session.ts".to_string(),
                start_line: Some(3),
                end_line: Some(9),
                note: "session guard".to_string(),
                conclusion: Conclusion::Pass,
            }],
        }];
        let focus = vec!["When I click \"Sign in with GitHub\"".to_string()];
        let content = PromptBuilder::new(60_000)
            .build_story_prompt(&StoryPromptInputs {
                story: &story,
                repo: &repo,
                run_id: None,
                retained: &retained,
                focus: &focus,
            })
            .expect("render");
        assert!(content.contains("## Already verified"));
        assert!(content.contains("- src/session.ts:3-9 (pass): session guard"));
        assert!(content.contains("## Steps to re-evaluate\n- When I click"));
        assert!(!content.contains("Run identifier"));
    }
}

use serde_json::json;
use tracing::debug;

use super::{GetLibraryDocsInput, ResolveLibraryInput, ToolContext, ToolOutcome};
use crate::core::sanitize::truncate_chars;

const DEFAULT_DOC_TOKENS: usize = 5_000;

pub(super) fn resolve(input: &ResolveLibraryInput, ctx: &ToolContext<'_>) -> ToolOutcome {
    match ctx.docs.resolve_library(&input.library_name) {
        Ok(matches) if matches.is_empty() => ToolOutcome::Output(format!(
            "No documentation library matches '{}'. Continue with the source code.",
            input.library_name
        )),
        Ok(matches) => {
            let libraries: Vec<_> = matches
                .iter()
                .map(|m| {
                    json!({
                        "libraryId": m.library_id,
                        "name": m.name,
                        "documents": m.document_count,
                    })
                })
                .collect();
            ToolOutcome::Output(json!({ "libraries": libraries }).to_string())
        }
        Err(err) => {
            debug!(error = %err, "resolve library failed");
            ToolOutcome::Failed(format!("Documentation lookup failed: {err:#}"))
        }
    }
}

pub(super) fn fetch(input: &GetLibraryDocsInput, ctx: &ToolContext<'_>) -> ToolOutcome {
    let tokens = input
        .tokens
        .map_or(DEFAULT_DOC_TOKENS, |tokens| tokens as usize);
    match ctx
        .docs
        .library_docs(&input.library_id, input.topic.as_deref(), tokens)
    {
        Ok(None) => ToolOutcome::Failed(format!(
            "Unknown library id '{}'. Call resolveLibrary first.",
            input.library_id
        )),
        Ok(Some(text)) if text.trim().is_empty() => {
            ToolOutcome::Output("No documentation matched the requested topic.".to_string())
        }
        Ok(Some(text)) => ToolOutcome::Output(truncate_chars(&text, ctx.observation_limit)),
        Err(err) => {
            debug!(error = %err, "library docs failed");
            ToolOutcome::Failed(format!("Documentation lookup failed: {err:#}"))
        }
    }
}

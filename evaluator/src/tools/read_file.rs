use tracing::debug;

use super::{ReadFileInput, ToolContext, ToolOutcome};
use crate::core::path::resolve_workspace_path;
use crate::core::sanitize::{sanitize_text, truncate_chars};
use crate::io::sandbox::SandboxError;

pub(super) fn run(
    input: &ReadFileInput,
    ctx: &ToolContext<'_>,
) -> Result<ToolOutcome, SandboxError> {
    let Some(path) = resolve_workspace_path(&input.path, ctx.workspace_dir) else {
        return Ok(ToolOutcome::Rejected(outside_workspace(&input.path, ctx.workspace_dir)));
    };
    debug!(path = %path, "read file");
    let text = read_text(ctx, &path)?;
    Ok(ToolOutcome::Output(truncate_chars(
        &sanitize_text(text.as_bytes()),
        ctx.observation_limit,
    )))
}

pub(super) fn outside_workspace(path: &str, workspace_dir: &str) -> String {
    format!(
        "Path '{path}' resolves outside the repository root '{workspace_dir}'. Use a repository-relative path such as 'src/index.ts'."
    )
}

/// Download `path` and require it to be UTF-8 text.
pub(super) fn read_text(ctx: &ToolContext<'_>, path: &str) -> Result<String, SandboxError> {
    let bytes = ctx.sandbox.download_file(path)?;
    String::from_utf8(bytes).map_err(|_| SandboxError::InvalidUtf8(path.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::docs::NoDocs;
    use crate::test_support::MemorySandbox;
    use std::time::Duration;

    fn ctx<'a>(sandbox: &'a MemorySandbox, docs: &'a NoDocs) -> ToolContext<'a> {
        ToolContext {
            sandbox,
            docs,
            workspace_dir: "workspace/repo",
            command_timeout: Duration::from_secs(5),
            observation_limit: 20,
        }
    }

    fn input(path: &str) -> ReadFileInput {
        ReadFileInput {
            path: path.to_string(),
        }
    }

    #[test]
    fn reads_repo_relative_paths_and_truncates() {
        let sandbox = MemorySandbox::new("sb-1")
            .with_file("workspace/repo/src/a.ts", "export const login = () => true;\n");
        let docs = NoDocs;
        let outcome = run(&input("./src/a.ts"), &ctx(&sandbox, &docs)).expect("read");
        assert_eq!(outcome, ToolOutcome::Output("export const logi...".to_string()));
    }

    #[test]
    fn escaping_paths_are_rejected_without_download() {
        let sandbox = MemorySandbox::new("sb-1").with_file("etc/passwd", "root");
        let docs = NoDocs;
        let outcome = run(&input("../../etc/passwd"), &ctx(&sandbox, &docs)).expect("read");
        let ToolOutcome::Rejected(message) = outcome else {
            panic!("expected rejection");
        };
        assert!(message.contains("outside the repository root"), "{message}");
    }

    #[test]
    fn binary_and_missing_files_are_recoverable_errors() {
        let sandbox = MemorySandbox::new("sb-1").with_bytes(
            "workspace/repo/logo.png",
            vec![0xff, 0xfe, 0x00],
        );
        let docs = NoDocs;
        let err = run(&input("logo.png"), &ctx(&sandbox, &docs)).unwrap_err();
        assert!(matches!(err, SandboxError::InvalidUtf8(_)));
        assert!(!err.is_fatal());

        let err = run(&input("missing.ts"), &ctx(&sandbox, &docs)).unwrap_err();
        assert!(matches!(err, SandboxError::NotFound(_)));
        assert!(!err.is_fatal());
    }
}

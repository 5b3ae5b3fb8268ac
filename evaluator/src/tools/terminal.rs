use serde_json::json;
use tracing::{debug, info};

use super::{TerminalCommandInput, ToolContext, ToolOutcome};
use crate::core::command::{check_read_only, strip_bash_lc_prefix};
use crate::core::sanitize::observation;
use crate::io::sandbox::SandboxError;

pub(super) fn run(
    input: &TerminalCommandInput,
    ctx: &ToolContext<'_>,
) -> Result<ToolOutcome, SandboxError> {
    let command = strip_bash_lc_prefix(&input.command);
    if command.trim().is_empty() {
        return Ok(ToolOutcome::Rejected(
            "Command is empty. Provide a read-only shell command.".to_string(),
        ));
    }
    if let Err(reason) = check_read_only(&command) {
        debug!(command = %command, reason = %reason, "refused mutating command");
        return Ok(ToolOutcome::Rejected(format!(
            "Command refused: {reason}. The repository is read-only; use inspection commands instead."
        )));
    }

    info!(description = %input.description, command = %command, "terminal command");
    let result = ctx
        .sandbox
        .execute_command(&command, ctx.workspace_dir, ctx.command_timeout)?;
    let output = observation(&result.output, ctx.observation_limit);
    if result.exit_code == 0 {
        return Ok(ToolOutcome::Output(output));
    }
    // grep-style tools exit non-zero on "no match"; that is still an answer.
    Ok(ToolOutcome::Output(
        json!({ "exitCode": result.exit_code, "output": output }).to_string(),
    ))
}

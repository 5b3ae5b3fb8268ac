//! Remote execution environment boundary.
//!
//! The evaluator never provisions sandboxes; callers hand it a live one with the
//! repository already checked out. [`Sandbox`] is the capability surface the
//! tools need, and [`SandboxError`] classifies failures so the tool loop can tell
//! "the tool ran and had nothing to say" from "the environment is gone".

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument};

use crate::io::process::run_command_with_timeout;

/// Result of a command that ran to completion, whatever its exit code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_code: i32,
    /// Combined stdout and stderr.
    pub output: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox {sandbox_id} is unreachable: {reason}")]
    Unreachable { sandbox_id: String, reason: String },
    #[error("sandbox call timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("no such file: {0}")]
    NotFound(String),
    #[error("file is not valid UTF-8: {0}")]
    InvalidUtf8(String),
    #[error("sandbox error: {0}")]
    Other(String),
}

impl SandboxError {
    /// Fatal errors mean the tool could not execute at all and end the loop.
    /// Everything else is reported back to the model as an observation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SandboxError::Unreachable { .. }
                | SandboxError::Timeout { .. }
                | SandboxError::PermissionDenied(_)
        )
    }
}

/// Capabilities of a live sandbox. Implementations are used by one evaluation
/// at a time; calls are strictly sequential.
pub trait Sandbox {
    fn id(&self) -> &str;

    /// Run `command` through a shell with `cwd` relative to the sandbox home.
    fn execute_command(
        &self,
        command: &str,
        cwd: &str,
        timeout: Duration,
    ) -> Result<CommandResult, SandboxError>;

    /// Raw bytes of the file at `path`, relative to the sandbox home.
    fn download_file(&self, path: &str) -> Result<Vec<u8>, SandboxError>;
}

/// A sandbox backed by a local directory, e.g. a pre-cloned checkout.
///
/// `home` plays the role of the remote home directory, so a `workspace_dir`
/// of `workspace/repo` resolves to `<home>/workspace/repo`.
#[derive(Debug, Clone)]
pub struct LocalSandbox {
    id: String,
    home: PathBuf,
    output_limit_bytes: usize,
}

impl LocalSandbox {
    pub fn new(id: impl Into<String>, home: impl Into<PathBuf>, output_limit_bytes: usize) -> Self {
        Self {
            id: id.into(),
            home: home.into(),
            output_limit_bytes,
        }
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf, SandboxError> {
        let path = Path::new(relative);
        let escapes = path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
        if escapes {
            return Err(SandboxError::PermissionDenied(format!(
                "{relative} is outside the sandbox home"
            )));
        }
        Ok(self.home.join(path))
    }

    fn ensure_alive(&self) -> Result<(), SandboxError> {
        if self.home.is_dir() {
            return Ok(());
        }
        Err(SandboxError::Unreachable {
            sandbox_id: self.id.clone(),
            reason: format!("{} is not a directory", self.home.display()),
        })
    }
}

impl Sandbox for LocalSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    #[instrument(skip_all, fields(sandbox_id = %self.id, cwd = %cwd))]
    fn execute_command(
        &self,
        command: &str,
        cwd: &str,
        timeout: Duration,
    ) -> Result<CommandResult, SandboxError> {
        self.ensure_alive()?;
        let dir = self.resolve(cwd)?;
        if !dir.is_dir() {
            return Err(SandboxError::NotFound(cwd.to_string()));
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(&dir);
        let output = run_command_with_timeout(cmd, None, timeout, self.output_limit_bytes)
            .map_err(|err| SandboxError::Unreachable {
                sandbox_id: self.id.clone(),
                reason: format!("{err:#}"),
            })?;
        if output.timed_out {
            return Err(SandboxError::Timeout {
                secs: timeout.as_secs(),
            });
        }
        debug!(exit_code = output.exit_code(), "sandbox command finished");
        Ok(CommandResult {
            exit_code: output.exit_code(),
            output: output.combined(),
        })
    }

    #[instrument(skip_all, fields(sandbox_id = %self.id, path = %path))]
    fn download_file(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
        self.ensure_alive()?;
        let full = self.resolve(path)?;
        fs::read(&full).map_err(|err| match err.kind() {
            ErrorKind::NotFound => SandboxError::NotFound(path.to_string()),
            ErrorKind::PermissionDenied => SandboxError::PermissionDenied(path.to_string()),
            _ if full.is_dir() => SandboxError::Other(format!("{path} is a directory")),
            _ => SandboxError::Other(format!("read {path}: {err}")),
        })
    }
}

//! Evaluator configuration stored in `evaluator.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Evaluator configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to the values used in production runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Model identifier passed to the model bridge.
    pub model_id: String,

    /// Generation rounds allowed per evaluation.
    pub max_steps: u32,

    /// Depth of the `tree` outline embedded in the instructions.
    pub outline_depth: u32,

    /// Repository checkout, relative to the sandbox home.
    pub workspace_dir: String,

    /// Tool observations are cut to this many characters before re-entering
    /// model context.
    pub observation_limit_chars: usize,

    /// String fields in the durable tool trace are cut to this many characters.
    pub trace_field_limit_chars: usize,

    /// Byte budget for the rendered instructions.
    pub prompt_budget_bytes: usize,

    /// Per-command timeout for sandbox tool calls.
    pub command_timeout_secs: u64,

    /// Captured output per sandbox command is bounded to this many bytes.
    pub command_output_limit_bytes: usize,

    /// Per-evaluation artifacts (trace, output, meta).
    pub results_dir: PathBuf,

    pub model: ModelConfig,
    pub cache: CacheConfig,
    pub docs: DocsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    /// Bridge process speaking the JSON turn protocol on stdin/stdout.
    pub command: Vec<String>,
    /// Wall-clock budget for a single generation round.
    pub timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            command: vec!["evaluator-model-bridge".to_string()],
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from(".evaluator/cache"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DocsConfig {
    /// Local documentation corpus, one directory per library. Library
    /// documentation tools report "unavailable" when unset.
    pub dir: Option<PathBuf>,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            model_id: "gpt-5-mini".to_string(),
            max_steps: 30,
            outline_depth: 3,
            workspace_dir: "workspace/repo".to_string(),
            observation_limit_chars: 12_000,
            trace_field_limit_chars: 600,
            prompt_budget_bytes: 60_000,
            command_timeout_secs: 120,
            command_output_limit_bytes: 200_000,
            results_dir: PathBuf::from(".evaluator/results"),
            model: ModelConfig::default(),
            cache: CacheConfig::default(),
            docs: DocsConfig::default(),
        }
    }
}

impl EvaluatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.model_id.trim().is_empty() {
            return Err(anyhow!("model_id must not be empty"));
        }
        if self.max_steps == 0 {
            return Err(anyhow!("max_steps must be >= 1"));
        }
        if self.outline_depth == 0 {
            return Err(anyhow!("outline_depth must be >= 1"));
        }
        let workspace = self.workspace_dir.trim_matches('/');
        if workspace.is_empty() || workspace.split('/').any(|part| part == "..") {
            return Err(anyhow!(
                "workspace_dir must be a relative path without '..' segments"
            ));
        }
        if self.observation_limit_chars == 0 {
            return Err(anyhow!("observation_limit_chars must be > 0"));
        }
        if self.trace_field_limit_chars == 0 {
            return Err(anyhow!("trace_field_limit_chars must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.command_output_limit_bytes == 0 {
            return Err(anyhow!("command_output_limit_bytes must be > 0"));
        }
        if self.model.timeout_secs == 0 {
            return Err(anyhow!("model.timeout_secs must be > 0"));
        }
        if self.model.command.is_empty() || self.model.command[0].trim().is_empty() {
            return Err(anyhow!("model.command must be a non-empty array"));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model.timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EvaluatorConfig::default()`.
pub fn load_config(path: &Path) -> Result<EvaluatorConfig> {
    if !path.exists() {
        let cfg = EvaluatorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EvaluatorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EvaluatorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

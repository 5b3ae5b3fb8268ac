//! Result persistence gateway.
//!
//! A running placeholder row is created when an evaluation starts so callers
//! can show progress; the same row is updated in place when the evaluation
//! finishes or fails.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::{Story, StoryTestResult};
use crate::io::config::write_atomic;

pub trait ResultSink {
    /// Insert the placeholder row; returns its identifier.
    fn begin(
        &self,
        story: &Story,
        run_id: Option<&str>,
        placeholder: &StoryTestResult,
    ) -> Result<String>;

    /// Replace the row created by [`ResultSink::begin`].
    fn complete(&self, result_id: &str, result: &StoryTestResult) -> Result<()>;
}

/// Stored row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub result_id: String,
    pub story_id: String,
    pub run_id: Option<String>,
    pub result: StoryTestResult,
}

/// Rows stored as `{dir}/{result_id}/result.json`, next to the trace log.
#[derive(Debug, Clone)]
pub struct JsonResultSink {
    dir: PathBuf,
}

impl JsonResultSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn record_path(&self, result_id: &str) -> PathBuf {
        self.dir.join(result_id).join("result.json")
    }

    pub fn load(&self, result_id: &str) -> Result<ResultRecord> {
        let path = self.record_path(result_id);
        let content =
            fs::read_to_string(&path).with_context(|| format!("read result {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parse result {}", path.display()))
    }

    fn write(&self, record: &ResultRecord) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(record).context("serialize result")?;
        buf.push('\n');
        write_atomic(&self.record_path(&record.result_id), &buf)
    }
}

impl ResultSink for JsonResultSink {
    fn begin(
        &self,
        story: &Story,
        run_id: Option<&str>,
        placeholder: &StoryTestResult,
    ) -> Result<String> {
        let result_id = result_id(&story.id, &placeholder.started_at);
        if self.record_path(&result_id).exists() {
            return Err(anyhow!("result {result_id} already exists"));
        }
        self.write(&ResultRecord {
            result_id: result_id.clone(),
            story_id: story.id.clone(),
            run_id: run_id.map(str::to_string),
            result: placeholder.clone(),
        })?;
        debug!(result_id, "inserted running result");
        Ok(result_id)
    }

    fn complete(&self, result_id: &str, result: &StoryTestResult) -> Result<()> {
        let mut record = self.load(result_id)?;
        record.result = result.clone();
        self.write(&record)?;
        debug!(result_id, status = result.status.as_str(), "updated result");
        Ok(())
    }
}

/// `{story}-{yyyymmddThhmmssmmm}` with only path-safe characters.
fn result_id(story_id: &str, started_at: &str) -> String {
    let story: String = story_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let stamp: String = started_at
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    format!("{story}-{stamp}")
}

//! Evidence cache storage.
//!
//! Entries are stored at `{dir}/{story_id}/{commit_sha}.json`. Writes are
//! last-writer-wins; concurrent evaluations of the same story and commit only
//! cost duplicate work. Identifiers that sanitize to the same path share a
//! file, so reads check the stored identity.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::types::CacheEntry;
use crate::io::config::write_atomic;

pub trait EvidenceCacheStore {
    fn get(&self, story_id: &str, commit_sha: &str) -> Result<Option<CacheEntry>>;

    /// Insert or replace the entry for `(entry.story_id, entry.commit_sha)`.
    fn put(&self, entry: &CacheEntry) -> Result<()>;
}

/// Filesystem-backed cache store.
#[derive(Debug, Clone)]
pub struct FileCacheStore {
    dir: PathBuf,
}

impl FileCacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn entry_path(&self, story_id: &str, commit_sha: &str) -> PathBuf {
        self.dir
            .join(path_segment(story_id))
            .join(format!("{}.json", path_segment(commit_sha)))
    }
}

impl EvidenceCacheStore for FileCacheStore {
    fn get(&self, story_id: &str, commit_sha: &str) -> Result<Option<CacheEntry>> {
        let path = self.entry_path(story_id, commit_sha);
        if !path.exists() {
            return Ok(None);
        }
        debug!(path = %path.display(), "loading cache entry");
        let content =
            fs::read_to_string(&path).with_context(|| format!("read cache {}", path.display()))?;
        let entry: CacheEntry = serde_json::from_str(&content)
            .with_context(|| format!("parse cache {}", path.display()))?;
        if entry.story_id != story_id || entry.commit_sha != commit_sha {
            debug!(
                path = %path.display(),
                stored_story = %entry.story_id,
                stored_commit = %entry.commit_sha,
                "cache file belongs to another story or commit"
            );
            return Ok(None);
        }
        Ok(Some(entry))
    }

    fn put(&self, entry: &CacheEntry) -> Result<()> {
        let path = self.entry_path(&entry.story_id, &entry.commit_sha);
        let mut buf = serde_json::to_string_pretty(entry).context("serialize cache entry")?;
        buf.push('\n');
        write_atomic(&path, &buf)?;
        debug!(path = %path.display(), "saved cache entry");
        Ok(())
    }
}

/// Map an identifier to a single safe path segment.
fn path_segment(id: &str) -> String {
    let segment: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if segment.is_empty() || segment.chars().all(|c| c == '.') {
        format!("_{segment}")
    } else {
        segment
    }
}

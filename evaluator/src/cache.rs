//! Evidence cache operations.
//!
//! Entries are keyed by (story, commit) and every cached assertion remembers
//! the content hash of each file it cites. Lookup re-hashes those files in the
//! sandbox, so a changed file invalidates only the assertions that cite it.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::core::cache_validation::{referenced_files, validate_entry};
use crate::core::normalize::format_timestamp;
use crate::core::path::resolve_workspace_path;
use crate::core::types::{
    AnalysisResult, AnalysisStatus, CacheData, CacheEntry, CachedAssertion, CachedStep,
    Conclusion, EvidenceItem, ModelAnswer, Story, ValidationResult,
};
use crate::io::cache_store::EvidenceCacheStore;
use crate::io::prompt::RetainedStep;
use crate::io::sandbox::{Sandbox, SandboxError};

/// Stable identifier of the entry for a (story, commit) pair.
pub fn get_cache_key(story_id: &str, commit_sha: &str) -> String {
    format!("{story_id}:{commit_sha}")
}

/// SHA-256 of `content`, lowercase hex.
pub fn hash_file_content(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Distinct non-blank file paths cited by `evidence`, sorted.
pub fn extract_files_from_evidence(evidence: &[EvidenceItem]) -> BTreeSet<String> {
    evidence
        .iter()
        .map(|item| item.file_path.trim())
        .filter(|path| !path.is_empty())
        .map(str::to_string)
        .collect()
}

/// Current digest of each path, `None` when the file is missing, outside the
/// workspace or unreadable.
///
/// Only loop-fatal sandbox errors are returned as `Err`.
pub fn current_file_hashes<'a>(
    paths: impl IntoIterator<Item = &'a str>,
    sandbox: &dyn Sandbox,
    workspace_dir: &str,
) -> Result<BTreeMap<String, Option<String>>, SandboxError> {
    let mut hashes = BTreeMap::new();
    for path in paths {
        let digest = match resolve_workspace_path(path, workspace_dir) {
            None => None,
            Some(resolved) => match sandbox.download_file(&resolved) {
                Ok(bytes) => Some(hash_file_content(&bytes)),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    debug!(path, error = %err, "cited file unavailable");
                    None
                }
            },
        };
        hashes.insert(path.to_string(), digest);
    }
    Ok(hashes)
}

/// Hash every distinct file cited by `evidence`. Files that cannot be read are
/// left out.
#[instrument(skip_all, fields(evidence = evidence.len()))]
pub fn build_evidence_hash_map(
    evidence: &[EvidenceItem],
    sandbox: &dyn Sandbox,
    workspace_dir: &str,
) -> Result<BTreeMap<String, String>, SandboxError> {
    let files = extract_files_from_evidence(evidence);
    let hashes = current_file_hashes(files.iter().map(String::as_str), sandbox, workspace_dir)?;
    Ok(hashes
        .into_iter()
        .filter_map(|(path, digest)| digest.map(|digest| (path, digest)))
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    Miss,
    Hit {
        entry: CacheEntry,
        validation: ValidationResult,
    },
}

impl CacheLookup {
    pub fn validation(&self) -> Option<&ValidationResult> {
        match self {
            CacheLookup::Miss => None,
            CacheLookup::Hit { validation, .. } => Some(validation),
        }
    }
}

/// Fetch the entry for (story, commit) and validate it against the sandbox.
///
/// Every failure degrades to [`CacheLookup::Miss`]. An entry recorded for a
/// different story text is a miss as a whole.
#[instrument(skip_all, fields(key = %get_cache_key(&story.id, commit_sha)))]
pub fn lookup_and_validate_cache(
    store: &dyn EvidenceCacheStore,
    story: &Story,
    commit_sha: &str,
    sandbox: &dyn Sandbox,
    workspace_dir: &str,
) -> CacheLookup {
    let entry = match store.get(&story.id, commit_sha) {
        Ok(Some(entry)) => entry,
        Ok(None) => {
            debug!("no cache entry");
            return CacheLookup::Miss;
        }
        Err(err) => {
            warn!(error = %format!("{err:#}"), "cache read failed; treating as miss");
            return CacheLookup::Miss;
        }
    };

    if entry.story_text_hash != hash_file_content(story.text.as_bytes()) {
        info!("story text changed since the entry was written; treating as miss");
        return CacheLookup::Miss;
    }
    if entry.cache_data.steps.is_empty() {
        debug!("cache entry has no steps");
        return CacheLookup::Miss;
    }

    let files = referenced_files(&entry);
    let paths = files.iter().map(String::as_str);
    let current = match current_file_hashes(paths, sandbox, workspace_dir) {
        Ok(current) => current,
        Err(err) => {
            warn!(error = %err, "could not hash cited files; treating as miss");
            return CacheLookup::Miss;
        }
    };
    let validation = validate_entry(&entry, &current);
    info!(
        valid = validation.is_valid,
        invalid_steps = validation.invalid_steps.len(),
        invalid_assertions = validation.invalid_assertions.len(),
        "validated cache entry"
    );
    CacheLookup::Hit { entry, validation }
}

/// Rebuild the verdict stored in a fully valid entry.
pub fn cached_answer(entry: &CacheEntry) -> ModelAnswer {
    let mut assertions: Vec<&CachedAssertion> = entry
        .cache_data
        .steps
        .values()
        .flat_map(|step| step.assertions.values())
        .collect();
    assertions.sort_by_key(|assertion| assertion.position);
    let evidence = assertions
        .into_iter()
        .map(|assertion| assertion.evidence.clone())
        .collect();
    ModelAnswer::synthesized(entry.status, entry.explanation.clone(), evidence)
}

/// Steps that survived validation, and the names of the steps to re-derive.
pub fn partition_steps(
    entry: &CacheEntry,
    validation: &ValidationResult,
) -> (Vec<RetainedStep>, Vec<String>) {
    let mut retained = Vec::new();
    let mut focus = Vec::new();
    for (index, step) in &entry.cache_data.steps {
        if validation.invalid_steps.contains(index) {
            focus.push(step.step.clone());
        } else {
            retained.push(RetainedStep {
                step: step.step.clone(),
                evidence: step
                    .assertions
                    .values()
                    .map(|assertion| assertion.evidence.clone())
                    .collect(),
            });
        }
    }
    (retained, focus)
}

/// Combine still-valid cached steps with a partial re-evaluation.
///
/// Evidence keeps discovery order: retained items sort by their recorded
/// position, fresh evidence for a re-derived step takes the position of that
/// step's first cached item, and fresh evidence for steps the entry never had
/// goes last. A fresh `blocked`/`error` outcome wins; otherwise any failing
/// evidence makes the merged verdict `fail`.
pub fn merge_partial(
    entry: &CacheEntry,
    validation: &ValidationResult,
    fresh: &ModelAnswer,
    story_name: &str,
) -> ModelAnswer {
    let mut slots: Vec<((usize, usize), EvidenceItem)> = Vec::new();
    let mut reused = 0usize;
    for (&index, step) in &entry.cache_data.steps {
        if validation.invalid_steps.contains(&index) {
            continue;
        }
        reused += 1;
        slots.extend(
            step.assertions
                .values()
                .map(|assertion| ((assertion.position, index), assertion.evidence.clone())),
        );
    }
    for item in fresh.evidence() {
        let name = item.step.as_deref().unwrap_or(story_name);
        let slot = entry
            .cache_data
            .steps
            .iter()
            .find(|&(index, step)| validation.invalid_steps.contains(index) && step.step == name)
            .map_or((usize::MAX, usize::MAX), |(index, step)| {
                let first = step.assertions.values().map(|assertion| assertion.position).min();
                (first.unwrap_or(usize::MAX), *index)
            });
        slots.push((slot, item.clone()));
    }
    slots.sort_by_key(|(slot, _)| *slot);
    let evidence: Vec<EvidenceItem> = slots.into_iter().map(|(_, item)| item).collect();

    let fresh_explanation = fresh
        .analysis
        .as_ref()
        .map(|analysis| analysis.explanation.trim())
        .unwrap_or_default();
    let status = match fresh.status {
        AnalysisStatus::Error => AnalysisStatus::Error,
        AnalysisStatus::Blocked | AnalysisStatus::Running => AnalysisStatus::Blocked,
        AnalysisStatus::Pass | AnalysisStatus::Fail => {
            let any_fail = fresh.status == AnalysisStatus::Fail
                || evidence.iter().any(|item| item.conclusion == Conclusion::Fail);
            if any_fail {
                AnalysisStatus::Fail
            } else {
                AnalysisStatus::Pass
            }
        }
    };
    let explanation = format!(
        "{fresh_explanation} ({reused} step(s) reused from cached evidence; {} re-evaluated.)",
        validation.invalid_steps.len()
    );
    ModelAnswer::synthesized(status, explanation.trim_start().to_string(), evidence)
}

/// Build the entry to store for a terminal verdict. Only `pass` and `fail` are
/// cached, and only when every cited file could be hashed.
pub fn build_cache_entry(
    story: &Story,
    commit_sha: &str,
    run_id: Option<&str>,
    analysis: &AnalysisResult,
    hashes: &BTreeMap<String, String>,
    previous: Option<&CacheEntry>,
    now: DateTime<Utc>,
) -> Option<CacheEntry> {
    if !analysis.status.is_verdict() || analysis.evidence.is_empty() {
        return None;
    }

    let mut steps: BTreeMap<usize, CachedStep> = BTreeMap::new();
    for (position, item) in analysis.evidence.iter().enumerate() {
        let path = item.file_path.trim().to_string();
        let Some(digest) = hashes.get(&path) else {
            debug!(path = %path, "cited file has no hash; not caching");
            return None;
        };
        let file_hashes = BTreeMap::from([(path, digest.clone())]);

        let name = item.step.as_deref().unwrap_or(&story.name);
        let index = steps
            .iter()
            .find(|(_, step)| step.step == name)
            .map_or(steps.len(), |(index, _)| *index);
        let step = steps.entry(index).or_insert_with(|| CachedStep {
            step: name.to_string(),
            assertions: BTreeMap::new(),
        });
        step.assertions.insert(
            step.assertions.len(),
            CachedAssertion {
                evidence: item.clone(),
                file_hashes,
                position,
            },
        );
    }

    let now = format_timestamp(now);
    Some(CacheEntry {
        id: get_cache_key(&story.id, commit_sha),
        story_id: story.id.clone(),
        commit_sha: commit_sha.to_string(),
        branch_name: story.branch_name.clone(),
        story_text_hash: hash_file_content(story.text.as_bytes()),
        status: analysis.status,
        explanation: analysis.explanation.clone(),
        cache_data: CacheData { steps },
        run_id: run_id.map(str::to_string),
        created_at: previous.map_or_else(|| now.clone(), |entry| entry.created_at.clone()),
        updated_at: now,
    })
}

/// Upsert `entry`; failures are logged and swallowed.
pub fn write_cache_best_effort(store: &dyn EvidenceCacheStore, entry: &CacheEntry) -> bool {
    match store.put(entry) {
        Ok(()) => {
            debug!(key = %entry.id, "cache entry written");
            true
        }
        Err(err) => {
            warn!(key = %entry.id, error = %format!("{err:#}"), "cache write failed");
            false
        }
    }
}

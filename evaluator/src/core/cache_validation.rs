//! File-granular validation of cached evidence.
//!
//! Validation never touches the sandbox: callers hash the current file contents
//! and pass them in, which keeps the invalidation rules testable in isolation.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::types::{AssertionRef, CacheEntry, ValidationResult};

/// Every file referenced by any cached assertion, deduplicated and sorted.
pub fn referenced_files(entry: &CacheEntry) -> BTreeSet<String> {
    entry
        .cache_data
        .steps
        .values()
        .flat_map(|step| step.assertions.values())
        .flat_map(|assertion| assertion.file_hashes.keys().cloned())
        .collect()
}

/// Compare stored hashes with `current_hashes`.
///
/// `current_hashes` maps a file path to its current digest, or `None` when the
/// file no longer exists. A path missing from the map counts as changed. An
/// assertion is invalid when any of its files changed; a step is invalid when
/// any of its assertions is.
pub fn validate_entry(
    entry: &CacheEntry,
    current_hashes: &BTreeMap<String, Option<String>>,
) -> ValidationResult {
    let mut invalid_steps = Vec::new();
    let mut invalid_assertions = Vec::new();

    for (&step_index, step) in &entry.cache_data.steps {
        let mut step_valid = true;
        for (&assertion_index, assertion) in &step.assertions {
            let unchanged = assertion.file_hashes.iter().all(|(path, stored)| {
                current_hashes
                    .get(path)
                    .and_then(Option::as_ref)
                    .is_some_and(|current| current == stored)
            });
            if !unchanged {
                step_valid = false;
                invalid_assertions.push(AssertionRef {
                    step_index,
                    assertion_index,
                });
            }
        }
        if !step_valid {
            invalid_steps.push(step_index);
        }
    }

    ValidationResult {
        is_valid: invalid_steps.is_empty(),
        invalid_steps,
        invalid_assertions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{
        AnalysisStatus, CacheData, CachedAssertion, CachedStep, Conclusion, EvidenceItem,
    };

    fn assertion(path: &str, hash: &str) -> CachedAssertion {
        CachedAssertion {
            evidence: EvidenceItem {
                step: None,
                file_path: path.to_string(),
                start_line: Some(1),
                end_line: Some(5),
                note: format!("{path} handles it"),
                conclusion: Conclusion::Pass,
            },
            file_hashes: BTreeMap::from([(path.to_string(), hash.to_string())]),
            position: 0,
        }
    }

    fn entry() -> CacheEntry {
        let step = |name: &str, assertions: Vec<CachedAssertion>| CachedStep {
            step: name.to_string(),
            assertions: assertions.into_iter().enumerate().collect(),
        };
        CacheEntry {
            id: "story-1:abc".to_string(),
            story_id: "story-1".to_string(),
            commit_sha: "abc".to_string(),
            branch_name: "main".to_string(),
            story_text_hash: "t".to_string(),
            status: AnalysisStatus::Pass,
            explanation: "all steps found".to_string(),
            cache_data: CacheData {
                steps: BTreeMap::from([
                    (0, step("Given a login page", vec![assertion("a.ts", "ha")])),
                    (
                        1,
                        step(
                            "When I click GitHub",
                            vec![assertion("b.ts", "hb"), assertion("c.ts", "hc")],
                        ),
                    ),
                ]),
            },
            run_id: None,
            created_at: "2026-01-01T00:00:00.000Z".to_string(),
            updated_at: "2026-01-01T00:00:00.000Z".to_string(),
        }
    }

    fn hashes(pairs: &[(&str, Option<&str>)]) -> BTreeMap<String, Option<String>> {
        pairs
            .iter()
            .map(|(path, hash)| (path.to_string(), hash.map(str::to_string)))
            .collect()
    }

    #[test]
    fn unchanged_files_keep_entry_valid() {
        let current = hashes(&[("a.ts", Some("ha")), ("b.ts", Some("hb")), ("c.ts", Some("hc"))]);
        let result = validate_entry(&entry(), &current);
        assert!(result.is_valid);
        assert!(result.invalid_steps.is_empty());
        assert!(result.invalid_assertions.is_empty());
    }

    #[test]
    fn single_changed_file_invalidates_only_its_assertion() {
        let current = hashes(&[
            ("a.ts", Some("ha")),
            ("b.ts", Some("CHANGED")),
            ("c.ts", Some("hc")),
        ]);
        let result = validate_entry(&entry(), &current);
        assert!(!result.is_valid);
        assert_eq!(result.invalid_steps, vec![1]);
        assert_eq!(
            result.invalid_assertions,
            vec![AssertionRef {
                step_index: 1,
                assertion_index: 0
            }]
        );
    }

    #[test]
    fn deleted_or_unhashed_files_count_as_changed() {
        let current = hashes(&[("a.ts", None), ("b.ts", Some("hb"))]);
        let result = validate_entry(&entry(), &current);
        assert_eq!(result.invalid_steps, vec![0, 1]);
        assert_eq!(result.invalid_assertions.len(), 2);
    }

    #[test]
    fn referenced_files_are_deduplicated() {
        let mut cached = entry();
        cached
            .cache_data
            .steps
            .get_mut(&0)
            .expect("step 0")
            .assertions
            .insert(1, assertion("b.ts", "hb"));
        let files: Vec<String> = referenced_files(&cached).into_iter().collect();
        assert_eq!(files, vec!["a.ts", "b.ts", "c.ts"]);
    }
}

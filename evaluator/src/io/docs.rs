//! Library documentation lookup for the `resolveLibrary` / `getLibraryDocs`
//! tools.
//!
//! Documentation is supplementary context only; it never substitutes for
//! repository evidence.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

/// Rough characters-per-token ratio used to size excerpts.
const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryMatch {
    pub library_id: String,
    pub name: String,
    pub document_count: usize,
}

pub trait DocsProvider {
    /// Candidate documentation corpora for a package name, best match first.
    fn resolve_library(&self, name: &str) -> Result<Vec<LibraryMatch>>;

    /// Documentation text for `library_id`, or `None` if the id is unknown.
    fn library_docs(
        &self,
        library_id: &str,
        topic: Option<&str>,
        tokens: usize,
    ) -> Result<Option<String>>;
}

/// Provider used when no documentation source is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDocs;

impl DocsProvider for NoDocs {
    fn resolve_library(&self, _name: &str) -> Result<Vec<LibraryMatch>> {
        Ok(Vec::new())
    }

    fn library_docs(
        &self,
        _library_id: &str,
        _topic: Option<&str>,
        _tokens: usize,
    ) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Local corpus laid out as `<root>/<library-id>/**/*.md`.
#[derive(Debug, Clone)]
pub struct DirectoryDocs {
    root: PathBuf,
}

impl DirectoryDocs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn libraries(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("read docs dir {}", self.root.display()))?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("read docs dir {}", self.root.display()))?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false)
                && let Some(name) = entry.file_name().to_str()
                && !name.starts_with('.')
            {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn documents(&self, library_id: &str) -> Vec<PathBuf> {
        let mut docs: Vec<PathBuf> = WalkDir::new(self.root.join(library_id))
            .into_iter()
            .filter_entry(|e| !is_hidden(e))
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file() && is_doc_file(e.path()))
            .map(|e| e.into_path())
            .collect();
        docs.sort();
        docs
    }
}

impl DocsProvider for DirectoryDocs {
    fn resolve_library(&self, name: &str) -> Result<Vec<LibraryMatch>> {
        let needle = normalize_name(name);
        let mut matches: Vec<(usize, LibraryMatch)> = self
            .libraries()?
            .into_iter()
            .filter_map(|id| {
                let normalized = normalize_name(&id);
                let rank = if normalized == needle {
                    0
                } else if normalized.contains(&needle) || needle.contains(&normalized) {
                    1
                } else {
                    return None;
                };
                let document_count = self.documents(&id).len();
                Some((
                    rank,
                    LibraryMatch {
                        name: id.clone(),
                        library_id: id,
                        document_count,
                    },
                ))
            })
            .collect();
        matches.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.library_id.cmp(&b.1.library_id)));
        debug!(library = name, matches = matches.len(), "resolved library");
        Ok(matches.into_iter().map(|(_, m)| m).collect())
    }

    fn library_docs(
        &self,
        library_id: &str,
        topic: Option<&str>,
        tokens: usize,
    ) -> Result<Option<String>> {
        let known = self.libraries()?;
        if !known.iter().any(|id| id == library_id) {
            return Ok(None);
        }

        let topic = topic.map(str::to_lowercase).filter(|t| !t.trim().is_empty());
        let mut sections = Vec::new();
        for path in self.documents(library_id) {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("read doc {}", path.display()))?;
            let relative = path
                .strip_prefix(self.root.join(library_id))
                .unwrap_or(path.as_path())
                .display()
                .to_string();
            for paragraph in text.split("\n\n") {
                let relevant = topic
                    .as_deref()
                    .is_none_or(|t| paragraph.to_lowercase().contains(t));
                if relevant && !paragraph.trim().is_empty() {
                    sections.push(format!("[{relative}]\n{}", paragraph.trim()));
                }
            }
        }

        let mut excerpt = String::new();
        let limit = tokens.saturating_mul(CHARS_PER_TOKEN);
        for section in sections {
            if excerpt.len() + section.len() + 2 > limit {
                break;
            }
            excerpt.push_str(&section);
            excerpt.push_str("\n\n");
        }
        Ok(Some(excerpt.trim_end().to_string()))
    }
}

fn normalize_name(name: &str) -> String {
    name.trim()
        .trim_start_matches('@')
        .to_lowercase()
        .replace(['/', '_', '.'], "-")
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|s| s.starts_with('.'))
            .unwrap_or(false)
}

fn is_doc_file(path: &Path) -> bool {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    matches!(ext, "md" | "mdx" | "txt" | "rst")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus() -> (tempfile::TempDir, DirectoryDocs) {
        let temp = tempfile::tempdir().expect("tempdir");
        let lib = temp.path().join("next-auth");
        fs::create_dir_all(lib.join("guides")).expect("mkdir");
        fs::write(
            lib.join("README.md"),
            "# NextAuth\n\nProviders configure OAuth.\n\nSessions are stored in cookies.",
        )
        .expect("write");
        fs::write(lib.join("guides/github.md"), "GitHub provider needs a client id.")
            .expect("write");
        fs::create_dir_all(temp.path().join("prisma")).expect("mkdir");
        let docs = DirectoryDocs::new(temp.path());
        (temp, docs)
    }

    #[test]
    fn resolves_scoped_and_partial_names() {
        let (_temp, docs) = corpus();
        let matches = docs.resolve_library("next-auth").expect("resolve");
        assert_eq!(matches[0].library_id, "next-auth");
        assert_eq!(matches[0].document_count, 2);
        assert!(docs.resolve_library("@auth").expect("resolve").len() == 1);
        assert!(docs.resolve_library("django").expect("resolve").is_empty());
    }

    #[test]
    fn filters_docs_by_topic() {
        let (_temp, docs) = corpus();
        let text = docs
            .library_docs("next-auth", Some("oauth"), 1_000)
            .expect("docs")
            .expect("known library");
        assert!(text.contains("Providers configure OAuth."));
        assert!(!text.contains("cookies"));
    }

    #[test]
    fn unknown_library_is_none() {
        let (_temp, docs) = corpus();
        assert_eq!(docs.library_docs("react", None, 1_000).expect("docs"), None);
    }
}

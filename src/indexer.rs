//! AST indexer: drives the parser registry over files and directories
//!
//! Degradation rules:
//! - `parser_unavailable` never propagates out of indexing. The file gets
//!   a synthetic module record (no functions, `partially_indexed = true`)
//!   with the failure reason encoded in `parser`, so "parsed, zero
//!   functions" stays distinguishable from "could not parse".
//! - Provider failures are soft: AST facts are kept, the file is marked
//!   partial, and a per-file diagnostic is recorded. A provider outage
//!   never zeroes out `files_processed`.

use std::path::Path;

use ignore::WalkBuilder;
use tracing::{debug, warn};

use crate::error::{RepoFactsError, Result};
use crate::provider::Provider;
use crate::registry::{ParseOutcome, ParserRegistry};
use crate::schema::{FunctionRecord, ModuleRecord};

/// Directories never descended into, regardless of `max_files` or
/// gitignore state: generated output and tool-state trees.
pub const SKIP_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    "target",
    "dist",
    "build",
    "out",
    "__pycache__",
    ".venv",
    "venv",
    ".cache",
    ".next",
    "coverage",
    "vendor",
    ".repofacts",
];

/// One file's indexing result
#[derive(Debug, Clone)]
pub struct IndexedFile {
    /// Backend that produced the facts, or `unavailable:<language>` when
    /// no parser applied
    pub parser: String,
    pub functions: Vec<FunctionRecord>,
    pub module: ModuleRecord,
    /// Structural extraction or enrichment degraded for this file
    pub partially_indexed: bool,
}

/// Options for bounded directory extraction
#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    /// Cap on files indexed (bounded-cost sampling); None = no cap
    pub max_files: Option<usize>,
}

/// Aggregate result of a directory extraction run
#[derive(Debug, Default)]
pub struct DirectoryExtraction {
    pub files: Vec<IndexedFile>,
    pub stats: IndexStats,
}

/// Counters and per-file diagnostics from an extraction run
#[derive(Debug, Default)]
pub struct IndexStats {
    pub files_processed: usize,
    pub files_skipped: usize,
    pub functions_indexed: usize,
    pub partially_indexed: usize,
    /// (file path, diagnostic message)
    pub diagnostics: Vec<(String, String)>,
}

/// Drives the registry over files; holds no parser state of its own.
///
/// The registry is injected by reference: one registry per process,
/// reused across every indexer and session.
pub struct Indexer<'a> {
    registry: &'a ParserRegistry,
}

impl<'a> Indexer<'a> {
    pub fn new(registry: &'a ParserRegistry) -> Self {
        Self { registry }
    }

    /// Index one file. `content` overrides reading from disk (used by
    /// watch layers that already hold the new text).
    pub fn index_file(&self, path: &Path, content: Option<&str>) -> Result<IndexedFile> {
        let owned;
        let source = match content {
            Some(text) => text,
            None => {
                owned = std::fs::read_to_string(path).map_err(|_| RepoFactsError::FileNotFound {
                    path: path.display().to_string(),
                })?;
                &owned
            }
        };

        match self.registry.parse_file(path, source)? {
            ParseOutcome::Parsed(parsed) => Ok(IndexedFile {
                parser: parsed.parser,
                functions: parsed.functions,
                module: parsed.module,
                partially_indexed: false,
            }),
            ParseOutcome::Unavailable {
                language,
                missing_module,
            } => {
                debug!(
                    path = %path.display(),
                    language,
                    missing_module,
                    "degrading to text module record"
                );
                let reason = format!("unavailable:{}", language);
                Ok(IndexedFile {
                    parser: reason.clone(),
                    functions: Vec::new(),
                    module: ModuleRecord {
                        file_path: path.to_string_lossy().to_string(),
                        language: reason,
                        partially_indexed: true,
                        ..Default::default()
                    },
                    partially_indexed: true,
                })
            }
        }
    }

    /// Index every eligible file under `root`, honoring the skip-list and
    /// an optional `max_files` cap.
    ///
    /// When a provider is given, each function's `purpose` is enriched via
    /// `chat`. Enrichment failure marks the file partial and records a
    /// diagnostic but keeps its AST facts.
    pub fn extract_from_directory(
        &self,
        root: &Path,
        options: &ExtractOptions,
        provider: Option<&dyn Provider>,
    ) -> Result<DirectoryExtraction> {
        crate::paths::ensure_directory(root)?;

        let mut extraction = DirectoryExtraction::default();
        let walker = WalkBuilder::new(root)
            .follow_links(false)
            .filter_entry(|entry| {
                let name = entry.file_name().to_string_lossy();
                !(entry.file_type().is_some_and(|t| t.is_dir()) && SKIP_DIRS.contains(&name.as_ref()))
            })
            .build();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(error = %err, "walk error, skipping entry");
                    extraction.stats.files_skipped += 1;
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            if let Some(cap) = options.max_files {
                if extraction.stats.files_processed >= cap {
                    extraction.stats.files_skipped += 1;
                    continue;
                }
            }

            let path = entry.path();
            let mut indexed = match self.index_file(path, None) {
                Ok(indexed) => indexed,
                Err(err) => {
                    extraction.stats.files_skipped += 1;
                    extraction
                        .stats
                        .diagnostics
                        .push((path.display().to_string(), err.to_string()));
                    continue;
                }
            };

            if let Some(provider) = provider {
                if let Err(message) = enrich(&mut indexed, provider) {
                    indexed.partially_indexed = true;
                    indexed.module.partially_indexed = true;
                    extraction
                        .stats
                        .diagnostics
                        .push((path.display().to_string(), message));
                }
            }

            extraction.stats.files_processed += 1;
            extraction.stats.functions_indexed += indexed.functions.len();
            if indexed.partially_indexed {
                extraction.stats.partially_indexed += 1;
            }
            extraction.files.push(indexed);
        }

        Ok(extraction)
    }
}

/// Fill function purposes from the provider; first failure aborts
/// enrichment for the file and reports the diagnostic.
fn enrich(indexed: &mut IndexedFile, provider: &dyn Provider) -> std::result::Result<(), String> {
    for function in &mut indexed.functions {
        let prompt = format!(
            "Summarize in one line what this function does:\n{}",
            function.signature
        );
        match provider.chat(&prompt) {
            Ok(purpose) => function.purpose = purpose.trim().to_string(),
            Err(err) => {
                return Err(RepoFactsError::LlmExecutionFailed {
                    message: err.to_string(),
                }
                .to_string())
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderError, UnavailableProvider};
    use std::fs;
    use tempfile::TempDir;

    struct EchoProvider;

    impl Provider for EchoProvider {
        fn model_id(&self) -> &str {
            "echo"
        }
        fn chat(&self, _prompt: &str) -> std::result::Result<String, ProviderError> {
            Ok("does a thing".to_string())
        }
        fn embed(&self, _text: &str) -> std::result::Result<Vec<f32>, ProviderError> {
            Ok(vec![1.0, 0.0])
        }
    }

    fn write_fixture(dir: &TempDir) {
        fs::write(
            dir.path().join("a.js"),
            "export function one(x) { return x; }\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("b.py"),
            "def two(y):\n    return y\n",
        )
        .unwrap();
        fs::write(dir.path().join("notes.md"), "# notes\n").unwrap();
        fs::create_dir_all(dir.path().join("node_modules/dep")).unwrap();
        fs::write(
            dir.path().join("node_modules/dep/index.js"),
            "function hidden() {}\n",
        )
        .unwrap();
    }

    #[test]
    fn test_index_file_missing_is_error() {
        let registry = ParserRegistry::new();
        let indexer = Indexer::new(&registry);
        let err = indexer
            .index_file(Path::new("/no/such/file.rs"), None)
            .unwrap_err();
        assert_eq!(err.code(), "file_not_found");
    }

    #[test]
    fn test_unavailable_parser_degrades_to_synthetic_record() {
        let registry = ParserRegistry::new();
        let indexer = Indexer::new(&registry);
        let indexed = indexer
            .index_file(Path::new("Main.kt"), Some("fun main() {}"))
            .unwrap();
        assert!(indexed.partially_indexed);
        assert!(indexed.functions.is_empty());
        assert_eq!(indexed.parser, "unavailable:kt");
        assert!(indexed.module.partially_indexed);
    }

    #[test]
    fn test_parsed_zero_functions_is_not_degraded() {
        let registry = ParserRegistry::new();
        let indexer = Indexer::new(&registry);
        let indexed = indexer
            .index_file(Path::new("README.md"), Some("# hello\n"))
            .unwrap();
        assert!(!indexed.partially_indexed);
        assert!(indexed.functions.is_empty());
        assert_eq!(indexed.parser, "markdown");
    }

    #[test]
    fn test_directory_extraction_skips_state_dirs() {
        let dir = TempDir::new().unwrap();
        write_fixture(&dir);

        let registry = ParserRegistry::new();
        let indexer = Indexer::new(&registry);
        let extraction = indexer
            .extract_from_directory(dir.path(), &ExtractOptions::default(), None)
            .unwrap();

        assert_eq!(extraction.stats.files_processed, 3);
        assert!(extraction
            .files
            .iter()
            .all(|f| !f.module.file_path.contains("node_modules")));
        assert_eq!(extraction.stats.functions_indexed, 2);
    }

    #[test]
    fn test_max_files_caps_processing() {
        let dir = TempDir::new().unwrap();
        write_fixture(&dir);

        let registry = ParserRegistry::new();
        let indexer = Indexer::new(&registry);
        let extraction = indexer
            .extract_from_directory(
                dir.path(),
                &ExtractOptions { max_files: Some(1) },
                None,
            )
            .unwrap();

        assert_eq!(extraction.stats.files_processed, 1);
        assert!(extraction.stats.files_skipped >= 2);
    }

    #[test]
    fn test_provider_failure_marks_partial_but_keeps_facts() {
        let dir = TempDir::new().unwrap();
        write_fixture(&dir);

        let registry = ParserRegistry::new();
        let indexer = Indexer::new(&registry);
        let provider = UnavailableProvider;
        let extraction = indexer
            .extract_from_directory(dir.path(), &ExtractOptions::default(), Some(&provider))
            .unwrap();

        // provider outage never zeroes out files_processed
        assert_eq!(extraction.stats.files_processed, 3);
        assert_eq!(extraction.stats.functions_indexed, 2);
        assert!(!extraction.stats.diagnostics.is_empty());
        let code_files: Vec<_> = extraction
            .files
            .iter()
            .filter(|f| !f.functions.is_empty())
            .collect();
        assert!(code_files.iter().all(|f| f.partially_indexed));
    }

    #[test]
    fn test_provider_success_fills_purpose() {
        let dir = TempDir::new().unwrap();
        write_fixture(&dir);

        let registry = ParserRegistry::new();
        let indexer = Indexer::new(&registry);
        let extraction = indexer
            .extract_from_directory(dir.path(), &ExtractOptions::default(), Some(&EchoProvider))
            .unwrap();

        let with_functions = extraction
            .files
            .iter()
            .find(|f| !f.functions.is_empty())
            .unwrap();
        assert_eq!(with_functions.functions[0].purpose, "does a thing");
        assert!(!with_functions.partially_indexed);
    }
}

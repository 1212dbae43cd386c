//! repofacts: per-workspace code knowledge store
//!
//! Turns a source tree into queryable structured facts (functions,
//! modules) plus derived artifacts (embeddings, context packs), persisted
//! per workspace so callers retrieve relevant code context without
//! re-scanning the repository per query.
//!
//! Layers, leaf-first:
//!
//! - [`registry::ParserRegistry`] — per-language tree-sitter analysis with
//!   a typed "parser unavailable" diagnostic
//! - [`indexer::Indexer`] — drives the registry over files/directories,
//!   fingerprints function behavior, degrades instead of failing
//! - [`store::Store`] — SQLite-backed storage: entities, context packs,
//!   embeddings with similarity search, evidence, metadata, and path
//!   rebinding when the store is relocated
//! - [`evidence::EvidenceVerifier`] — re-anchors recorded citations
//!   against current file content
//! - [`lock`] — the per-workspace exclusive mutating lease
//!
//! # Example
//!
//! ```ignore
//! use repofacts::{Indexer, ParserRegistry, Store, StoreOptions};
//!
//! let registry = ParserRegistry::new();
//! let indexer = Indexer::new(&registry);
//! let mut store = Store::initialize(workspace, &StoreOptions::default())?;
//!
//! let indexed = indexer.index_file(path, None)?;
//! for function in &indexed.functions {
//!     store.upsert_function(function)?;
//! }
//! store.upsert_module(&indexed.module)?;
//! store.close()?;
//! ```

pub mod error;
pub mod evidence;
pub mod fingerprint;
pub mod indexer;
pub mod lang;
pub mod lock;
pub mod paths;
pub mod provider;
pub mod registry;
pub mod schema;
pub mod store;

// Re-export commonly used types
pub use error::{RepoFactsError, Result};
pub use evidence::{EvidenceVerifier, VerificationSummary};
pub use indexer::{DirectoryExtraction, ExtractOptions, IndexStats, IndexedFile, Indexer};
pub use lang::{Lang, LangFamily};
pub use lock::{acquire_workspace_lock, AcquireOptions, WorkspaceLock};
pub use provider::{Provider, ProviderError};
pub use registry::{ParseOutcome, ParsedFile, ParserRegistry};
pub use schema::{
    BehaviorFlags, CodeSnippet, ContextPack, EmbeddingRecord, EntityType, EvidenceEntry,
    FunctionRecord, LeaseInfo, ModuleRecord, WorkspaceMetadata, SCHEMA_VERSION,
};
pub use store::{ContextPackQuery, SimilarityHit, SimilarityQuery, Store, StoreOptions};

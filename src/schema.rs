//! Persisted data model for the workspace knowledge store

use serde::{Deserialize, Serialize};

/// Current schema version for stored artifacts
///
/// 1.0 - Initial store layout
/// 1.1 - Context packs hash path-normalized fields; evidence gained `stale`
pub const SCHEMA_VERSION: &str = "1.1";

// FNV-1a constants for 64-bit hash
const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// Compute a stable FNV-1a hash (deterministic across runs and platforms)
///
/// Used for context-pack content hashes and evidence snippet hashes.
pub fn fnv1a_hash(data: &str) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in data.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Behavioral fingerprint flags for a function
///
/// Derived from surface syntax by `fingerprint`; a heuristic, not a proof.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BehaviorFlags {
    /// No side effects, no parameter mutation, no throws
    pub is_pure: bool,

    /// Body mutates captured state, performs I/O, throws, or calls a
    /// known-impure builtin
    pub has_side_effects: bool,

    /// A parameter is the target of a mutating operation in the body
    pub modifies_params: bool,

    /// The body contains a reachable throw/panic/raise
    pub throws: bool,

    /// The return expression's free variables intersect the parameter set
    pub return_depends_on_inputs: bool,
}

/// One indexed function, keyed by (file_path, name)
///
/// Upsert is last-write-wins whole-record replace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionRecord {
    /// Workspace-relative file path (absolute only if outside the workspace)
    pub file_path: String,

    /// Function name
    pub name: String,

    /// Signature text as written in source
    pub signature: String,

    /// One-line purpose description (may come from provider enrichment)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub purpose: String,

    /// Start line (1-indexed)
    pub start_line: usize,

    /// End line (1-indexed, inclusive)
    pub end_line: usize,

    /// Confidence in the extracted facts, 0.0..=1.0
    pub confidence: f64,

    /// Behavioral fingerprint
    pub flags: BehaviorFlags,

    /// Times this record was returned to a caller
    #[serde(default)]
    pub access_count: u64,

    /// Times a caller reported an outcome against this record
    #[serde(default)]
    pub outcome_count: u64,
}

impl FunctionRecord {
    /// Stable entity id: `<file_path>::<name>`
    pub fn entity_id(&self) -> String {
        format!("{}::{}", self.file_path, self.name)
    }
}

/// One indexed module, keyed by file path
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleRecord {
    /// Workspace-relative file path
    pub file_path: String,

    /// Language name, or a degraded-parse reason such as
    /// `unavailable:kotlin` when no parser applied
    pub language: String,

    /// Exported symbol names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exports: Vec<String>,

    /// Imported module specifiers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,

    /// Set when structural extraction degraded (no parser, provider failure)
    #[serde(default)]
    pub partially_indexed: bool,
}

/// A code snippet carried inside a context pack
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeSnippet {
    /// Workspace-relative file path
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
}

/// Derived, versioned artifact answering queries about one target entity
///
/// Keyed by (target_id, pack_type). `content_hash` is computed over the
/// semantic fields after path normalization, so equivalent packs hash
/// identically whether the caller supplied absolute or relative paths.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextPack {
    /// Entity this pack describes (function entity id or module path)
    pub target_id: String,

    /// Pack flavor, e.g. "overview", "usage", "pitfalls"
    pub pack_type: String,

    /// Natural-language summary
    pub summary: String,

    /// Bullet-point facts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_facts: Vec<String>,

    /// Supporting snippets (paths stored workspace-relative)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub code_snippets: Vec<CodeSnippet>,

    /// Files this pack draws on (workspace-relative)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_files: Vec<String>,

    /// Paths whose change invalidates this pack (workspace-relative)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invalidation_triggers: Vec<String>,

    /// Schema version the pack was written under
    #[serde(default)]
    pub schema_version: String,

    /// Deterministic hash of the semantic fields (hex, 16 chars)
    #[serde(default)]
    pub content_hash: String,

    /// Times this pack was served
    #[serde(default)]
    pub access_count: u64,
}

impl ContextPack {
    /// Compute the deterministic content hash over semantic fields.
    ///
    /// Field order is fixed explicitly: pack_type, summary, each snippet as
    /// (file_path, start_line, end_line, content), then key_facts, joined
    /// with unit separators. Call only after path normalization.
    pub fn compute_content_hash(&self) -> String {
        let mut buf = String::new();
        buf.push_str(&self.pack_type);
        buf.push('\x1f');
        buf.push_str(&self.summary);
        for snippet in &self.code_snippets {
            buf.push('\x1f');
            buf.push_str(&snippet.file_path);
            buf.push('\x1f');
            buf.push_str(&snippet.start_line.to_string());
            buf.push('\x1f');
            buf.push_str(&snippet.end_line.to_string());
            buf.push('\x1f');
            buf.push_str(&snippet.content);
        }
        for fact in &self.key_facts {
            buf.push('\x1f');
            buf.push_str(fact);
        }
        format!("{:016x}", fnv1a_hash(&buf))
    }
}

/// Entity kinds that can carry embeddings and evidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Function,
    Module,
    ContextPack,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Module => "module",
            Self::ContextPack => "context_pack",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "function" => Some(Self::Function),
            "module" => Some(Self::Module),
            "context_pack" => Some(Self::ContextPack),
            _ => None,
        }
    }
}

/// A stored embedding vector for one entity under one model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub model_id: String,
    /// Unit-normalized by the caller; the store never renormalizes
    pub vector: Vec<f32>,
}

/// A recorded citation binding a claim to file/line/snippet
///
/// Mutated only by verification; never deleted automatically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceEntry {
    /// Row id (0 until persisted)
    #[serde(default)]
    pub id: i64,

    pub entity_id: String,
    pub entity_type: String,

    /// The claim this citation supports
    pub claim: String,

    /// Original confidence label; verification never touches it
    pub confidence: String,

    /// Workspace-relative file path
    pub file_path: String,

    /// Start line (1-indexed) of the cited snippet
    pub line: usize,

    /// End line (1-indexed, inclusive)
    pub end_line: usize,

    /// Cited source text
    pub snippet: String,

    /// FNV-1a hash of the snippet at record/verify time (hex)
    pub content_hash: String,

    /// Set when re-verification could not anchor the snippet
    #[serde(default)]
    pub stale: bool,

    /// RFC 3339 timestamp of the last verification pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<String>,
}

/// Per-workspace store metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceMetadata {
    /// Absolute workspace root the store was last opened against
    pub workspace: String,

    /// Schema version the store was written under
    pub schema_version: String,
}

/// On-disk lease naming the process allowed to mutate the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub pid: u32,

    /// RFC 3339 timestamp of lease acquisition
    pub started_at: String,

    /// Start time (seconds since epoch) of the owning process, as reported
    /// by the OS. Defends against pid reuse: a recycled pid will not match.
    pub process_started_at: u64,
}

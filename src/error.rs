//! Error types and machine-checkable error codes for repofacts

use thiserror::Error;

/// Main error type for repofacts operations
#[derive(Error, Debug)]
pub enum RepoFactsError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("No parser available for {language}: install {missing_module}")]
    ParserUnavailable {
        language: String,
        missing_module: String,
    },

    #[error("Provider call failed: {message}")]
    LlmExecutionFailed { message: String },

    #[error("Store is locked by pid {owner_pid} (since {owner_started_at})")]
    StorageLocked {
        owner_pid: u32,
        owner_started_at: String,
    },

    #[error("Lease held by pid {owner_pid} (since {owner_started_at}); timed out after {timeout_ms}ms")]
    LeaseConflict {
        owner_pid: u32,
        owner_started_at: String,
        timeout_ms: u64,
    },

    #[error("Embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Workspace error: {message}")]
    Workspace { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RepoFactsError {
    /// Stable machine-checkable error code.
    ///
    /// Callers (CLI, MCP adapters) dispatch on these strings rather than
    /// on display text, which is free to change.
    pub fn code(&self) -> &'static str {
        match self {
            Self::FileNotFound { .. } => "file_not_found",
            Self::ParserUnavailable { .. } => "parser_unavailable",
            Self::LlmExecutionFailed { .. } => "llm_execution_failed",
            Self::StorageLocked { .. } => "storage_locked",
            Self::LeaseConflict { .. } => "lease_conflict",
            Self::DimensionMismatch { .. } => "dimension_mismatch",
            Self::Workspace { .. } => "workspace",
            Self::Storage(_) => "storage",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
        }
    }

    /// Whether the caller can degrade and continue instead of aborting.
    ///
    /// Parser and provider failures degrade to partial results; lock and
    /// storage failures are fatal to the current mutation attempt.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ParserUnavailable { .. } | Self::LlmExecutionFailed { .. }
        )
    }
}

/// Result type alias for repofacts operations
pub type Result<T> = std::result::Result<T, RepoFactsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        let err = RepoFactsError::ParserUnavailable {
            language: "kotlin".to_string(),
            missing_module: "tree-sitter-kotlin".to_string(),
        };
        assert_eq!(err.code(), "parser_unavailable");

        let err = RepoFactsError::LeaseConflict {
            owner_pid: 1234,
            owner_started_at: "2026-01-01T00:00:00Z".to_string(),
            timeout_ms: 500,
        };
        assert_eq!(err.code(), "lease_conflict");
    }

    #[test]
    fn test_recoverable_classification() {
        let degradable = RepoFactsError::LlmExecutionFailed {
            message: "timeout".to_string(),
        };
        assert!(degradable.is_recoverable());

        let fatal = RepoFactsError::StorageLocked {
            owner_pid: 42,
            owner_started_at: "2026-01-01T00:00:00Z".to_string(),
        };
        assert!(!fatal.is_recoverable());
    }
}

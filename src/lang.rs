//! Language detection and tree-sitter grammar loading

use std::path::Path;
use tree_sitter::Language;

use crate::error::{RepoFactsError, Result};

/// Supported languages and recognized file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lang {
    TypeScript,
    Tsx,
    JavaScript,
    Jsx,
    Rust,
    Python,
    Go,
    Json,
    Yaml,
    Toml,
    Markdown,
    /// Plain text and text-like files with no structural grammar
    Text,
}

impl Lang {
    /// Detect language from file path extension
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| RepoFactsError::FileNotFound {
                path: format!("{} (no extension)", path.display()),
            })?;

        Self::from_extension(ext)
    }

    /// Detect language from file extension string
    pub fn from_extension(ext: &str) -> Result<Self> {
        match ext.to_lowercase().as_str() {
            "ts" | "mts" | "cts" => Ok(Self::TypeScript),
            "tsx" => Ok(Self::Tsx),
            "js" | "mjs" | "cjs" => Ok(Self::JavaScript),
            "jsx" => Ok(Self::Jsx),
            "rs" => Ok(Self::Rust),
            "py" | "pyi" => Ok(Self::Python),
            "go" => Ok(Self::Go),
            "json" => Ok(Self::Json),
            "yaml" | "yml" => Ok(Self::Yaml),
            "toml" => Ok(Self::Toml),
            "md" | "markdown" => Ok(Self::Markdown),
            "txt" | "text" | "rst" => Ok(Self::Text),
            _ => Err(RepoFactsError::ParserUnavailable {
                language: ext.to_string(),
                missing_module: format!("a tree-sitter grammar for .{}", ext),
            }),
        }
    }

    /// Get the canonical name of the language
    pub fn name(&self) -> &'static str {
        match self {
            Self::TypeScript => "typescript",
            Self::Tsx => "tsx",
            Self::JavaScript => "javascript",
            Self::Jsx => "jsx",
            Self::Rust => "rust",
            Self::Python => "python",
            Self::Go => "go",
            Self::Json => "json",
            Self::Yaml => "yaml",
            Self::Toml => "toml",
            Self::Markdown => "markdown",
            Self::Text => "text",
        }
    }

    /// Grammar backends for this language, in preference order.
    ///
    /// Languages with more than one candidate backend try the preferred
    /// grammar first and fall back to the alternate before declaring the
    /// parser unavailable. Recognized non-code formats return an empty
    /// slice: they index as empty-function module records instead.
    pub fn backends(&self) -> &'static [GrammarBackend] {
        match self {
            Self::TypeScript => &[GrammarBackend::TypeScript, GrammarBackend::JavaScript],
            Self::Tsx => &[GrammarBackend::Tsx, GrammarBackend::TypeScript],
            Self::JavaScript => &[GrammarBackend::JavaScript],
            Self::Jsx => &[GrammarBackend::JavaScript, GrammarBackend::Tsx],
            Self::Rust => &[GrammarBackend::Rust],
            Self::Python => &[GrammarBackend::Python],
            Self::Go => &[GrammarBackend::Go],
            Self::Json | Self::Yaml | Self::Toml | Self::Markdown | Self::Text => &[],
        }
    }

    /// Get the language family for shared fingerprinting logic
    pub fn family(&self) -> LangFamily {
        match self {
            Self::TypeScript | Self::Tsx | Self::JavaScript | Self::Jsx => LangFamily::JavaScript,
            Self::Rust => LangFamily::Rust,
            Self::Python => LangFamily::Python,
            Self::Go => LangFamily::Go,
            Self::Json | Self::Yaml | Self::Toml => LangFamily::Config,
            Self::Markdown | Self::Text => LangFamily::Plain,
        }
    }

    /// Check if this is a programming language (vs config/plain text)
    pub fn is_programming_language(&self) -> bool {
        matches!(
            self.family(),
            LangFamily::JavaScript | LangFamily::Rust | LangFamily::Python | LangFamily::Go
        )
    }
}

/// A concrete tree-sitter grammar a language can be parsed with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GrammarBackend {
    TypeScript,
    Tsx,
    JavaScript,
    Rust,
    Python,
    Go,
}

impl GrammarBackend {
    /// Get the tree-sitter Language for this backend
    pub fn tree_sitter_language(&self) -> Language {
        match self {
            Self::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
            Self::Tsx => tree_sitter_typescript::LANGUAGE_TSX.into(),
            Self::JavaScript => tree_sitter_javascript::LANGUAGE.into(),
            Self::Rust => tree_sitter_rust::LANGUAGE.into(),
            Self::Python => tree_sitter_python::LANGUAGE.into(),
            Self::Go => tree_sitter_go::LANGUAGE.into(),
        }
    }

    /// Crate providing this backend, for install guidance in diagnostics
    pub fn crate_name(&self) -> &'static str {
        match self {
            Self::TypeScript | Self::Tsx => "tree-sitter-typescript",
            Self::JavaScript => "tree-sitter-javascript",
            Self::Rust => "tree-sitter-rust",
            Self::Python => "tree-sitter-python",
            Self::Go => "tree-sitter-go",
        }
    }

    /// Short identifier recorded in `FunctionRecord.parser` fields
    pub fn name(&self) -> &'static str {
        match self {
            Self::TypeScript => "typescript",
            Self::Tsx => "tsx",
            Self::JavaScript => "javascript",
            Self::Rust => "rust",
            Self::Python => "python",
            Self::Go => "go",
        }
    }
}

/// Language families for grouping fingerprinting logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LangFamily {
    /// JavaScript, TypeScript, JSX, TSX
    JavaScript,
    /// Rust
    Rust,
    /// Python
    Python,
    /// Go
    Go,
    /// JSON, YAML, TOML
    Config,
    /// Markdown and plain text
    Plain,
}

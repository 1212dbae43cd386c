//! Injected provider interface for LLM enrichment and embeddings
//!
//! The engine never talks to a model directly; callers inject an
//! implementation of `Provider`. Provider failures are soft: the indexer
//! records a per-file diagnostic and continues with AST-only facts.

use thiserror::Error;

/// Failure from an injected provider call
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider call failed: {0}")]
    Failed(String),
}

/// Adapter over an external LLM/embedding service.
///
/// Implementations own their transport, retries, and authentication.
/// `embed` must return unit-normalized vectors of a fixed dimension per
/// model; the store persists them as-is and never renormalizes.
pub trait Provider {
    /// Model identifier recorded against embeddings produced by `embed`
    fn model_id(&self) -> &str;

    /// Free-form completion, used for purpose summaries and context packs
    fn chat(&self, prompt: &str) -> Result<String, ProviderError>;

    /// Embed one text into a unit-normalized vector
    fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;
}

/// Provider that always fails; used to exercise degradation paths.
#[derive(Debug, Default)]
pub struct UnavailableProvider;

impl Provider for UnavailableProvider {
    fn model_id(&self) -> &str {
        "unavailable"
    }

    fn chat(&self, _prompt: &str) -> Result<String, ProviderError> {
        Err(ProviderError::Unavailable("no provider configured".to_string()))
    }

    fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
        Err(ProviderError::Unavailable("no provider configured".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_provider_fails_softly_typed() {
        let provider = UnavailableProvider;
        assert!(provider.chat("summarize").is_err());
        assert!(provider.embed("text").is_err());
        assert_eq!(provider.model_id(), "unavailable");
    }
}

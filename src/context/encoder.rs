//! Token encoders keyed by model name

use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tiktoken_rs::{cl100k_base, get_bpe_from_model, CoreBPE};
use tracing::debug;

/// Encoder errors
#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("Failed to load encoder: {0}")]
    Load(String),
}

/// Text to token ids; the count is the sequence length
pub trait TokenEncoder: Send + Sync {
    fn encode(&self, text: &str) -> Vec<usize>;

    fn count(&self, text: &str) -> usize {
        self.encode(text).len()
    }
}

/// BPE encoder from tiktoken
pub struct TiktokenEncoder {
    bpe: CoreBPE,
}

impl TiktokenEncoder {
    /// Encoder registered for a model name, if tiktoken knows it
    pub fn for_model(model: &str) -> Result<Self, EncoderError> {
        let bpe = get_bpe_from_model(model).map_err(|e| EncoderError::Load(e.to_string()))?;
        Ok(Self { bpe })
    }

    /// Generic cl100k_base encoder
    pub fn generic() -> Result<Self, EncoderError> {
        let bpe = cl100k_base().map_err(|e| EncoderError::Load(e.to_string()))?;
        Ok(Self { bpe })
    }
}

impl TokenEncoder for TiktokenEncoder {
    fn encode(&self, text: &str) -> Vec<usize> {
        self.bpe.encode_with_special_tokens(text)
    }
}

/// One token per whitespace-separated word; ids are word byte lengths
pub struct WordEncoder;

impl TokenEncoder for WordEncoder {
    fn encode(&self, text: &str) -> Vec<usize> {
        text.split_whitespace().map(str::len).collect()
    }

    fn count(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

/// Cache of encoders per model, filled on first use and never invalidated.
///
/// A model tiktoken does not know resolves to the fallback encoder; that is
/// not an error.
pub struct EncoderRegistry {
    encoders: DashMap<String, Arc<dyn TokenEncoder>>,
    fallback: Arc<dyn TokenEncoder>,
    resolve_models: bool,
}

impl EncoderRegistry {
    /// Registry resolving models through tiktoken, falling back to cl100k_base
    pub fn tiktoken() -> Result<Self, EncoderError> {
        Ok(Self {
            encoders: DashMap::new(),
            fallback: Arc::new(TiktokenEncoder::generic()?),
            resolve_models: true,
        })
    }

    /// Registry handing out the same encoder for every model
    pub fn uniform(encoder: Arc<dyn TokenEncoder>) -> Self {
        Self {
            encoders: DashMap::new(),
            fallback: encoder,
            resolve_models: false,
        }
    }

    /// Pin an encoder for a model name
    pub fn register(&self, model: &str, encoder: Arc<dyn TokenEncoder>) {
        self.encoders.insert(model.to_string(), encoder);
    }

    pub fn for_model(&self, model: &str) -> Arc<dyn TokenEncoder> {
        let cached = self.encoders.get(model).map(|entry| entry.value().clone());
        if let Some(encoder) = cached {
            return encoder;
        }

        let encoder = self.resolve(model);
        self.encoders
            .entry(model.to_string())
            .or_insert(encoder)
            .value()
            .clone()
    }

    fn resolve(&self, model: &str) -> Arc<dyn TokenEncoder> {
        if !self.resolve_models {
            return self.fallback.clone();
        }
        match TiktokenEncoder::for_model(model) {
            Ok(encoder) => {
                debug!("Loaded tiktoken encoder for model {}", model);
                Arc::new(encoder)
            }
            Err(e) => {
                debug!("No encoder for model {} ({}), using fallback", model, e);
                self.fallback.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiktoken_encoder() {
        let encoder = TiktokenEncoder::generic().unwrap();
        let tokens = encoder.count("Hello, world! This is a test.");
        assert!(tokens > 0);
        assert!(tokens < 20);
        assert_eq!(encoder.count(""), 0);
    }

    #[test]
    fn test_word_encoder() {
        let encoder = WordEncoder;
        assert_eq!(encoder.count("Hello world test"), 3);
        assert_eq!(encoder.encode("ab cde"), vec![2, 3]);
    }

    #[test]
    fn test_registry_caches_per_model() {
        let registry = EncoderRegistry::tiktoken().unwrap();
        let first = registry.for_model("gpt-3.5-turbo");
        let second = registry.for_model("gpt-3.5-turbo");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_registry_falls_back_on_unknown_model() {
        let registry = EncoderRegistry::tiktoken().unwrap();
        let encoder = registry.for_model("definitely-not-a-model");
        assert!(encoder.count("Hello there") > 0);
        assert!(Arc::ptr_eq(&encoder, &registry.fallback));
    }

    #[test]
    fn test_uniform_registry_and_pinning() {
        let registry = EncoderRegistry::uniform(Arc::new(WordEncoder));
        assert_eq!(registry.for_model("any").count("one two"), 2);

        registry.register("pinned", Arc::new(TiktokenEncoder::generic().unwrap()));
        assert!(!Arc::ptr_eq(&registry.for_model("pinned"), &registry.for_model("any")));
    }
}

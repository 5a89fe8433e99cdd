//! Embedding clients that map text into the reference similarity space.

use anyhow::Result;

mod openai;

pub use openai::OpenAiEmbedder;

/// Trait implemented by concrete embedding backends.
///
/// The matcher only accepts an embedder whose `model()` matches the model
/// recorded in the vector-store manifest; similarities across mismatched
/// embedding spaces are meaningless.
pub trait TextEmbedder {
    /// Identifier of the embedding model behind this client.
    fn model(&self) -> &str;

    /// Embeds a single text into a unit-length vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embeds a batch of texts, preserving input order.
    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>>;
}

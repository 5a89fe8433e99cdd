#![warn(missing_docs)]
//! Fuzzy matching of food product descriptions against a reference corpus.
//!
//! A query is embedded into the same vector space as a pre-built corpus of
//! USDA branded foods, candidates above a similarity threshold are collapsed
//! to unique text renderings, and a chat model picks the best rendering over
//! several independent trials whose agreement becomes a consensus score.

pub mod catalog;
pub mod chat;
pub mod embedder;
pub mod matcher;
mod retry;
pub mod store;

pub use catalog::{BrandedFood, Catalog};
pub use chat::{OpenAiChat, TokenUsage, TrialRequest, TrialResponse, TrialSelector};
pub use embedder::{OpenAiEmbedder, TextEmbedder};
pub use matcher::{MatchConfig, MatchOutcome, MatchRecord, Matcher, Query};
pub use store::{Candidate, StoreError, StoreManifest, VectorStore, VectorStoreWriter};

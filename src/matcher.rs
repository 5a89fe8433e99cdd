//! Embedding-similarity matcher with an LLM consensus tie-break.
//!
//! The pipeline: embed the query text, scan the reference vector store for
//! rows above a similarity threshold, collapse candidate rows to unique text
//! renderings, ask the chat model to pick the best rendering over several
//! independent trials in a single call, and emit one annotated record per
//! underlying corpus row of each chosen rendering.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::catalog::{BrandedFood, Catalog};
use crate::chat::{TokenUsage, TrialRequest, TrialSelector};
use crate::embedder::TextEmbedder;
use crate::store::VectorStore;

/// Free-text product description to match.
#[derive(Debug, Clone, Default)]
pub struct Query {
    /// Vendor name.
    pub vendor: String,
    /// Brand name.
    pub brand: String,
    /// Product name.
    pub product: String,
}

impl Query {
    /// Space-joined, trimmed rendering used for embedding and prompting.
    pub fn rendered_text(&self) -> String {
        format!("{} {} {}", self.vendor, self.brand, self.product)
            .trim()
            .to_string()
    }
}

/// Tunable knobs for one match call.
#[derive(Debug, Clone)]
pub struct MatchConfig {
    /// Minimum cosine similarity for a corpus row to become a candidate.
    pub embedding_threshold: f32,
    /// Chat model used for the consensus step.
    pub model: String,
    /// Sampling temperature; higher values increase trial diversity.
    pub temperature: f32,
    /// Number of independent trials, and the consensus denominator.
    pub num_trials: u32,
    /// Whether to report prompt/completion token counts for cost accounting.
    pub return_token_usage: bool,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            embedding_threshold: 0.6,
            model: "gpt-4.1-mini".to_string(),
            temperature: 1.0,
            num_trials: 10,
            return_token_usage: false,
        }
    }
}

/// One matched reference row.
#[derive(Debug, Clone)]
pub struct MatchRecord {
    /// Dot-product similarity between the query and this row's vector.
    pub similarity: f32,
    /// Fraction of trials that picked this row's rendered text.
    ///
    /// Summed over emitted records this can exceed 1.0 when one rendering
    /// covers several corpus rows; that multiplication is intentional.
    pub consensus_score: f64,
    /// The full catalog row.
    pub row: BrandedFood,
}

/// Result of one match call.
#[derive(Debug, Clone, Default)]
pub struct MatchOutcome {
    /// Matched rows, possibly empty.
    pub matches: Vec<MatchRecord>,
    /// Token usage of the consensus call, when requested and a call was made.
    pub usage: Option<TokenUsage>,
}

/// Matcher over a fixed reference corpus.
///
/// Holds no mutable state across calls; a batch driver runs one matcher per
/// worker, each with its own catalog connection, sharing the vector store.
pub struct Matcher<E, S> {
    store: Arc<VectorStore>,
    catalog: Catalog,
    embedder: E,
    selector: S,
    config: MatchConfig,
}

impl<E: TextEmbedder, S: TrialSelector> Matcher<E, S> {
    /// Builds a matcher, refusing an embedder whose model differs from the
    /// one recorded in the store manifest.
    pub fn new(
        store: Arc<VectorStore>,
        catalog: Catalog,
        embedder: E,
        selector: S,
        config: MatchConfig,
    ) -> Result<Self> {
        anyhow::ensure!(
            embedder.model() == store.embedding_model(),
            "embedder model '{}' does not match store model '{}'",
            embedder.model(),
            store.embedding_model()
        );
        anyhow::ensure!(config.num_trials >= 1, "num_trials must be at least 1");
        Ok(Self {
            store,
            catalog,
            embedder,
            selector,
            config,
        })
    }

    /// Runs one match with the matcher's configured defaults.
    pub fn find_matches(&self, query: &Query) -> Result<MatchOutcome> {
        self.find_matches_with(query, &self.config)
    }

    /// Runs one match with per-call configuration overrides.
    pub fn find_matches_with(&self, query: &Query, config: &MatchConfig) -> Result<MatchOutcome> {
        anyhow::ensure!(config.num_trials >= 1, "num_trials must be at least 1");
        let text = query.rendered_text();
        let vector = self
            .embedder
            .embed(&text)
            .with_context(|| format!("failed to embed query '{text}'"))?;

        let candidates = self
            .store
            .candidates_above(&vector, config.embedding_threshold)
            .with_context(|| format!("failed to scan store for query '{text}'"))?;
        debug!(query = %text, candidates = candidates.len(), "threshold scan complete");
        if candidates.is_empty() {
            return Ok(MatchOutcome::default());
        }

        let similarity_of: HashMap<usize, f32> = candidates
            .iter()
            .map(|c| (c.index, c.similarity))
            .collect();
        let indexes: Vec<usize> = candidates.iter().map(|c| c.index).collect();
        let rows = self
            .catalog
            .fetch_by_indexes(&indexes)
            .with_context(|| format!("failed to fetch candidate rows for query '{text}'"))?;

        // Collapse candidates to unique renderings; first occurrence fixes
        // the 1-based choice numbering presented to the model.
        let mut choice_of: HashMap<String, usize> = HashMap::new();
        let mut choices: Vec<String> = Vec::new();
        let mut members: Vec<Vec<BrandedFood>> = Vec::new();
        for row in rows {
            let rendering = row.rendered_text();
            let slot = *choice_of.entry(rendering.clone()).or_insert_with(|| {
                choices.push(rendering);
                members.push(Vec::new());
                choices.len() - 1
            });
            members[slot].push(row);
        }

        let prompt = render_prompt(&text, &choices);
        let response = self
            .selector
            .select_trials(&TrialRequest {
                prompt: &prompt,
                model: &config.model,
                temperature: config.temperature,
                num_trials: config.num_trials,
            })
            .with_context(|| format!("consensus call failed for query '{text}'"))?;
        let usage = config.return_token_usage.then_some(response.usage);

        // Group non-null trials by chosen rendering. Out-of-range numbers
        // count like declined trials: ignored, denominator unchanged.
        let mut counts: BTreeMap<usize, u32> = BTreeMap::new();
        for trial in response.trials.iter().flatten() {
            let number = *trial;
            if number >= 1 && (number as usize) <= choices.len() {
                *counts.entry(number as usize - 1).or_insert(0) += 1;
            } else {
                warn!(number, choices = choices.len(), "ignoring out-of-range trial choice");
            }
        }
        if counts.is_empty() {
            return Ok(MatchOutcome {
                matches: Vec::new(),
                usage,
            });
        }

        let mut seen: HashSet<(String, String, String, String, String)> = HashSet::new();
        let mut matches = Vec::new();
        for (slot, count) in counts {
            let consensus_score = f64::from(count) / f64::from(config.num_trials);
            for row in &members[slot] {
                if !seen.insert(row.content_key()) {
                    continue;
                }
                let similarity = similarity_of.get(&row.index).copied().unwrap_or_default();
                matches.push(MatchRecord {
                    similarity,
                    consensus_score,
                    row: row.clone(),
                });
            }
        }
        Ok(MatchOutcome { matches, usage })
    }
}

/// Renders the consensus prompt: the query followed by numbered choices.
pub(crate) fn render_prompt(description: &str, choices: &[String]) -> String {
    let numbered = choices
        .iter()
        .enumerate()
        .map(|(i, choice)| format!("{}. {}", i + 1, choice))
        .collect::<Vec<_>>()
        .join("\n    ");
    format!(
        "Which is the best match to the following food product description?\n\n    \
         {description}\n\nHere are your choices:\n\n    {numbered}\n\n\
         Respond with JSON indicating the number `N` corresponding to the best match \
         or `null` if none of the choices are a good match."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::TrialResponse;
    use crate::store::{dot, VectorStoreWriter};
    use pretty_assertions::assert_eq;
    use std::cell::{Cell, RefCell};
    use tempfile::TempDir;

    struct FixedEmbedder {
        vector: Vec<f32>,
        calls: Cell<usize>,
    }

    impl FixedEmbedder {
        fn new(vector: Vec<f32>) -> Self {
            Self {
                vector,
                calls: Cell::new(0),
            }
        }
    }

    impl TextEmbedder for FixedEmbedder {
        fn model(&self) -> &str {
            "test-model"
        }

        fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            self.calls.set(self.calls.get() + 1);
            Ok(self.vector.clone())
        }

        fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
            Ok(vec![self.vector.clone(); inputs.len()])
        }
    }

    struct ScriptedSelector {
        trials: Vec<Option<i64>>,
        calls: Cell<usize>,
        prompts: RefCell<Vec<String>>,
    }

    impl ScriptedSelector {
        fn new(trials: Vec<Option<i64>>) -> Self {
            Self {
                trials,
                calls: Cell::new(0),
                prompts: RefCell::new(Vec::new()),
            }
        }
    }

    impl TrialSelector for ScriptedSelector {
        fn select_trials(&self, request: &TrialRequest<'_>) -> Result<TrialResponse> {
            self.calls.set(self.calls.get() + 1);
            self.prompts.borrow_mut().push(request.prompt.to_string());
            Ok(TrialResponse {
                trials: self.trials.clone(),
                usage: TokenUsage {
                    prompt_tokens: 120,
                    completion_tokens: 40,
                },
            })
        }
    }

    /// Corpus fixture: idx0 and idx1 render identically ("A Co Widget Foo")
    /// but are distinct rows; idx2 is a different product far from the query.
    fn fixture_rows() -> Vec<BrandedFood> {
        vec![
            BrandedFood {
                index: 0,
                gtin_upc: "00001".to_string(),
                vendor: "A Co".to_string(),
                brand: "Widget".to_string(),
                product: "Foo".to_string(),
                ingredients: "WATER".to_string(),
            },
            BrandedFood {
                index: 1,
                gtin_upc: "00002".to_string(),
                vendor: "A Co".to_string(),
                brand: "Widget".to_string(),
                product: "Foo".to_string(),
                ingredients: "WATER, SALT".to_string(),
            },
            BrandedFood {
                index: 2,
                gtin_upc: "00003".to_string(),
                vendor: "B Co".to_string(),
                brand: "Gadget".to_string(),
                product: "Bar".to_string(),
                ingredients: "SUGAR".to_string(),
            },
        ]
    }

    const FIXTURE_VECTORS: [[f32; 2]; 3] = [[1.0, 0.0], [0.9701425, 0.24253562], [0.0, 1.0]];

    fn fixture_store(dir: &TempDir) -> Arc<VectorStore> {
        let mut writer = VectorStoreWriter::create(dir.path(), 2, "test-model").unwrap();
        for row in &FIXTURE_VECTORS {
            writer.append(row).unwrap();
        }
        writer.finish().unwrap();
        Arc::new(VectorStore::open(dir.path()).unwrap())
    }

    fn fixture_catalog() -> Catalog {
        let mut catalog = Catalog::open_in_memory().unwrap();
        catalog.create_schema().unwrap();
        catalog.insert_rows(&fixture_rows()).unwrap();
        catalog
    }

    fn fixture_query() -> Query {
        Query {
            vendor: "A Co".to_string(),
            brand: "Widget".to_string(),
            product: "Foo".to_string(),
        }
    }

    fn build_matcher(
        dir: &TempDir,
        query_vector: Vec<f32>,
        trials: Vec<Option<i64>>,
        config: MatchConfig,
    ) -> Matcher<FixedEmbedder, ScriptedSelector> {
        Matcher::new(
            fixture_store(dir),
            fixture_catalog(),
            FixedEmbedder::new(query_vector),
            ScriptedSelector::new(trials),
            config,
        )
        .unwrap()
    }

    #[test]
    fn zero_candidates_skip_the_chat_service() {
        let dir = TempDir::new().unwrap();
        // Query orthogonal to every stored vector above the 0.6 threshold.
        let matcher = build_matcher(
            &dir,
            vec![-1.0, 0.0],
            vec![Some(1); 10],
            MatchConfig::default(),
        );

        let outcome = matcher.find_matches(&fixture_query()).unwrap();
        assert!(outcome.matches.is_empty());
        assert_eq!(outcome.usage, None);
        assert_eq!(matcher.selector.calls.get(), 0);
        assert_eq!(matcher.embedder.calls.get(), 1);
    }

    #[test]
    fn duplicate_rendering_emits_every_underlying_row() {
        let dir = TempDir::new().unwrap();
        let mut trials = vec![Some(1); 6];
        trials.extend(vec![None; 4]);
        let matcher = build_matcher(&dir, vec![1.0, 0.0], trials, MatchConfig::default());

        let outcome = matcher.find_matches(&fixture_query()).unwrap();
        assert_eq!(matcher.selector.calls.get(), 1);
        assert_eq!(outcome.matches.len(), 2);
        let total: f64 = outcome.matches.iter().map(|m| m.consensus_score).sum();
        assert!((total - 1.2).abs() < 1e-9, "aggregate score may exceed 1.0");
        for record in &outcome.matches {
            assert!((record.consensus_score - 0.6).abs() < 1e-9);
        }
        assert_eq!(outcome.matches[0].row.index, 0);
        assert_eq!(outcome.matches[1].row.index, 1);
        assert_eq!(outcome.matches[0].similarity, 1.0);
        assert!((outcome.matches[1].similarity - 0.9701425).abs() < 1e-6);
    }

    #[test]
    fn all_null_trials_return_empty() {
        let dir = TempDir::new().unwrap();
        let matcher = build_matcher(&dir, vec![1.0, 0.0], vec![None; 10], MatchConfig::default());

        let outcome = matcher.find_matches(&fixture_query()).unwrap();
        assert!(outcome.matches.is_empty());
        assert_eq!(matcher.selector.calls.get(), 1);
    }

    #[test]
    fn single_trial_scores_exactly_one() {
        let dir = TempDir::new().unwrap();
        let config = MatchConfig {
            num_trials: 1,
            ..MatchConfig::default()
        };
        let matcher = build_matcher(&dir, vec![1.0, 0.0], vec![Some(1)], config);

        let outcome = matcher.find_matches(&fixture_query()).unwrap();
        assert_eq!(outcome.matches.len(), 2);
        assert_eq!(outcome.matches[0].consensus_score, 1.0);
    }

    #[test]
    fn out_of_range_trials_are_ignored() {
        let dir = TempDir::new().unwrap();
        let trials = vec![Some(1), Some(0), Some(99), Some(-3), None, Some(1)];
        let config = MatchConfig {
            num_trials: 6,
            ..MatchConfig::default()
        };
        let matcher = build_matcher(&dir, vec![1.0, 0.0], trials, config);

        let outcome = matcher.find_matches(&fixture_query()).unwrap();
        // Only the two valid `Some(1)` trials count; denominator stays 6.
        assert_eq!(outcome.matches.len(), 2);
        assert!((outcome.matches[0].consensus_score - 2.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn token_usage_reported_when_requested() {
        let dir = TempDir::new().unwrap();
        let config = MatchConfig {
            return_token_usage: true,
            ..MatchConfig::default()
        };
        let matcher = build_matcher(&dir, vec![1.0, 0.0], vec![Some(1); 10], config);

        let outcome = matcher.find_matches(&fixture_query()).unwrap();
        let usage = outcome.usage.expect("usage requested");
        assert_eq!(usage.prompt_tokens, 120);
        assert_eq!(usage.completion_tokens, 40);
    }

    #[test]
    fn candidate_set_matches_brute_force_across_thresholds() {
        let dir = TempDir::new().unwrap();
        let query_vector = [0.8f32, 0.6];

        for step in 0..=10 {
            let threshold = step as f32 / 10.0;
            let expected = FIXTURE_VECTORS
                .iter()
                .filter(|row| dot(*row, &query_vector) >= threshold)
                .count();

            let config = MatchConfig {
                embedding_threshold: threshold,
                ..MatchConfig::default()
            };
            let matcher = build_matcher(&dir, query_vector.to_vec(), vec![None; 10], config);
            matcher.find_matches(&fixture_query()).unwrap();

            if expected == 0 {
                assert_eq!(matcher.selector.calls.get(), 0, "threshold {threshold}");
            } else {
                let prompts = matcher.selector.prompts.borrow();
                let numbered = prompts[0]
                    .lines()
                    .filter(|line| {
                        let t = line.trim_start();
                        t.starts_with(|c: char| c.is_ascii_digit()) && t.contains(". ")
                    })
                    .count();
                // idx0 and idx1 share a rendering, so unique choices shrink by
                // one whenever both pass the threshold.
                let both_duplicates = dot(&FIXTURE_VECTORS[0], &query_vector) >= threshold
                    && dot(&FIXTURE_VECTORS[1], &query_vector) >= threshold;
                let expected_choices = if both_duplicates {
                    expected - 1
                } else {
                    expected
                };
                assert_eq!(numbered, expected_choices, "threshold {threshold}");
            }
        }
    }

    #[test]
    fn identical_content_rows_emit_once() {
        let dir = TempDir::new().unwrap();
        let store = fixture_store(&dir);
        let mut catalog = Catalog::open_in_memory().unwrap();
        catalog.create_schema().unwrap();
        // idx0 and idx1 are byte-identical apart from the index itself.
        let mut rows = fixture_rows();
        rows[1].gtin_upc = rows[0].gtin_upc.clone();
        rows[1].ingredients = rows[0].ingredients.clone();
        catalog.insert_rows(&rows).unwrap();

        let matcher = Matcher::new(
            store,
            catalog,
            FixedEmbedder::new(vec![1.0, 0.0]),
            ScriptedSelector::new(vec![Some(1); 10]),
            MatchConfig::default(),
        )
        .unwrap();

        let outcome = matcher.find_matches(&fixture_query()).unwrap();
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].consensus_score, 1.0);
    }

    #[test]
    fn rejects_embedder_with_mismatched_model() {
        let dir = TempDir::new().unwrap();
        let store = fixture_store(&dir);

        struct WrongModel;
        impl TextEmbedder for WrongModel {
            fn model(&self) -> &str {
                "other-model"
            }
            fn embed(&self, _text: &str) -> Result<Vec<f32>> {
                unreachable!()
            }
            fn embed_batch(&self, _inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
                unreachable!()
            }
        }

        let result = Matcher::new(
            store,
            fixture_catalog(),
            WrongModel,
            ScriptedSelector::new(Vec::new()),
            MatchConfig::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn prompt_numbers_choices_in_first_occurrence_order() {
        let choices = vec!["A Co Widget Foo".to_string(), "B Co Gadget Bar".to_string()];
        let prompt = render_prompt("A Co Widget Foo", &choices);
        assert!(prompt.contains("1. A Co Widget Foo"));
        assert!(prompt.contains("2. B Co Gadget Bar"));
        assert!(prompt.contains("`null`"));
        let one = prompt.find("1. A Co Widget Foo").unwrap();
        let two = prompt.find("2. B Co Gadget Bar").unwrap();
        assert!(one < two);
    }
}

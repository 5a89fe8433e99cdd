//! Chat-completion client used for the consensus tie-break.
//!
//! One API call carries all trials: the request asks for `n` independent
//! completions at the configured temperature, each constrained by a
//! structured-output schema to `{"best": integer|null}`.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::retry::{is_retryable_error, retry_backoff, should_retry};

/// Token counts consumed by one consensus call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt.
    pub prompt_tokens: u64,
    /// Tokens across all sampled completions.
    pub completion_tokens: u64,
}

/// Parameters for one consensus call.
#[derive(Debug, Clone)]
pub struct TrialRequest<'a> {
    /// Rendered prompt presenting the query and numbered choices.
    pub prompt: &'a str,
    /// Chat model identifier.
    pub model: &'a str,
    /// Sampling temperature; higher values increase trial diversity.
    pub temperature: f32,
    /// Number of independent completions requested.
    pub num_trials: u32,
}

/// Outcome of one consensus call: one entry per sampled trial plus usage.
#[derive(Debug, Clone)]
pub struct TrialResponse {
    /// Raw choice number per trial, `None` when the trial declined to pick
    /// or returned an unparseable payload.
    pub trials: Vec<Option<i64>>,
    /// Token usage reported by the service.
    pub usage: TokenUsage,
}

/// Trait implemented by chat backends able to run repeated structured trials.
pub trait TrialSelector {
    /// Issues exactly one API call carrying every trial.
    fn select_trials(&self, request: &TrialRequest<'_>) -> Result<TrialResponse>;
}

/// Blocking chat-completions client for OpenAI-compatible endpoints.
#[derive(Clone)]
pub struct OpenAiChat {
    client: Client,
    endpoint: String,
    max_retries: usize,
}

impl OpenAiChat {
    /// Builds a new chat-completions client.
    pub fn new(
        api_key: String,
        base_url: String,
        timeout: Duration,
        max_retries: usize,
    ) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing OpenAI API key");
        let mut headers = reqwest::header::HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).context("invalid OpenAI API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build chat HTTP client")?;
        let endpoint = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        Ok(Self {
            client,
            endpoint,
            max_retries,
        })
    }
}

impl TrialSelector for OpenAiChat {
    fn select_trials(&self, request: &TrialRequest<'_>) -> Result<TrialResponse> {
        let body = ChatRequest {
            model: request.model,
            temperature: request.temperature,
            n: request.num_trials,
            messages: vec![ChatMessage {
                role: "user",
                content: request.prompt,
            }],
            response_format: best_match_schema(),
        };

        let mut attempt = 0usize;
        let parsed: ChatResponse = loop {
            let response = self.client.post(&self.endpoint).json(&body).send();
            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        // A schema-violating envelope is a decode error, retried
                        // under the same bounded policy as transport failures.
                        match resp.json::<ChatResponse>() {
                            Ok(parsed) => break parsed,
                            Err(err) if attempt + 1 < self.max_retries => {
                                attempt += 1;
                                warn!(error = %err, attempt, "retrying malformed chat response");
                                thread::sleep(retry_backoff(attempt));
                                continue;
                            }
                            Err(err) => {
                                return Err(err).context("failed to parse chat response");
                            }
                        }
                    }

                    let body_text = resp
                        .text()
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    if should_retry(status) && attempt + 1 < self.max_retries {
                        attempt += 1;
                        warn!(%status, attempt, "retrying chat request");
                        thread::sleep(retry_backoff(attempt));
                        continue;
                    }
                    anyhow::bail!("chat request failed ({}): {}", status, body_text);
                }
                Err(err) => {
                    if is_retryable_error(&err) && attempt + 1 < self.max_retries {
                        attempt += 1;
                        warn!(error = %err, attempt, "retrying chat request");
                        thread::sleep(retry_backoff(attempt));
                        continue;
                    }
                    return Err(err.into());
                }
            }
        };

        let trials = parsed
            .choices
            .iter()
            .map(|choice| parse_trial(&choice.message.content))
            .collect();
        Ok(TrialResponse {
            trials,
            usage: TokenUsage {
                prompt_tokens: parsed.usage.prompt_tokens,
                completion_tokens: parsed.usage.completion_tokens,
            },
        })
    }
}

/// Parses one trial's message content.
///
/// A payload that is not valid `{"best": integer|null}` JSON counts as a
/// declined trial rather than failing the whole call.
pub(crate) fn parse_trial(content: &str) -> Option<i64> {
    match serde_json::from_str::<BestMatch>(content) {
        Ok(parsed) => parsed.best,
        Err(err) => {
            warn!(error = %err, content, "discarding malformed trial payload");
            None
        }
    }
}

fn best_match_schema() -> serde_json::Value {
    json!({
        "type": "json_schema",
        "json_schema": {
            "name": "best_match",
            "schema": {
                "type": "object",
                "properties": {
                    "best": {"type": ["integer", "null"]},
                },
                "required": ["best"],
                "additionalProperties": false,
            },
        },
    })
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    n: u32,
    messages: Vec<ChatMessage<'a>>,
    response_format: serde_json::Value,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct BestMatch {
    best: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_integer_and_null_trials() {
        assert_eq!(parse_trial(r#"{"best": 3}"#), Some(3));
        assert_eq!(parse_trial(r#"{"best": null}"#), None);
    }

    #[test]
    fn malformed_payload_counts_as_declined() {
        assert_eq!(parse_trial("not json"), None);
        assert_eq!(parse_trial(r#"{"other": 1}"#), None);
        assert_eq!(parse_trial(r#"{"best": "two"}"#), None);
    }

    #[test]
    fn schema_constrains_to_best_field() {
        let schema = best_match_schema();
        assert_eq!(schema["json_schema"]["name"], "best_match");
        assert_eq!(
            schema["json_schema"]["schema"]["required"],
            serde_json::json!(["best"])
        );
    }
}

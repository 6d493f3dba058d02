//! HTTP client for the intent classifier and the needs extractor.
//!
//! Both endpoints take a bearer token and a JSON body. Connection failures,
//! timeouts, 429 and 5xx answers are retried with exponential backoff; any
//! other non-200 status or an undecodable body fails the call immediately.
//! A call including its retries never outlasts the configured timeout.

use crate::traits::Classifier;
use crate::types::{ClassifierConfig, ClassifierEndpoint, ClassifyError, NeedItem, PipelineError, Result};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Label the intent model uses for off-topic text.
pub const IRRELEVANT_LABEL: &str = "Alakasiz";

/// Score at which an irrelevant verdict deletes the location.
pub const IRRELEVANT_THRESHOLD: f64 = 0.70;

/// Minimum score for a label to be kept.
pub const LABEL_THRESHOLD: f64 = 0.40;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentScore {
    pub label: String,
    pub score: f64,
}

#[derive(Debug, Serialize)]
struct IntentRequest<'a> {
    inputs: &'a str,
}

#[derive(Debug, Serialize)]
struct NeedsRequest<'a> {
    inputs: [&'a str; 1],
}

#[derive(Debug, Default, Deserialize)]
struct NeedsResponse {
    #[serde(default)]
    response: Vec<NeedsResult>,
}

#[derive(Debug, Default, Deserialize)]
struct NeedsResult {
    #[serde(default)]
    processed: ProcessedNeeds,
}

#[derive(Debug, Default, Deserialize)]
struct ProcessedNeeds {
    #[serde(default)]
    detailed_intent_tags: Vec<String>,
}

/// Applies the score thresholds to the first candidate list returned by the
/// intent model. Labels come back lowercased, deduplicated and in the order
/// the model listed them.
pub fn select_intents(candidates: &[IntentScore]) -> std::result::Result<String, ClassifyError> {
    let mut labels: Vec<String> = Vec::new();

    for candidate in candidates {
        if candidate.label == IRRELEVANT_LABEL && candidate.score >= IRRELEVANT_THRESHOLD {
            return Err(ClassifyError::Irrelevant { score: candidate.score });
        }
        if candidate.score >= LABEL_THRESHOLD {
            let label = candidate.label.to_lowercase();
            if !labels.contains(&label) {
                labels.push(label);
            }
        }
    }

    Ok(labels.join(","))
}

pub fn needs_from_tags(tags: &[String]) -> Vec<NeedItem> {
    tags.iter().map(|tag| NeedItem::from_tag(tag)).collect()
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

pub struct HttpClassifier {
    client: Client,
    config: ClassifierConfig,
}

impl HttpClassifier {
    pub fn new(config: ClassifierConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    fn retry_backoff(&self) -> ExponentialBackoff {
        let initial = Duration::from_millis(self.config.retry_delay_ms);
        ExponentialBackoff {
            current_interval: initial,
            initial_interval: initial,
            max_interval: initial * 16,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// One classifier call, retries included, bounded by the configured deadline.
    async fn post_json<B, T>(&self, endpoint: &ClassifierEndpoint, body: &B) -> std::result::Result<T, ClassifyError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let deadline = Duration::from_secs(self.config.timeout_seconds);
        match tokio::time::timeout(deadline, self.post_with_retries(endpoint, body)).await {
            Ok(result) => result,
            Err(_) => Err(ClassifyError::Transient(format!(
                "{} did not answer within {}s",
                endpoint.url, self.config.timeout_seconds
            ))),
        }
    }

    async fn post_with_retries<B, T>(
        &self,
        endpoint: &ClassifierEndpoint,
        body: &B,
    ) -> std::result::Result<T, ClassifyError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut backoff = self.retry_backoff();
        let mut attempt = 0;

        loop {
            let failure = match self
                .client
                .post(endpoint.url.clone())
                .bearer_auth(&endpoint.api_key)
                .json(body)
                .send()
                .await
            {
                Ok(response) if response.status() == StatusCode::OK => {
                    let bytes = response
                        .bytes()
                        .await
                        .map_err(|e| ClassifyError::Transient(format!("failed to read response body: {e}")))?;
                    return serde_json::from_slice(&bytes)
                        .map_err(|e| ClassifyError::Transient(format!("failed to decode response: {e}")));
                }
                Ok(response) => {
                    let status = response.status();
                    let message = format!("{} returned {}", endpoint.url, status);
                    if !is_retryable_status(status) {
                        return Err(ClassifyError::Transient(message));
                    }
                    message
                }
                Err(e) => {
                    let message = format!("request to {} failed: {e}", endpoint.url);
                    if !is_retryable_error(&e) {
                        return Err(ClassifyError::Transient(message));
                    }
                    message
                }
            };

            if attempt >= self.config.max_retries {
                return Err(ClassifyError::Transient(failure));
            }
            attempt += 1;

            let delay = backoff
                .next_backoff()
                .unwrap_or_else(|| Duration::from_millis(self.config.retry_delay_ms));
            warn!(attempt, ?delay, error = %failure, "classifier call failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify_intent(&self, text: &str) -> std::result::Result<String, ClassifyError> {
        let results: Vec<Vec<IntentScore>> = self
            .post_json(&self.config.intent, &IntentRequest { inputs: text })
            .await?;

        // Only the first candidate list is meaningful for a single input.
        let Some(candidates) = results.first() else {
            debug!("intent classifier returned no candidates");
            return Ok(String::new());
        };

        select_intents(candidates)
    }

    async fn extract_needs(&self, text: &str) -> std::result::Result<Vec<NeedItem>, ClassifyError> {
        let needs: NeedsResponse = self
            .post_json(&self.config.needs, &NeedsRequest { inputs: [text] })
            .await?;

        let Some(first) = needs.response.first() else {
            debug!("needs extractor returned no results");
            return Ok(Vec::new());
        };

        Ok(needs_from_tags(&first.processed.detailed_intent_tags))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(label: &str, score: f64) -> IntentScore {
        IntentScore { label: label.to_string(), score }
    }

    #[test]
    fn keeps_labels_at_or_above_threshold() {
        let labels = select_intents(&[score("Lojistik", 0.82), score("Barinma", 0.30), score("Saglik", 0.40)]);
        assert_eq!(labels, Ok("lojistik,saglik".to_string()));
    }

    #[test]
    fn confident_irrelevant_short_circuits() {
        let result = select_intents(&[score("Lojistik", 0.9), score("Alakasiz", 0.70)]);
        assert_eq!(result, Err(ClassifyError::Irrelevant { score: 0.70 }));
    }

    #[test]
    fn weak_irrelevant_is_an_ordinary_label() {
        let labels = select_intents(&[score("Alakasiz", 0.55), score("Enkaz", 0.6)]);
        assert_eq!(labels, Ok("alakasiz,enkaz".to_string()));
    }

    #[test]
    fn irrelevant_below_label_threshold_is_dropped() {
        assert_eq!(select_intents(&[score("Alakasiz", 0.2)]), Ok(String::new()));
    }

    #[test]
    fn duplicate_labels_collapse() {
        let labels = select_intents(&[score("Lojistik", 0.5), score("LOJISTIK", 0.6)]);
        assert_eq!(labels, Ok("lojistik".to_string()));
    }

    #[test]
    fn empty_candidates_yield_empty_string() {
        assert_eq!(select_intents(&[]), Ok(String::new()));
    }

    #[test]
    fn needs_map_to_lowercase_labels() {
        let needs = needs_from_tags(&["Yemek".to_string(), "Su".to_string()]);
        assert_eq!(
            needs,
            vec![
                NeedItem { label: "yemek".into(), status: true },
                NeedItem { label: "su".into(), status: true },
            ]
        );
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable_status(StatusCode::CREATED));
    }
}

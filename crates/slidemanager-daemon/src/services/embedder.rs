//! Embedding clients: OpenAI-compatible HTTP backends behind small traits,
//! plus the retry/zero-vector helpers the pipeline builds on.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::Deserialize;
use thiserror::Error;

use crate::services::rate_limit::{backoff_delay, DualTokenBucket};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum EmbedApiError {
    #[error("rate limited by the embedding provider: {0}")]
    RateLimited(String),
    #[error("embedding provider rejected credentials (status {status}): {message}")]
    Auth { status: u16, message: String },
    #[error("embedding provider server error (status {status}): {message}")]
    Server { status: u16, message: String },
    #[error("network error talking to the embedding provider: {0}")]
    Network(String),
    #[error("malformed embedding response: {0}")]
    Malformed(String),
}

impl EmbedApiError {
    /// Transient errors retry with backoff; auth and malformed responses
    /// never do.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EmbedApiError::RateLimited(_)
                | EmbedApiError::Server { .. }
                | EmbedApiError::Network(_)
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, EmbedApiError::Auth { .. })
    }
}

#[async_trait]
pub trait TextEmbedClient: Send + Sync {
    /// One remote call; returns one vector per input, in order.
    async fn create_embeddings(
        &self,
        model: &str,
        inputs: &[String],
    ) -> Result<Vec<Vec<f32>>, EmbedApiError>;
}

#[async_trait]
pub trait ImageEmbedClient: Send + Sync {
    async fn embed_image(
        &self,
        model: &str,
        image_path: &Path,
    ) -> Result<Vec<f32>, EmbedApiError>;
}

/// Rough token estimate for rate budgeting; always at least 1.
pub fn estimate_tokens(text: &str) -> u64 {
    ((text.len() as f64 / 4.0) * 1.2).max(1.0) as u64
}

/// Little-endian float32 packing; the on-disk vector blob format.
pub fn pack_f32(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

pub fn unpack_f32(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// `dim * 4` zero bytes: the canonical vector for empty text.
pub fn zero_vector(dim: usize) -> Vec<u8> {
    debug_assert!(dim > 0);
    vec![0u8; dim * 4]
}

/// Batch text embedding with rate limiting and retry.
///
/// Empty or whitespace-only inputs never reach the provider: they come back
/// as zero vectors sized `fallback_dim`. Non-empty inputs cost one request
/// plus their estimated tokens against the limiter, then retry transient
/// failures up to `max_retries` with exponential backoff.
pub async fn embed_text_batch(
    client: &dyn TextEmbedClient,
    model: &str,
    inputs: &[String],
    limiter: &DualTokenBucket,
    max_retries: u32,
    fallback_dim: usize,
) -> Result<Vec<Vec<f32>>, EmbedApiError> {
    if inputs.is_empty() {
        return Ok(Vec::new());
    }

    let mut results: Vec<Option<Vec<f32>>> = vec![None; inputs.len()];
    let mut empty_indices = Vec::new();
    let mut remote_indices = Vec::new();
    let mut remote_inputs = Vec::new();
    for (idx, input) in inputs.iter().enumerate() {
        if input.trim().is_empty() {
            empty_indices.push(idx);
        } else {
            remote_indices.push(idx);
            remote_inputs.push(input.clone());
        }
    }

    let mut dim = fallback_dim;
    if !remote_inputs.is_empty() {
        let tok_cost: u64 = remote_inputs.iter().map(|s| estimate_tokens(s)).sum();
        limiter.acquire(1.0, tok_cost as f64).await;

        let vectors = call_with_retry(client, model, &remote_inputs, max_retries).await?;
        if vectors.len() != remote_inputs.len() {
            return Err(EmbedApiError::Malformed(format!(
                "expected {} vectors, got {}",
                remote_inputs.len(),
                vectors.len()
            )));
        }
        if let Some(first) = vectors.first() {
            dim = first.len();
        }
        for (idx, vector) in remote_indices.into_iter().zip(vectors) {
            results[idx] = Some(vector);
        }
    }
    for idx in empty_indices {
        results[idx] = Some(vec![0.0; dim]);
    }

    results
        .into_iter()
        .map(|slot| {
            slot.ok_or_else(|| EmbedApiError::Malformed("missing embedding result".into()))
        })
        .collect()
}

async fn call_with_retry(
    client: &dyn TextEmbedClient,
    model: &str,
    inputs: &[String],
    max_retries: u32,
) -> Result<Vec<Vec<f32>>, EmbedApiError> {
    let mut attempt = 0;
    loop {
        match client.create_embeddings(model, inputs).await {
            Ok(vectors) => return Ok(vectors),
            Err(err) if err.is_transient() && attempt < max_retries => {
                tracing::warn!(%err, attempt, "embedding call failed; retrying");
                tokio::time::sleep(backoff_delay(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// OpenAI-compatible HTTP backend for both text and image embeddings.
pub struct OpenAiEmbedClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiEmbedClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    pub fn from_env() -> Result<Self, EmbedApiError> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| EmbedApiError::Auth {
            status: 0,
            message: "OPENAI_API_KEY is not set".to_string(),
        })?;
        Ok(Self::new(api_key))
    }

    async fn post_embeddings(
        &self,
        body: serde_json::Value,
    ) -> Result<Vec<Vec<f32>>, EmbedApiError> {
        let url = format!("{}/embeddings", self.base_url);
        let response = self
            .http
            .post(&url)
            .timeout(HTTP_TIMEOUT)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| EmbedApiError::Network(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), message));
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|err| EmbedApiError::Malformed(err.to_string()))?;
        let mut data = parsed.data;
        data.sort_by_key(|item| item.index);
        Ok(data.into_iter().map(|item| item.embedding).collect())
    }
}

fn classify_status(status: u16, message: String) -> EmbedApiError {
    match status {
        429 => EmbedApiError::RateLimited(message),
        401 | 403 => EmbedApiError::Auth { status, message },
        500..=599 => EmbedApiError::Server { status, message },
        _ => EmbedApiError::Malformed(format!("unexpected status {status}: {message}")),
    }
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl TextEmbedClient for OpenAiEmbedClient {
    async fn create_embeddings(
        &self,
        model: &str,
        inputs: &[String],
    ) -> Result<Vec<Vec<f32>>, EmbedApiError> {
        self.post_embeddings(serde_json::json!({
            "model": model,
            "input": inputs,
        }))
        .await
    }
}

#[async_trait]
impl ImageEmbedClient for OpenAiEmbedClient {
    async fn embed_image(
        &self,
        model: &str,
        image_path: &Path,
    ) -> Result<Vec<f32>, EmbedApiError> {
        let bytes = tokio::fs::read(image_path)
            .await
            .map_err(|err| EmbedApiError::Network(format!("read {image_path:?}: {err}")))?;
        let encoded = BASE64_STANDARD.encode(&bytes);
        let mut vectors = self
            .post_embeddings(serde_json::json!({
                "model": model,
                "input": [{ "image": encoded }],
            }))
            .await?;
        vectors
            .pop()
            .ok_or_else(|| EmbedApiError::Malformed("empty image embedding response".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Mock that records call counts and fails a configurable number of
    /// times before succeeding.
    struct ScriptedClient {
        calls: AtomicU32,
        failures_before_success: u32,
        failure: fn() -> EmbedApiError,
        dim: usize,
        inputs_seen: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedClient {
        fn succeeding(dim: usize) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures_before_success: 0,
                failure: || EmbedApiError::Network("unused".into()),
                dim,
                inputs_seen: Mutex::new(Vec::new()),
            }
        }

        fn failing_n_times(n: u32, failure: fn() -> EmbedApiError) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures_before_success: n,
                failure,
                dim: 4,
                inputs_seen: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TextEmbedClient for ScriptedClient {
        async fn create_embeddings(
            &self,
            _model: &str,
            inputs: &[String],
        ) -> Result<Vec<Vec<f32>>, EmbedApiError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.inputs_seen
                .lock()
                .expect("inputs mutex poisoned")
                .push(inputs.to_vec());
            if call < self.failures_before_success {
                return Err((self.failure)());
            }
            Ok(inputs.iter().map(|_| vec![0.5; self.dim]).collect())
        }
    }

    fn limiter() -> DualTokenBucket {
        DualTokenBucket::new(6000, 6_000_000)
    }

    #[test]
    fn estimate_tokens_is_at_least_one() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("ab"), 1);
        assert!(estimate_tokens(&"x".repeat(400)) >= 100);
    }

    #[test]
    fn zero_vector_is_dim_times_four_zero_bytes() {
        let blob = zero_vector(3);
        assert_eq!(blob.len(), 12);
        assert!(blob.iter().all(|b| *b == 0));
        assert_eq!(unpack_f32(&blob), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn pack_unpack_roundtrip_is_little_endian() {
        let packed = pack_f32(&[1.0]);
        assert_eq!(packed, 1.0f32.to_le_bytes().to_vec());
        assert_eq!(unpack_f32(&packed), vec![1.0]);
    }

    #[tokio::test]
    async fn empty_inputs_never_reach_the_provider() {
        let client = ScriptedClient::succeeding(4);
        let inputs = vec!["".to_string(), "   ".to_string(), "\n\t".to_string()];
        let vectors = embed_text_batch(&client, "m", &inputs, &limiter(), 3, 4)
            .await
            .expect("all zero vectors");
        assert_eq!(client.call_count(), 0, "no remote call for empty text");
        assert_eq!(vectors.len(), 3);
        assert!(vectors.iter().all(|v| v.len() == 4 && v.iter().all(|x| *x == 0.0)));
    }

    #[tokio::test]
    async fn mixed_batch_embeds_non_empty_and_zero_fills_the_rest() {
        let client = ScriptedClient::succeeding(8);
        let inputs = vec!["hello".to_string(), "".to_string(), "world".to_string()];
        let vectors = embed_text_batch(&client, "m", &inputs, &limiter(), 3, 4)
            .await
            .expect("batch");
        assert_eq!(client.call_count(), 1, "one remote call for the batch");
        assert_eq!(vectors[0], vec![0.5; 8]);
        assert_eq!(vectors[1], vec![0.0; 8], "zero vector adopts the provider dim");
        assert_eq!(vectors[2], vec![0.5; 8]);
        let seen = client.inputs_seen.lock().expect("inputs");
        assert_eq!(seen[0], vec!["hello".to_string(), "world".to_string()]);
    }

    #[tokio::test]
    async fn transient_errors_retry_until_the_cap() {
        let client =
            ScriptedClient::failing_n_times(2, || EmbedApiError::Server {
                status: 503,
                message: "overloaded".into(),
            });
        let inputs = vec!["text".to_string()];
        let vectors = embed_text_batch(&client, "m", &inputs, &limiter(), 3, 4)
            .await
            .expect("succeeds on the third attempt");
        assert_eq!(client.call_count(), 3, "two failures then one success");
        assert_eq!(vectors[0].len(), 4);
    }

    #[tokio::test]
    async fn exceeding_the_retry_cap_raises_the_final_error() {
        let client = ScriptedClient::failing_n_times(10, || {
            EmbedApiError::RateLimited("slow down".into())
        });
        let inputs = vec!["text".to_string()];
        let err = embed_text_batch(&client, "m", &inputs, &limiter(), 2, 4)
            .await
            .expect_err("cap exceeded");
        assert!(matches!(err, EmbedApiError::RateLimited(_)));
        assert_eq!(client.call_count(), 3, "initial attempt plus two retries");
    }

    #[tokio::test]
    async fn auth_errors_never_retry() {
        let client = ScriptedClient::failing_n_times(10, || EmbedApiError::Auth {
            status: 401,
            message: "bad key".into(),
        });
        let inputs = vec!["text".to_string()];
        let err = embed_text_batch(&client, "m", &inputs, &limiter(), 5, 4)
            .await
            .expect_err("auth is terminal");
        assert!(err.is_auth());
        assert_eq!(client.call_count(), 1, "no retry on auth failure");
    }

    #[test]
    fn status_classification() {
        assert!(classify_status(429, String::new()).is_transient());
        assert!(classify_status(503, String::new()).is_transient());
        assert!(classify_status(401, String::new()).is_auth());
        assert!(!classify_status(400, String::new()).is_transient());
    }
}

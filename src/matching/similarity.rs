use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::gemini::GeminiClient;

/// Placeholder text for an empty tag list; it is never sent for embedding.
pub const EMPTY_TAGS_SENTINEL: &str = "無內容";
pub const TAG_DELIMITER: &str = "；";

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[async_trait]
impl Embedder for GeminiClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_content(text).await
    }
}

pub fn tags_to_text(tags: &[String]) -> String {
    let joined = tags
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(TAG_DELIMITER);

    if joined.is_empty() {
        EMPTY_TAGS_SENTINEL.to_string()
    } else {
        joined
    }
}

/// Cosine similarity over the shared prefix of `a` and `b`; 0 when either has no magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let len = a.len().min(b.len());
    if len == 0 {
        return 0.0;
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a[..len].iter().zip(&b[..len]) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

/// Turns tag lists into embeddings and compares them.
#[derive(Clone)]
pub struct PersonalityScorer {
    embedder: Arc<dyn Embedder>,
    timeout: Duration,
    retries: u32,
    backoff: Duration,
}

impl PersonalityScorer {
    pub fn new(embedder: Arc<dyn Embedder>, timeout: Duration, retries: u32) -> Self {
        Self {
            embedder,
            timeout,
            retries,
            backoff: Duration::from_millis(250),
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Embedding for a tag list, or `None` when the list is empty or every attempt failed.
    pub async fn embed_tags(&self, tags: &[String]) -> Option<Vec<f32>> {
        let text = tags_to_text(tags);
        if text == EMPTY_TAGS_SENTINEL {
            return None;
        }

        let attempts = self.retries.saturating_add(1);
        for attempt in 1..=attempts {
            match tokio::time::timeout(self.timeout, self.embedder.embed(&text)).await {
                Ok(Ok(vector)) if !vector.is_empty() => return Some(vector),
                Ok(Ok(_)) => {
                    tracing::warn!(attempt, "embedding provider returned an empty vector");
                }
                Ok(Err(err)) => {
                    tracing::warn!(attempt, error = %err, "embedding call failed");
                }
                Err(_) => {
                    tracing::warn!(
                        attempt,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "embedding call timed out"
                    );
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.backoff * attempt).await;
            }
        }

        None
    }

    pub fn score(elder: Option<&[f32]>, volunteer: Option<&[f32]>) -> f64 {
        match (elder, volunteer) {
            (Some(a), Some(b)) => cosine_similarity(a, b),
            _ => 0.0,
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::errors::{AppError, AppResult};

/// Keep requests safely under the embedding model's context window; dense
/// text can tokenize at more than 2 tokens per character.
const MAX_EMBED_CHARS: usize = 3_000;
const HTTP_TIMEOUT_SECS: u64 = 15;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Fixed output dimension, validated against the vector store at startup.
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> AppResult<Vec<f32>>;
}

fn truncate_for_embedding(text: &str) -> &str {
    if text.len() <= MAX_EMBED_CHARS {
        return text;
    }
    let mut end = MAX_EMBED_CHARS;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Ollama-style `/api/embed` client.
pub struct HttpEmbedder {
    http: reqwest::Client,
    url: String,
    model: String,
    dimension: usize,
}

impl HttpEmbedder {
    pub fn new(url: String, model: String, dimension: usize) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .expect("embedding http client");
        Self {
            http,
            url,
            model,
            dimension,
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> AppResult<Vec<f32>> {
        #[derive(serde::Serialize)]
        struct RequestBody<'a> {
            model: &'a str,
            input: &'a str,
            truncate: bool,
        }

        #[derive(serde::Deserialize)]
        struct Response {
            embeddings: Option<Vec<Vec<f32>>>,
        }

        let body = RequestBody {
            model: &self.model,
            input: truncate_for_embedding(text),
            truncate: true,
        };

        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let parsed: Response = response.json().await.map_err(AppError::from)?;
        let vector = parsed
            .embeddings
            .and_then(|mut batch| batch.pop())
            .ok_or_else(|| AppError::Embedding("response carried no embedding".into()))?;

        if vector.len() != self.dimension {
            return Err(AppError::Embedding(format!(
                "expected dimension {}, got {}",
                self.dimension,
                vector.len()
            )));
        }
        Ok(vector)
    }
}

/// Wrapper enforcing the "never throws" contract: any failure degrades to a
/// zero vector of the configured dimension. A zero vector indexes fine and
/// simply never wins a similarity search.
#[derive(Clone)]
pub struct SafeEmbedder {
    inner: Arc<dyn Embedder>,
}

impl SafeEmbedder {
    pub fn new(inner: Arc<dyn Embedder>) -> Self {
        Self { inner }
    }

    pub fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    pub async fn embed(&self, text: &str) -> Vec<f32> {
        match self.inner.embed(text).await {
            Ok(vector) => vector,
            Err(err) => {
                warn!(?err, "embedding failed; degrading to zero vector");
                vec![0.0; self.inner.dimension()]
            }
        }
    }
}

/// Deterministic local embedder for tests and offline runs: hashed bag of
/// words folded into the configured dimension.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> AppResult<Vec<f32>> {
        use sha2::{Digest, Sha256};
        let mut vector = vec![0.0f32; self.dimension];
        for word in text.split_whitespace() {
            let digest = Sha256::digest(word.to_lowercase().as_bytes());
            let slot = u32::from_le_bytes(digest[..4].try_into().expect("digest length"))
                as usize
                % self.dimension;
            vector[slot] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        Ok(vector)
    }
}

use crate::llm::openai::OpenAiConfig;
use crate::llm::LlmError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Size of the little-endian dimension prefix in an encoded embedding.
const DIMENSION_PREFIX: usize = 4;

/// Produces one embedding vector per input text.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError>;

    /// Fixed dimensionality of the vectors this model returns.
    fn dimensions(&self) -> usize;
}

#[derive(Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Embeddings over an OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAiEmbedder {
    client: Client,
    config: OpenAiConfig,
    model: String,
    dimensions: usize,
}

impl OpenAiEmbedder {
    pub fn new(config: OpenAiConfig, model: impl Into<String>, dimensions: usize) -> Self {
        Self {
            client: Client::new(),
            config,
            model: model.into(),
            dimensions,
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let body = EmbeddingRequest {
            model: self.model.clone(),
            input: texts.to_vec(),
        };

        let mut req = self
            .client
            .post(format!("{}/embeddings", self.config.base_url))
            .header("Content-Type", "application/json")
            .json(&body);

        if !self.config.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.config.api_key));
        }

        let resp = req.send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status,
                message: text,
            });
        }

        let data: EmbeddingResponse = resp.json().await?;
        debug!(count = data.data.len(), model = %self.model, "embeddings received");
        Ok(data.data.into_iter().map(|d| d.embedding).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("embedding blob too short: {0} bytes")]
    Truncated(usize),
    #[error("embedding blob declares {declared} dimensions but holds {actual}")]
    LengthMismatch { declared: usize, actual: usize },
}

/// Encode an embedding for storage: u32 LE dimension count, then that many f32 LE values.
pub fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(DIMENSION_PREFIX + embedding.len() * 4);
    bytes.extend_from_slice(&(embedding.len() as u32).to_le_bytes());
    bytes.extend(embedding.iter().flat_map(|f| f.to_le_bytes()));
    bytes
}

/// Decode a blob written by [`encode_embedding`].
pub fn decode_embedding(bytes: &[u8]) -> Result<Vec<f32>, CodecError> {
    let Some((prefix, body)) = bytes.split_first_chunk::<DIMENSION_PREFIX>() else {
        return Err(CodecError::Truncated(bytes.len()));
    };
    let declared = u32::from_le_bytes(*prefix) as usize;
    if body.len() % 4 != 0 || body.len() / 4 != declared {
        return Err(CodecError::LengthMismatch {
            declared,
            actual: body.len() / 4,
        });
    }
    Ok(body
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Rank candidate embeddings against a query, best first.
pub fn search_similar<'a>(
    query_embedding: &[f32],
    candidates: impl IntoIterator<Item = (&'a str, &'a [f32])>,
    top_k: usize,
) -> Vec<(&'a str, f32)> {
    let mut scored: Vec<(&str, f32)> = candidates
        .into_iter()
        .map(|(id, emb)| (id, cosine_similarity(query_embedding, emb)))
        .collect();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(top_k);
    scored
}

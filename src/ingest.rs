//! Turns a stored document into embedded chunks.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::IngestConfig;
use crate::db::models::NewChunk;
use crate::db::{Database, DbError};
use crate::doc_processor::{chunk_pages, extract_pages, recover_missing_pages, DocumentError};
use crate::embedding::{encode_embedding, Embedder};
use crate::llm::LlmError;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("document not found: {0}")]
    DocumentNotFound(String),
    #[error("document {0} has no content")]
    ContentMissing(String),
    #[error(transparent)]
    Parse(#[from] DocumentError),
    #[error("document {0} contains no text")]
    EmptyDocument(String),
    #[error("embedding request failed: {0}")]
    Embedding(#[source] LlmError),
    #[error("expected {expected} embeddings, got {actual}")]
    CountMismatch { expected: usize, actual: usize },
    #[error("embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error(transparent)]
    Store(#[from] DbError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub file_id: String,
    pub source: String,
    pub pages: usize,
    pub chunks: usize,
    /// Chunks whose page was found by text match rather than position.
    pub recovered_pages: usize,
}

pub struct IngestionPipeline {
    db: Arc<Database>,
    embedder: Arc<dyn Embedder>,
    chunk_size: usize,
    chunk_overlap: usize,
    batch_size: usize,
}

impl IngestionPipeline {
    pub fn new(db: Arc<Database>, embedder: Arc<dyn Embedder>, config: &IngestConfig) -> Self {
        Self {
            db,
            embedder,
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
            batch_size: config.embedding_batch_size.max(1),
        }
    }

    /// Chunk, embed and store the file's content. All chunks are staged in
    /// memory before the previous set is swapped out in one transaction, so
    /// a failure leaves the stored chunks untouched.
    pub async fn ingest(&self, file_id: &str) -> Result<IngestReport, IngestError> {
        let file = self
            .db
            .get_file(file_id)?
            .ok_or_else(|| IngestError::DocumentNotFound(file_id.to_string()))?;
        let pages = {
            let content = self
                .db
                .get_file_content(file_id)?
                .ok_or_else(|| IngestError::ContentMissing(file_id.to_string()))?;
            extract_pages(&file.media_type, &content)?
        };
        if pages.is_empty() {
            return Err(IngestError::EmptyDocument(file_id.to_string()));
        }

        let mut windows = chunk_pages(&pages, self.chunk_size, self.chunk_overlap);
        let unpaged = windows.iter().filter(|w| w.page.is_none()).count();
        recover_missing_pages(&mut windows, &pages);
        let recovered_pages = unpaged - windows.iter().filter(|w| w.page.is_none()).count();
        debug!(
            file_id,
            pages = pages.len(),
            windows = windows.len(),
            recovered_pages,
            "document chunked"
        );

        let expected = self.embedder.dimensions();
        let mut staged = Vec::with_capacity(windows.len());
        for batch in windows.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|w| w.text.clone()).collect();
            let vectors = self
                .embedder
                .embed(&texts)
                .await
                .map_err(IngestError::Embedding)?;
            if vectors.len() != batch.len() {
                return Err(IngestError::CountMismatch {
                    expected: batch.len(),
                    actual: vectors.len(),
                });
            }
            for (window, vector) in batch.iter().zip(vectors) {
                if vector.len() != expected {
                    return Err(IngestError::DimensionMismatch {
                        expected,
                        actual: vector.len(),
                    });
                }
                staged.push(NewChunk {
                    text: window.text.clone(),
                    page: window.page,
                    embedding: encode_embedding(&vector),
                });
            }
        }

        let stored = self.db.replace_chunks(&file.id, &file.name, &staged)?;
        info!(file_id, source = %file.name, chunks = stored, "document ingested");
        Ok(IngestReport {
            file_id: file.id,
            source: file.name,
            pages: pages.len(),
            chunks: stored,
            recovered_pages,
        })
    }
}

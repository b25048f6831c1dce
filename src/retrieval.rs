//! Retrieval-augmented answers over the embedded document chunks, with an
//! optional per-chunk attribution pass.

use std::fmt::Write;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::db::{Database, DbError};
use crate::embedding::{decode_embedding, search_similar, Embedder};
use crate::llm::{ChatMessage, ChatRequest, LanguageModel, LlmError};

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("query embedding failed: {0}")]
    Embedding(#[source] LlmError),
    #[error("answer completion failed: {0}")]
    Completion(#[source] LlmError),
    #[error(transparent)]
    Store(#[from] DbError),
}

/// A chunk returned by similarity search, as sent back to chat clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievedChunk {
    pub id: String,
    pub text: String,
    pub source: String,
    pub page: Option<u32>,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub source: String,
    pub page: Option<u32>,
}

/// Similarity search over stored chunk embeddings.
#[async_trait]
pub trait VectorSearch: Send + Sync {
    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError>;
}

/// Exhaustive cosine ranking over the `document_chunks` table.
pub struct SqliteVectorSearch {
    db: Arc<Database>,
}

impl SqliteVectorSearch {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl VectorSearch for SqliteVectorSearch {
    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        let chunks = self.db.list_chunks()?;
        let mut decoded = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            match decode_embedding(&chunk.embedding) {
                Ok(vector) => decoded.push((chunk, vector)),
                Err(e) => warn!(
                    chunk_id = %chunk.id,
                    error = %e,
                    "skipping chunk with unreadable embedding"
                ),
            }
        }

        let ranked = search_similar(
            query,
            decoded.iter().map(|(c, v)| (c.id.as_str(), v.as_slice())),
            top_k,
        );
        Ok(ranked
            .into_iter()
            .filter_map(|(id, score)| {
                decoded.iter().find(|(c, _)| c.id == id).map(|(c, _)| RetrievedChunk {
                    id: c.id.clone(),
                    text: c.text.clone(),
                    source: c.source.clone(),
                    page: c.page,
                    score,
                })
            })
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FallbackAnswer {
    pub content: String,
    pub retrieved: Vec<RetrievedChunk>,
    pub citations: Vec<Citation>,
}

pub struct RetrievalFallback {
    llm: Arc<dyn LanguageModel>,
    embedder: Arc<dyn Embedder>,
    search: Arc<dyn VectorSearch>,
    model: String,
    temperature: Option<f32>,
    top_k: usize,
    attribution: bool,
}

impl RetrievalFallback {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        embedder: Arc<dyn Embedder>,
        search: Arc<dyn VectorSearch>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            llm,
            embedder,
            search,
            model: model.into(),
            temperature: None,
            top_k: 5,
            attribution: true,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_attribution(mut self, enabled: bool) -> Self {
        self.attribution = enabled;
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    /// Answer `query` from retrieved passages. `history` is included only
    /// when non-empty; `structured_note` explains a failed structured lookup.
    pub async fn answer(
        &self,
        query: &str,
        history: &[ChatMessage],
        structured_note: Option<&str>,
    ) -> Result<FallbackAnswer, RetrievalError> {
        let query_vector = self
            .embedder
            .embed(&[query.to_string()])
            .await
            .map_err(RetrievalError::Embedding)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                RetrievalError::Embedding(LlmError::Parse("no embedding returned for query".into()))
            })?;

        let retrieved = self.search.search(&query_vector, self.top_k).await?;
        debug!(retrieved = retrieved.len(), "passages retrieved");

        let mut messages = vec![ChatMessage::system(build_instructions(
            &retrieved,
            structured_note,
        ))];
        messages.extend(history.iter().cloned());
        messages.push(ChatMessage::user(query));

        let request = ChatRequest {
            messages,
            model: self.model.clone(),
            temperature: self.temperature,
        };
        let content = self
            .llm
            .chat(&request)
            .await
            .map_err(RetrievalError::Completion)?
            .content;

        let citations = if self.attribution {
            self.attribute(&content, &retrieved).await
        } else {
            Vec::new()
        };

        Ok(FallbackAnswer {
            content,
            retrieved,
            citations,
        })
    }

    /// One strict true/false call per chunk, in order. A failed or ambiguous
    /// verdict leaves the chunk out.
    async fn attribute(&self, answer: &str, chunks: &[RetrievedChunk]) -> Vec<Citation> {
        let mut citations: Vec<Citation> = Vec::new();
        for chunk in chunks {
            let request = ChatRequest {
                messages: vec![
                    ChatMessage::system(
                        "You check whether a passage was used to write an answer. \
                         Reply with exactly one word: true or false.",
                    ),
                    ChatMessage::user(format!(
                        "Answer:\n{answer}\n\nPassage:\n\"\"\"{}\"\"\"\n\nDid this passage contribute to the answer?",
                        chunk.text
                    )),
                ],
                model: self.model.clone(),
                temperature: Some(0.0),
            };
            let verdict = match self.llm.chat(&request).await {
                Ok(resp) => parse_verdict(&resp.content),
                Err(e) => {
                    warn!(chunk_id = %chunk.id, error = %e, "attribution call failed");
                    continue;
                }
            };
            match verdict {
                Some(true) => {
                    let citation = Citation {
                        source: chunk.source.clone(),
                        page: chunk.page,
                    };
                    if !citations.contains(&citation) {
                        citations.push(citation);
                    }
                }
                Some(false) => {}
                None => warn!(chunk_id = %chunk.id, "attribution reply was not true/false"),
            }
        }
        citations
    }
}

fn parse_verdict(reply: &str) -> Option<bool> {
    match reply.trim().trim_end_matches('.').to_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

pub fn build_instructions(chunks: &[RetrievedChunk], structured_note: Option<&str>) -> String {
    let mut out = String::from(
        "You answer questions using the context passages below.\n\
         Always answer in the language of the question.\n\
         If the passages do not contain the answer, say that you do not know.\n",
    );
    if let Some(note) = structured_note {
        let _ = writeln!(out, "Note: {note}");
    }
    out.push_str("\nContext:\n");
    for chunk in chunks {
        let _ = write!(out, "\"\"\"{}\"\"\"\n(source: {}", chunk.text, chunk.source);
        if let Some(page) = chunk.page {
            let _ = write!(out, ", page {page}");
        }
        out.push_str(")\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::NewChunk;
    use crate::embedding::encode_embedding;
    use crate::test_support::{KeywordEmbedder, ScriptedModel};

    const KEYWORDS: &[&str] = &["pump", "seal", "motor"];

    fn seeded() -> (Arc<Database>, Arc<KeywordEmbedder>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let embedder = Arc::new(KeywordEmbedder::new(KEYWORDS));
        let texts = [
            ("Replace the seal every 8000 hours.", Some(3)),
            ("Connect the motor leads to U V W.", Some(2)),
            ("Mount the pump on the base plate.", Some(1)),
        ];
        for (text, page) in texts {
            let chunk = NewChunk {
                text: text.into(),
                page,
                embedding: encode_embedding(&embedder.vector(text)),
            };
            db.insert_chunk(Some("f1"), "manual.pdf", &chunk).unwrap();
        }
        (db, embedder)
    }

    fn fallback(
        db: Arc<Database>,
        embedder: Arc<KeywordEmbedder>,
        model: Arc<ScriptedModel>,
    ) -> RetrievalFallback {
        RetrievalFallback::new(model, embedder, Arc::new(SqliteVectorSearch::new(db)), "gpt-4o")
    }

    #[tokio::test]
    async fn sqlite_search_ranks_by_cosine() {
        let (db, embedder) = seeded();
        db.insert_chunk(
            None,
            "broken.txt",
            &NewChunk {
                text: "corrupt".into(),
                page: None,
                embedding: vec![1, 2],
            },
        )
        .unwrap();

        let search = SqliteVectorSearch::new(db);
        let hits = search.search(&embedder.vector("seal"), 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].text, "Replace the seal every 8000 hours.");
        assert_eq!(hits[0].page, Some(3));
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn answer_with_memory_and_citations() {
        let (db, embedder) = seeded();
        let model = Arc::new(ScriptedModel::with_results([
            Ok("Every 8000 hours.".to_string()),
            Ok("true".to_string()),
            Err("timeout".to_string()),
            Ok("maybe".to_string()),
        ]));
        let history = vec![
            ChatMessage::user("Which pump is this?"),
            ChatMessage {
                role: "assistant".into(),
                content: "Pump P-100.".into(),
            },
        ];

        let answer = fallback(db, embedder, model.clone())
            .with_top_k(3)
            .answer("How often is the seal replaced?", &history, None)
            .await
            .unwrap();

        assert_eq!(answer.content, "Every 8000 hours.");
        assert_eq!(answer.retrieved.len(), 3);
        assert_eq!(
            answer.citations,
            vec![Citation {
                source: "manual.pdf".into(),
                page: Some(3)
            }]
        );

        let requests = model.requests();
        assert_eq!(requests.len(), 4);
        let completion = &requests[0].messages;
        assert_eq!(completion.len(), 4);
        assert!(completion[0].content.contains("language of the question"));
        let cited = "\"\"\"Replace the seal every 8000 hours.\"\"\"\n(source: manual.pdf, page 3)";
        assert!(completion[0].content.contains(cited));
        assert_eq!(completion[1].content, "Which pump is this?");
        assert_eq!(completion[3].content, "How often is the seal replaced?");
    }

    #[tokio::test]
    async fn empty_memory_is_omitted_and_attribution_can_be_disabled() {
        let (db, embedder) = seeded();
        let model = Arc::new(ScriptedModel::new(["I do not know."]));
        let answer = fallback(db, embedder, model.clone())
            .with_attribution(false)
            .answer("motor?", &[], Some("The business data service returned no matching records."))
            .await
            .unwrap();

        assert!(answer.citations.is_empty());
        let requests = model.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].messages.len(), 2);
        assert!(requests[0].messages[0].content.contains("Note: The business data service"));
    }

    #[tokio::test]
    async fn completion_failure_is_an_error() {
        let (db, embedder) = seeded();
        let model = Arc::new(ScriptedModel::failing());
        let err = fallback(db, embedder, model)
            .answer("seal?", &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::Completion(_)));
    }

    #[test]
    fn verdict_parsing_is_strict() {
        assert_eq!(parse_verdict(" True. "), Some(true));
        assert_eq!(parse_verdict("false"), Some(false));
        assert_eq!(parse_verdict("true, mostly"), None);
    }

    #[test]
    fn retrieved_chunk_serializes_camel_case() {
        let chunk = RetrievedChunk {
            id: "c".into(),
            text: "t".into(),
            source: "s".into(),
            page: None,
            score: 0.5,
        };
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(value["score"], 0.5);
        assert!(value.get("page").is_some());
    }
}

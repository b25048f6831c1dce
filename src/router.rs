//! The chat flow: memory, structured lookup, retrieval fallback, memory.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::extractor::{Extraction, IntentExtractor};
use crate::memory::{ChatTurn, EntityMemory, MemoryContext, MemoryError, MemoryManager};
use crate::retrieval::{Citation, RetrievalError, RetrievalFallback, RetrievedChunk};
use crate::schema::SchemaCache;
use crate::structured::{StructuredOutcome, StructuredQueryHandler};

const MISS_NOTE: &str = "The business data service has no records matching this question.";
const UNREACHABLE_NOTE: &str = "The business data service could not be reached for this question.";

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub role: String,
    pub content: String,
    pub message_time: String,
    /// Raw retrieved chunks behind a retrieval answer; empty for structured answers.
    pub additional_contents: Vec<RetrievedChunk>,
    pub citations: Vec<Citation>,
}

/// The OData service consulted before retrieval.
pub struct StructuredSource {
    base_url: String,
    cache: Arc<SchemaCache>,
    extractor: IntentExtractor,
    handler: StructuredQueryHandler,
}

impl StructuredSource {
    pub fn new(
        base_url: impl Into<String>,
        cache: Arc<SchemaCache>,
        extractor: IntentExtractor,
        handler: StructuredQueryHandler,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            cache,
            extractor,
            handler,
        }
    }
}

enum Route {
    Answered(String),
    Fallback(Option<&'static str>),
}

pub struct HybridRouter {
    memory: Arc<MemoryManager>,
    retrieval: Arc<RetrievalFallback>,
    structured: Option<StructuredSource>,
}

impl HybridRouter {
    pub fn new(memory: Arc<MemoryManager>, retrieval: Arc<RetrievalFallback>) -> Self {
        Self {
            memory,
            retrieval,
            structured: None,
        }
    }

    pub fn with_structured(mut self, source: StructuredSource) -> Self {
        self.structured = Some(source);
        self
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub async fn chat(&self, turn: &ChatTurn) -> Result<ChatReply, RouterError> {
        let ctx = self.memory.store_and_recall(turn).await?;

        let (content, retrieved, citations) = match self.try_structured(&turn.query, &ctx).await {
            Route::Answered(answer) => {
                info!(conversation_id = %ctx.conversation.id, "answered from structured source");
                (answer, Vec::new(), Vec::new())
            }
            Route::Fallback(note) => {
                let answer = self.retrieval.answer(&turn.query, &ctx.history, note).await?;
                info!(
                    conversation_id = %ctx.conversation.id,
                    retrieved = answer.retrieved.len(),
                    citations = answer.citations.len(),
                    "answered from documents"
                );
                (answer.content, answer.retrieved, answer.citations)
            }
        };

        let stored = self.memory.store_response(&ctx.conversation.id, &content)?;
        Ok(ChatReply {
            role: stored.role,
            content,
            message_time: stored.created_at,
            additional_contents: retrieved,
            citations,
        })
    }

    async fn try_structured(&self, query: &str, ctx: &MemoryContext) -> Route {
        let Some(source) = &self.structured else {
            return Route::Fallback(None);
        };
        let schema = match source.cache.get(&source.base_url).await {
            Ok(schema) => schema,
            Err(e) => {
                warn!(
                    error = %e,
                    base_url = %source.base_url,
                    "schema unavailable, skipping structured lookup"
                );
                return Route::Fallback(None);
            }
        };

        let mut extraction = source.extractor.extract(query, &schema).await;
        if extraction.is_unknown() {
            debug!("no structured intent");
            return Route::Fallback(None);
        }
        if let Some(remembered) = &ctx.entities {
            merge_remembered(&mut extraction, remembered);
        }

        match source.handler.answer(&source.base_url, &extraction, &schema).await {
            StructuredOutcome::Hit(answer) => {
                self.remember(&ctx.conversation.id, &extraction);
                Route::Answered(answer)
            }
            StructuredOutcome::Miss => Route::Fallback(Some(MISS_NOTE)),
            StructuredOutcome::TransportError(detail) => {
                warn!(detail = %detail, "structured lookup failed");
                Route::Fallback(Some(UNREACHABLE_NOTE))
            }
        }
    }

    fn remember(&self, conversation_id: &str, extraction: &Extraction) {
        let Some(entity_set) = extraction.entity_set.clone() else {
            return;
        };
        let properties: std::collections::BTreeMap<String, String> = extraction
            .concrete()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        if properties.is_empty() {
            return;
        }
        let memory = EntityMemory {
            entity_set,
            properties,
        };
        if let Err(e) = self.memory.remember_entities(conversation_id, &memory) {
            warn!(error = %e, "failed to store entity memory");
        }
    }
}

/// A follow-up naming the same entity set without any concrete value
/// inherits the values of the previous structured answer.
fn merge_remembered(extraction: &mut Extraction, remembered: &EntityMemory) {
    if extraction.entity_set.as_deref() != Some(remembered.entity_set.as_str()) {
        return;
    }
    if extraction.concrete().next().is_some() {
        return;
    }
    for (name, value) in &remembered.properties {
        extraction
            .properties
            .entry(name.clone())
            .or_insert_with(|| Some(value.clone()));
    }
    debug!(entity_set = %remembered.entity_set, "extraction completed from entity memory");
}

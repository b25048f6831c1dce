//! Conversation persistence and the bounded history window used in prompts.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tiktoken_rs::CoreBPE;
use tracing::{debug, info, warn};

use crate::db::models::{Conversation, Message};
use crate::db::{Database, DbError};
use crate::llm::{ChatMessage, ChatRequest, LanguageModel};

const FALLBACK_TITLE_CHARS: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("tokenizer unavailable: {0}")]
    Tokenizer(String),
}

/// An inbound user message.
#[derive(Debug, Clone, Default)]
pub struct ChatTurn {
    pub conversation_id: String,
    pub message_id: Option<String>,
    /// RFC 3339 client timestamp.
    pub message_time: Option<String>,
    pub user_id: Option<String>,
    pub query: String,
}

/// Entity set and concrete values referenced by an earlier structured answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMemory {
    pub entity_set: String,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct MemoryContext {
    pub conversation: Conversation,
    /// The stored user message for this turn.
    pub message: Message,
    /// Prior turns within the token budget, oldest first. Excludes `message`.
    pub history: Vec<ChatMessage>,
    pub entities: Option<EntityMemory>,
    pub is_new: bool,
}

pub struct MemoryManager {
    db: Arc<Database>,
    llm: Arc<dyn LanguageModel>,
    title_model: String,
    token_budget: usize,
    bpe: CoreBPE,
}

impl MemoryManager {
    pub fn new(
        db: Arc<Database>,
        llm: Arc<dyn LanguageModel>,
        title_model: impl Into<String>,
        token_budget: usize,
    ) -> Result<Self, MemoryError> {
        let bpe = tiktoken_rs::cl100k_base().map_err(|e| MemoryError::Tokenizer(e.to_string()))?;
        Ok(Self {
            db,
            llm,
            title_model: title_model.into(),
            token_budget,
            bpe,
        })
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }

    /// Persist the user message, creating the conversation on first write,
    /// and return the history window that precedes it.
    pub async fn store_and_recall(&self, turn: &ChatTurn) -> Result<MemoryContext, MemoryError> {
        let (mut conversation, is_new) = self.db.ensure_conversation(
            &turn.conversation_id,
            &fallback_title(&turn.query),
            turn.user_id.as_deref(),
        )?;
        if is_new {
            debug!(conversation_id = %conversation.id, "conversation created");
        }

        let stored = self.db.get_messages(&conversation.id)?;
        let message = self.db.add_message(
            &conversation.id,
            turn.message_id.as_deref(),
            "user",
            &turn.query,
            turn.message_time.as_deref(),
        )?;
        // A retried turn finds its message already stored; history ends before it.
        let prior: Vec<Message> = stored
            .into_iter()
            .take_while(|m| m.id != message.id)
            .collect();

        if is_new {
            let title = self.generate_title(&turn.query).await;
            self.db.update_conversation_title(&conversation.id, &title)?;
            conversation.title = title;
        }

        let history = self.window(&prior);
        let entities = conversation
            .entity_memory
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok());
        debug!(
            conversation_id = %conversation.id,
            prior = prior.len(),
            window = history.len(),
            "memory recalled"
        );

        Ok(MemoryContext {
            conversation,
            message,
            history,
            entities,
            is_new,
        })
    }

    pub fn store_response(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> Result<Message, MemoryError> {
        Ok(self
            .db
            .add_message(conversation_id, None, "assistant", content, None)?)
    }

    /// Newest to oldest until the next message would exceed the budget.
    pub fn window(&self, messages: &[Message]) -> Vec<ChatMessage> {
        let mut used = 0;
        let mut window: Vec<ChatMessage> = Vec::new();
        for message in messages.iter().rev() {
            let tokens = self.count_tokens(&message.content);
            if used + tokens > self.token_budget {
                break;
            }
            used += tokens;
            window.push(ChatMessage {
                role: message.role.clone(),
                content: message.content.clone(),
            });
        }
        window.reverse();
        window
    }

    async fn generate_title(&self, query: &str) -> String {
        let request = ChatRequest {
            messages: vec![
                ChatMessage::system(
                    "Write a short title of at most six words for a conversation that starts \
                     with the following message. Reply with the title only.",
                ),
                ChatMessage::user(query),
            ],
            model: self.title_model.clone(),
            temperature: Some(0.2),
        };
        match self.llm.chat(&request).await {
            Ok(resp) => {
                let title = resp
                    .content
                    .lines()
                    .map(|l| l.trim().trim_matches(|c| c == '"' || c == '\''))
                    .find(|l| !l.is_empty())
                    .unwrap_or_default()
                    .to_string();
                if title.is_empty() {
                    fallback_title(query)
                } else {
                    title
                }
            }
            Err(e) => {
                warn!(error = %e, "title generation failed");
                fallback_title(query)
            }
        }
    }

    pub fn recall_entities(
        &self,
        conversation_id: &str,
    ) -> Result<Option<EntityMemory>, MemoryError> {
        Ok(self
            .db
            .get_conversation(conversation_id)?
            .and_then(|c| c.entity_memory)
            .and_then(|raw| serde_json::from_str(&raw).ok()))
    }

    pub fn remember_entities(
        &self,
        conversation_id: &str,
        memory: &EntityMemory,
    ) -> Result<(), MemoryError> {
        let raw = serde_json::to_string(memory).ok();
        self.db.set_entity_memory(conversation_id, raw.as_deref())?;
        Ok(())
    }

    pub fn list_conversations(&self) -> Result<Vec<Conversation>, MemoryError> {
        Ok(self.db.list_conversations()?)
    }

    pub fn messages(&self, conversation_id: &str) -> Result<Vec<Message>, MemoryError> {
        Ok(self.db.get_messages(conversation_id)?)
    }

    pub fn delete_conversation(&self, conversation_id: &str) -> Result<(), MemoryError> {
        self.db.delete_conversation(conversation_id)?;
        Ok(())
    }

    pub fn delete_all(&self) -> Result<usize, MemoryError> {
        let deleted = self.db.delete_all_conversations()?;
        info!(deleted, "all conversations deleted");
        Ok(deleted)
    }
}

fn fallback_title(query: &str) -> String {
    query.trim().chars().take(FALLBACK_TITLE_CHARS).collect()
}

use serde::Deserialize;
use tracing::info;

use crate::db::models::{Conversation, Message};
use crate::memory::ChatTurn;
use crate::router::ChatReply;
use crate::schema::SchemaMap;
use crate::{AppState, Error, Result};

/// Inbound chat payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatQuery {
    pub conversation_id: String,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub message_time: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    pub user_query: String,
}

pub async fn get_chat_rag_response(state: &AppState, query: ChatQuery) -> Result<ChatReply> {
    if query.conversation_id.trim().is_empty() {
        return Err(Error::InvalidInput("conversationId is required".into()));
    }
    if query.user_query.trim().is_empty() {
        return Err(Error::InvalidInput("userQuery is empty".into()));
    }
    let turn = ChatTurn {
        conversation_id: query.conversation_id,
        message_id: query.message_id,
        message_time: query.message_time,
        user_id: query.user_id,
        query: query.user_query,
    };
    Ok(state.router.chat(&turn).await?)
}

/// Remove every conversation and message.
pub fn delete_chat_data(state: &AppState) -> Result<String> {
    state.router.memory().delete_all()?;
    Ok("Success!".to_string())
}

pub fn list_conversations(state: &AppState) -> Result<Vec<Conversation>> {
    Ok(state.router.memory().list_conversations()?)
}

pub fn get_messages(state: &AppState, conversation_id: &str) -> Result<Vec<Message>> {
    Ok(state.router.memory().messages(conversation_id)?)
}

pub fn delete_conversation(state: &AppState, id: &str) -> Result<()> {
    state.router.memory().delete_conversation(id)?;
    info!(conversation_id = id, "conversation deleted");
    Ok(())
}

pub fn rename_conversation(state: &AppState, id: &str, title: &str) -> Result<()> {
    state.db.update_conversation_title(id, title)?;
    Ok(())
}

/// Structure of the configured OData service. `refresh` drops the cached
/// copy first.
pub async fn describe_schema(state: &AppState, refresh: bool) -> Result<SchemaMap> {
    let base_url = state.config.odata.base_url.as_deref();
    let (Some(cache), Some(base_url)) = (&state.schema_cache, base_url) else {
        return Err(Error::InvalidInput("no OData service configured".into()));
    };
    if refresh {
        cache.invalidate(base_url);
    }
    let schema = cache.get(base_url).await?;
    Ok(SchemaMap::clone(&schema))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::db::Database;
    use crate::schema::tests::equipment_schema;
    use crate::schema::{SchemaError, SchemaProvider};
    use crate::test_support::{KeywordEmbedder, ScriptedModel};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingSchema(AtomicUsize);

    #[async_trait]
    impl SchemaProvider for CountingSchema {
        async fn fetch(&self, _base_url: &str) -> std::result::Result<SchemaMap, SchemaError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(equipment_schema())
        }
    }

    fn state(model: ScriptedModel) -> AppState {
        let mut config = AppConfig::default();
        config.retrieval.attribution = false;
        AppState::from_parts(
            config,
            Arc::new(Database::open_in_memory().unwrap()),
            Arc::new(model),
            Arc::new(KeywordEmbedder::new(&["seal"])),
            None,
        )
        .unwrap()
    }

    #[test]
    fn chat_query_uses_camel_case() {
        let query: ChatQuery = serde_json::from_value(serde_json::json!({
            "conversationId": "c1",
            "messageId": "m1",
            "messageTime": "2026-01-01T10:00:00.000Z",
            "userId": "u1",
            "userQuery": "hello"
        }))
        .unwrap();
        assert_eq!(query.conversation_id, "c1");
        assert_eq!(query.user_query, "hello");
    }

    #[tokio::test]
    async fn chat_round_trip_then_bulk_delete() {
        let state = state(ScriptedModel::new(["Greeting", "Hello!"]));
        let reply = get_chat_rag_response(
            &state,
            ChatQuery {
                conversation_id: "c1".into(),
                message_id: Some("m1".into()),
                message_time: None,
                user_id: Some("u1".into()),
                user_query: "hi".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(reply.role, "assistant");
        assert_eq!(reply.content, "Hello!");

        let json = serde_json::to_value(&reply).unwrap();
        assert!(json.get("messageTime").is_some());
        assert!(json.get("additionalContents").is_some());

        assert_eq!(list_conversations(&state).unwrap().len(), 1);
        assert_eq!(get_messages(&state, "c1").unwrap().len(), 2);
        assert_eq!(delete_chat_data(&state).unwrap(), "Success!");
        assert!(list_conversations(&state).unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_query_is_rejected() {
        let state = state(ScriptedModel::failing());
        let err = get_chat_rag_response(
            &state,
            ChatQuery {
                conversation_id: "c1".into(),
                message_id: None,
                message_time: None,
                user_id: None,
                user_query: "  ".into(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn schema_refresh_refetches_metadata() {
        let mut config = AppConfig::default();
        config.odata.base_url = Some("https://erp.example.com/odata".into());
        let provider = Arc::new(CountingSchema::default());
        let state = AppState::from_parts(
            config,
            Arc::new(Database::open_in_memory().unwrap()),
            Arc::new(ScriptedModel::failing()),
            Arc::new(KeywordEmbedder::new(&["seal"])),
            Some(provider.clone()),
        )
        .unwrap();

        let schema = describe_schema(&state, false).await.unwrap();
        assert!(schema.get("Equipment").is_some());
        describe_schema(&state, false).await.unwrap();
        assert_eq!(provider.0.load(Ordering::SeqCst), 1);

        describe_schema(&state, true).await.unwrap();
        assert_eq!(provider.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn schema_needs_a_configured_service() {
        let state = state(ScriptedModel::failing());
        let err = describe_schema(&state, true).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}

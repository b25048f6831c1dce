use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub user_id: Option<String>,
    /// JSON scratch slot for entities referenced in earlier turns.
    pub entity_memory: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub created_at: String,
}

/// Document metadata without the binary content.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct File {
    pub id: String,
    pub name: String,
    pub media_type: String,
    pub size: Option<i64>,
    pub has_content: bool,
    pub created_at: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DocumentChunk {
    pub id: String,
    pub file_id: Option<String>,
    pub text: String,
    pub source: String,
    pub page: Option<u32>,
    #[serde(skip)]
    pub embedding: Vec<u8>,
    pub created_at: String,
}

/// A chunk prepared by ingestion, not yet written.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub text: String,
    pub page: Option<u32>,
    pub embedding: Vec<u8>,
}

/// Selects files for bulk deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileFilter {
    All,
    Ids(Vec<String>),
    Name(String),
    MediaType(String),
}

//! Scripted capability doubles for unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::embedding::Embedder;
use crate::llm::{ChatRequest, ChatResponse, LanguageModel, LlmError};

/// Replays canned replies in order and records every request.
pub(crate) struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, String>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedModel {
    pub(crate) fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_results(replies.into_iter().map(|r| Ok(r.into())))
    }

    /// `Err` entries surface as API errors.
    pub(crate) fn with_results(replies: impl IntoIterator<Item = Result<String, String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing() -> Self {
        Self::with_results([])
    }

    pub(crate) fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(Ok(content)) => Ok(ChatResponse {
                role: "assistant".into(),
                content,
                model: request.model.clone(),
            }),
            Some(Err(message)) => Err(LlmError::Api { status: 500, message }),
            None => Err(LlmError::Api {
                status: 503,
                message: "script exhausted".into(),
            }),
        }
    }
}

/// One dimension per keyword: 1.0 when the text mentions it, else a small
/// constant so no vector is all zeros.
pub(crate) struct KeywordEmbedder {
    keywords: Vec<String>,
    batches: Mutex<Vec<usize>>,
    pub(crate) fail: bool,
    pub(crate) extra_dimension: bool,
}

impl KeywordEmbedder {
    pub(crate) fn new(keywords: &[&str]) -> Self {
        Self {
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
            batches: Mutex::new(Vec::new()),
            fail: false,
            extra_dimension: false,
        }
    }

    pub(crate) fn vector(&self, text: &str) -> Vec<f32> {
        let text = text.to_lowercase();
        let mut v: Vec<f32> = self
            .keywords
            .iter()
            .map(|k| if text.contains(k.as_str()) { 1.0 } else { 0.01 })
            .collect();
        if self.extra_dimension {
            v.push(0.0);
        }
        v
    }

    /// Sizes of the batches requested so far.
    pub(crate) fn batches(&self) -> Vec<usize> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        self.batches.lock().unwrap().push(texts.len());
        if self.fail {
            return Err(LlmError::Api {
                status: 500,
                message: "embedding backend down".into(),
            });
        }
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.keywords.len()
    }
}

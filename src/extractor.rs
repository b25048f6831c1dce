//! Schema-driven intent and entity extraction with a single model call.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::llm::{ChatMessage, ChatRequest, LanguageModel};
use crate::schema::{EntitySetSchema, SchemaMap};

pub const UNKNOWN_INTENT: &str = "Unknown";

/// A validated classification of a question against a [`SchemaMap`].
///
/// `properties` maps property names to a concrete value taken from the
/// question, or `None` when the question asks for that property's value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extraction {
    pub entity_set: Option<String>,
    pub intent: String,
    pub properties: BTreeMap<String, Option<String>>,
}

impl Extraction {
    pub fn unknown() -> Self {
        Self {
            entity_set: None,
            intent: UNKNOWN_INTENT.to_string(),
            properties: BTreeMap::new(),
        }
    }

    /// True when there is nothing to look up structurally.
    pub fn is_unknown(&self) -> bool {
        self.entity_set.is_none() || self.intent.eq_ignore_ascii_case(UNKNOWN_INTENT)
    }

    pub fn concrete(&self) -> impl Iterator<Item = (&str, &str)> {
        self.properties
            .iter()
            .filter_map(|(k, v)| v.as_deref().map(|v| (k.as_str(), v)))
    }

    pub fn requested(&self) -> impl Iterator<Item = &str> {
        self.properties
            .iter()
            .filter(|(_, v)| v.is_none())
            .map(|(k, _)| k.as_str())
    }
}

#[derive(Deserialize)]
struct RawExtraction {
    #[serde(rename = "entitySet", default)]
    entity_set: Option<String>,
    #[serde(default)]
    intent: Option<String>,
    #[serde(default)]
    properties: Option<serde_json::Map<String, Value>>,
}

pub struct IntentExtractor {
    llm: Arc<dyn LanguageModel>,
    model: String,
}

impl IntentExtractor {
    pub fn new(llm: Arc<dyn LanguageModel>, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
        }
    }

    /// Classify `query`. Never fails: transport errors and unusable model
    /// output both come back as [`Extraction::unknown`].
    pub async fn extract(&self, query: &str, schema: &SchemaMap) -> Extraction {
        let request = ChatRequest {
            messages: build_prompt(query, schema),
            model: self.model.clone(),
            temperature: Some(0.0),
        };
        match self.llm.chat(&request).await {
            Ok(resp) => {
                let extraction = parse_extraction(&resp.content, schema);
                debug!(
                    entity_set = ?extraction.entity_set,
                    intent = %extraction.intent,
                    properties = extraction.properties.len(),
                    "query classified"
                );
                extraction
            }
            Err(e) => {
                warn!(error = %e, "extraction call failed");
                Extraction::unknown()
            }
        }
    }
}

fn describe_entity_set(out: &mut String, name: &str, set: &EntitySetSchema) {
    let _ = writeln!(out, "- {name} (key: {})", set.keys.join(", "));
    for (prop, schema) in &set.properties {
        let _ = write!(out, "    {prop}: {}", schema.hint());
        if let Some(len) = schema.max_length {
            let _ = write!(out, ", max {len} chars");
        }
        if let Some(label) = &schema.label {
            let _ = write!(out, " ({label})");
        }
        out.push('\n');
    }
}

pub fn build_prompt(query: &str, schema: &SchemaMap) -> Vec<ChatMessage> {
    let mut system = String::from(
        "You classify questions against the entity sets of a business data service.\n\
         Respond with exactly one JSON object and nothing else:\n\
         {\"entitySet\": <entity set name or null>, \"intent\": <short intent>, \"properties\": {<property>: <value or null>}}\n\
         Rules:\n\
         - Use only entity set and property names listed below.\n\
         - Put values stated in the question as property values.\n\
         - Set a property to null when the question asks for its value.\n\
         - If the question is not about these entity sets, answer {\"entitySet\": null, \"intent\": \"Unknown\", \"properties\": {}}.\n\
         Example: \"What is the manufacturer of equipment 1000123?\" -> \
         {\"entitySet\": \"Equipment\", \"intent\": \"Lookup\", \"properties\": {\"Equipment\": \"1000123\", \"AssetManufacturerName\": null}}\n\n\
         Entity sets:\n",
    );
    for (name, set) in &schema.entity_sets {
        describe_entity_set(&mut system, name, set);
    }
    vec![ChatMessage::system(system), ChatMessage::user(query)]
}

/// Decode and validate model output. Anything that is not a JSON object
/// yields [`Extraction::unknown`].
pub fn parse_extraction(raw: &str, schema: &SchemaMap) -> Extraction {
    let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) else {
        debug!("extraction output has no JSON object");
        return Extraction::unknown();
    };
    if end < start {
        return Extraction::unknown();
    }
    let parsed: RawExtraction = match serde_json::from_str(&raw[start..=end]) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(error = %e, "extraction output is not valid JSON");
            return Extraction::unknown();
        }
    };

    let entity_set = parsed
        .entity_set
        .as_deref()
        .and_then(|candidate| match_entity_set(candidate, schema));
    let set_schema = entity_set.as_deref().and_then(|name| schema.get(name));

    let mut properties = BTreeMap::new();
    if let (Some(set_schema), Some(raw_props)) = (set_schema, parsed.properties) {
        for (key, value) in raw_props {
            let Some(name) = match_property(&key, set_schema) else {
                continue;
            };
            match value {
                Value::Null => {
                    properties.insert(name.to_string(), None);
                }
                other => {
                    if let Some(v) = scalar_to_string(&other) {
                        properties.insert(name.to_string(), Some(v));
                    }
                }
            }
        }
    }

    let intent = parsed
        .intent
        .map(|i| i.trim().to_string())
        .filter(|i| !i.is_empty())
        .unwrap_or_else(|| UNKNOWN_INTENT.to_string());

    Extraction {
        entity_set,
        intent,
        properties,
    }
}

/// Exact, then case-insensitive, then bidirectional substring match.
fn match_entity_set(candidate: &str, schema: &SchemaMap) -> Option<String> {
    let candidate = candidate.trim();
    if candidate.is_empty() {
        return None;
    }
    if schema.get(candidate).is_some() {
        return Some(candidate.to_string());
    }
    let lower = candidate.to_lowercase();
    schema
        .names()
        .find(|name| name.to_lowercase() == lower)
        .or_else(|| {
            schema.names().find(|name| {
                let name = name.to_lowercase();
                name.contains(&lower) || lower.contains(&name)
            })
        })
        .map(str::to_string)
}

fn match_property<'a>(key: &str, set: &'a EntitySetSchema) -> Option<&'a str> {
    if let Some((name, _)) = set.properties.get_key_value(key) {
        return Some(name);
    }
    set.properties
        .keys()
        .find(|name| name.eq_ignore_ascii_case(key))
        .map(String::as_str)
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

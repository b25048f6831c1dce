//! Filtered reads against the structured source and answer rendering.

use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::extractor::Extraction;
use crate::schema::{authorize, Credentials, EntitySetSchema, SchemaMap};

const MAX_FIELDS: usize = 5;
const MAX_PREVIEW: usize = 5;

/// Substring predicate syntax of the target service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterDialect {
    /// `contains(Prop,'v')`
    #[default]
    V4,
    /// `substringof('v',Prop)`
    V2,
}

/// Result of a structured lookup. Routing is decided on the variant.
#[derive(Debug, Clone, PartialEq)]
pub enum StructuredOutcome {
    Hit(String),
    Miss,
    TransportError(String),
}

pub struct StructuredQueryHandler {
    client: Client,
    credentials: Option<Credentials>,
    dialect: FilterDialect,
    page_size: usize,
}

impl StructuredQueryHandler {
    pub fn new(
        client: Client,
        credentials: Option<Credentials>,
        dialect: FilterDialect,
        page_size: usize,
    ) -> Self {
        Self {
            client,
            credentials,
            dialect,
            page_size,
        }
    }

    pub async fn answer(
        &self,
        base_url: &str,
        extraction: &Extraction,
        schema: &SchemaMap,
    ) -> StructuredOutcome {
        let Some((set_name, set)) = extraction
            .entity_set
            .as_deref()
            .and_then(|name| schema.get(name).map(|set| (name, set)))
        else {
            return StructuredOutcome::Miss;
        };

        let key_value = match set.keys.as_slice() {
            [key] => extraction.properties.get(key).and_then(|v| v.as_deref()),
            _ => None,
        };
        let segment = match key_value {
            Some(value) => {
                let textual = set
                    .properties
                    .get(&set.keys[0])
                    .map_or(true, |p| p.is_textual());
                format!("{set_name}({})", literal(value, textual))
            }
            None => set_name.to_string(),
        };
        let url = match resource_url(base_url, &segment) {
            Ok(url) => url,
            Err(detail) => {
                warn!(base_url, detail = %detail, "invalid structured source URL");
                return StructuredOutcome::TransportError(detail);
            }
        };
        let req = match key_value {
            Some(_) => {
                debug!(url = %url, "structured key read");
                self.client.get(url)
            }
            None => {
                let filter = build_filter(extraction, set, self.dialect);
                debug!(entity_set = set_name, filter = %filter, "structured filtered read");
                let mut query = vec![("$top", self.page_size.to_string())];
                if !filter.is_empty() {
                    query.push(("$filter", filter));
                }
                self.client.get(url).query(&query)
            }
        };
        let req = authorize(req, self.credentials.as_ref()).header("Accept", "application/json");

        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(error = %e, "structured read failed");
                return StructuredOutcome::TransportError(e.to_string());
            }
        };
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return StructuredOutcome::Miss;
        }
        if !status.is_success() {
            warn!(status = status.as_u16(), "structured read rejected");
            return StructuredOutcome::TransportError(format!("status {}", status.as_u16()));
        }
        let body: Value = match resp.json().await {
            Ok(body) => body,
            Err(e) => return StructuredOutcome::TransportError(e.to_string()),
        };

        let records = unwrap_envelope(body);
        if records.is_empty() {
            debug!(entity_set = set_name, "structured read returned no records");
            return StructuredOutcome::Miss;
        }
        StructuredOutcome::Hit(render_answer(set_name, set, extraction, &records))
    }
}

/// Append one percent-encoded path segment to the service root.
fn resource_url(base_url: &str, segment: &str) -> Result<Url, String> {
    let mut url = Url::parse(base_url).map_err(|e| e.to_string())?;
    url.path_segments_mut()
        .map_err(|_| format!("{base_url} cannot carry a resource path"))?
        .pop_if_empty()
        .push(segment);
    Ok(url)
}

fn escape(value: &str) -> String {
    value.replace('\'', "''")
}

fn literal(value: &str, textual: bool) -> String {
    if textual {
        format!("'{}'", escape(value))
    } else {
        value.to_string()
    }
}

fn non_text_literal(value: &str) -> String {
    let is_bare = value.parse::<f64>().is_ok() || value == "true" || value == "false";
    if is_bare {
        value.to_string()
    } else {
        format!("'{}'", escape(value))
    }
}

/// Conjunction of predicates over the extraction's concrete properties.
pub fn build_filter(
    extraction: &Extraction,
    set: &EntitySetSchema,
    dialect: FilterDialect,
) -> String {
    extraction
        .concrete()
        .filter_map(|(name, value)| set.properties.get(name).map(|p| (name, value, p)))
        .map(|(name, value, prop)| {
            if prop.is_textual() {
                match dialect {
                    FilterDialect::V4 => format!("contains({name},'{}')", escape(value)),
                    FilterDialect::V2 => format!("substringof('{}',{name})", escape(value)),
                }
            } else {
                format!("{name} eq {}", non_text_literal(value))
            }
        })
        .collect::<Vec<_>>()
        .join(" and ")
}

/// Records from any of the response shapes the service family uses.
pub fn unwrap_envelope(body: Value) -> Vec<Map<String, Value>> {
    let Value::Object(mut obj) = body else {
        return Vec::new();
    };
    if let Some(d) = obj.remove("d") {
        return match d {
            Value::Object(mut d) => match d.remove("results") {
                Some(Value::Array(results)) => objects(results),
                Some(other) => {
                    d.insert("results".into(), other);
                    vec![d]
                }
                None => vec![d],
            },
            Value::Array(results) => objects(results),
            _ => Vec::new(),
        };
    }
    if let Some(Value::Array(values)) = obj.get("value") {
        return objects(values.clone());
    }
    vec![obj]
}

fn objects(values: Vec<Value>) -> Vec<Map<String, Value>> {
    values
        .into_iter()
        .filter_map(|v| match v {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .collect()
}

fn display(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn is_metadata(field: &str) -> bool {
    field.starts_with("__") || field.starts_with('@') || field.contains("@odata")
}

fn key_text(set: &EntitySetSchema, record: &Map<String, Value>) -> Option<String> {
    let parts: Vec<String> = set
        .keys
        .iter()
        .filter_map(|k| record.get(k).and_then(display))
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

fn name_text(set: &EntitySetSchema, record: &Map<String, Value>) -> Option<String> {
    set.properties
        .iter()
        .filter(|(name, prop)| prop.is_textual() && !set.keys.contains(*name))
        .filter(|(name, _)| name.contains("Name") || name.contains("Description"))
        .find_map(|(name, _)| record.get(name).and_then(display))
}

pub fn render_answer(
    set_name: &str,
    set: &EntitySetSchema,
    extraction: &Extraction,
    records: &[Map<String, Value>],
) -> String {
    let first = &records[0];

    for requested in extraction.requested() {
        if let Some(value) = first.get(requested).and_then(display) {
            let label = set.label(requested);
            return match key_text(set, first) {
                Some(key) => format!("The {label} of {set_name} {key} is {value}."),
                None => format!("The {label} is {value}."),
            };
        }
    }

    if records.len() == 1 {
        let keys = set.keys.iter().map(String::as_str);
        let others = first
            .keys()
            .map(String::as_str)
            .filter(|f| !is_metadata(f) && !set.keys.iter().any(|k| k == f));
        return keys
            .chain(others)
            .filter_map(|field| first.get(field).and_then(display).map(|v| (field, v)))
            .take(MAX_FIELDS)
            .map(|(field, value)| format!("{}: {value}", set.label(field)))
            .collect::<Vec<_>>()
            .join("\n");
    }

    let mut lines = vec![format!("Found {} {set_name} records:", records.len())];
    for record in records.iter().take(MAX_PREVIEW) {
        let line = match (name_text(set, record), key_text(set, record)) {
            (Some(name), Some(key)) => format!("- {name} ({key})"),
            (Some(name), None) => format!("- {name}"),
            (None, Some(key)) => format!("- {key}"),
            (None, None) => continue,
        };
        lines.push(line);
    }
    lines.join("\n")
}

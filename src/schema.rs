//! Runtime discovery of an OData service's entity sets and properties.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use reqwest::{Client, RequestBuilder};
use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("metadata request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("metadata request returned status {0}")]
    Status(u16),
    #[error("malformed metadata document: {0}")]
    Malformed(String),
    #[error("metadata document declares no entity sets")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertySchema {
    /// EDM type name, e.g. `Edm.String`.
    pub edm_type: String,
    pub max_length: Option<u32>,
    pub label: Option<String>,
}

impl PropertySchema {
    pub fn is_textual(&self) -> bool {
        self.edm_type == "Edm.String"
    }

    /// Short type hint for prompts.
    pub fn hint(&self) -> &'static str {
        match self.edm_type.as_str() {
            "Edm.String" | "Edm.Guid" => "text",
            "Edm.Boolean" => "true/false",
            "Edm.DateTime" | "Edm.DateTimeOffset" | "Edm.Date" | "Edm.TimeOfDay" | "Edm.Time" => {
                "date"
            }
            _ => "number",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntitySetSchema {
    pub keys: Vec<String>,
    pub properties: BTreeMap<String, PropertySchema>,
}

impl EntitySetSchema {
    /// Human label for a property, falling back to its name.
    pub fn label<'a>(&'a self, property: &'a str) -> &'a str {
        self.properties
            .get(property)
            .and_then(|p| p.label.as_deref())
            .unwrap_or(property)
    }
}

/// Entity set name to its structure, for one service.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchemaMap {
    pub entity_sets: BTreeMap<String, EntitySetSchema>,
}

impl SchemaMap {
    pub fn get(&self, entity_set: &str) -> Option<&EntitySetSchema> {
        self.entity_sets.get(entity_set)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entity_sets.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entity_sets.is_empty()
    }
}

/// Source of a service's structural description.
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    async fn fetch(&self, base_url: &str) -> Result<SchemaMap, SchemaError>;
}

/// HTTP basic credentials for the structured source.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

pub(crate) fn authorize(req: RequestBuilder, credentials: Option<&Credentials>) -> RequestBuilder {
    match credentials {
        Some(c) => req.basic_auth(&c.username, c.password.as_ref()),
        None => req,
    }
}

/// Reads `{base}/$metadata` and parses the EDMX document.
pub struct ODataMetadataProvider {
    client: Client,
    credentials: Option<Credentials>,
}

impl ODataMetadataProvider {
    pub fn new(client: Client, credentials: Option<Credentials>) -> Self {
        Self {
            client,
            credentials,
        }
    }
}

#[async_trait]
impl SchemaProvider for ODataMetadataProvider {
    async fn fetch(&self, base_url: &str) -> Result<SchemaMap, SchemaError> {
        let url = format!("{}/$metadata", base_url.trim_end_matches('/'));
        debug!(url = %url, "fetching service metadata");

        let req = authorize(self.client.get(&url), self.credentials.as_ref())
            .header("Accept", "application/xml");
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(SchemaError::Status(resp.status().as_u16()));
        }
        let body = resp.text().await?;
        let schema = parse_metadata(&body)?;
        info!(url = %url, entity_sets = schema.entity_sets.len(), "service metadata loaded");
        Ok(schema)
    }
}

#[derive(Default)]
struct EntityTypeDef {
    keys: Vec<String>,
    properties: BTreeMap<String, PropertySchema>,
}

fn attr(element: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|a| a.key.as_ref() == name)
        .map(|a| match a.unescape_value() {
            Ok(v) => v.into_owned(),
            Err(_) => String::from_utf8_lossy(&a.value).into_owned(),
        })
}

/// Parse an EDMX `$metadata` document (OData v2 or v4) into a [`SchemaMap`].
pub fn parse_metadata(xml: &str) -> Result<SchemaMap, SchemaError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut namespace = String::new();
    let mut types: HashMap<String, EntityTypeDef> = HashMap::new();
    let mut sets: Vec<(String, String)> = Vec::new();
    let mut current: Option<(String, EntityTypeDef)> = None;
    let mut in_key = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| SchemaError::Malformed(e.to_string()))?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_start = matches!(event, Event::Start(_));
                match e.local_name().as_ref() {
                    b"Schema" => namespace = attr(e, b"Namespace").unwrap_or_default(),
                    b"EntityType" if is_start => {
                        let name = attr(e, b"Name").ok_or_else(|| {
                            SchemaError::Malformed("EntityType without Name".into())
                        })?;
                        current = Some((format!("{namespace}.{name}"), EntityTypeDef::default()));
                    }
                    b"Key" if is_start => in_key = true,
                    b"PropertyRef" if in_key => {
                        if let (Some((_, def)), Some(name)) = (current.as_mut(), attr(e, b"Name")) {
                            def.keys.push(name);
                        }
                    }
                    b"Property" => {
                        if let (Some((_, def)), Some(name)) = (current.as_mut(), attr(e, b"Name")) {
                            let property = PropertySchema {
                                edm_type: attr(e, b"Type").unwrap_or_else(|| "Edm.String".into()),
                                max_length: attr(e, b"MaxLength").and_then(|v| v.parse().ok()),
                                label: attr(e, b"sap:label"),
                            };
                            def.properties.insert(name, property);
                        }
                    }
                    b"EntitySet" => {
                        if let (Some(name), Some(entity_type)) =
                            (attr(e, b"Name"), attr(e, b"EntityType"))
                        {
                            sets.push((name, entity_type));
                        }
                    }
                    _ => {}
                }
            }
            Event::End(ref e) => match e.local_name().as_ref() {
                b"Key" => in_key = false,
                b"EntityType" => {
                    if let Some((name, def)) = current.take() {
                        types.insert(name, def);
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    let mut entity_sets = BTreeMap::new();
    for (set_name, type_name) in sets {
        // v4 services may reference types through an alias; fall back to the bare name.
        let def = types.get(&type_name).or_else(|| {
            let bare = type_name.rsplit('.').next().unwrap_or(&type_name);
            types
                .iter()
                .find(|(qualified, _)| qualified.rsplit('.').next() == Some(bare))
                .map(|(_, def)| def)
        });
        if let Some(def) = def {
            entity_sets.insert(
                set_name,
                EntitySetSchema {
                    keys: def.keys.clone(),
                    properties: def.properties.clone(),
                },
            );
        }
    }

    if entity_sets.is_empty() {
        return Err(SchemaError::Empty);
    }
    Ok(SchemaMap { entity_sets })
}

struct CachedSchema {
    schema: Arc<SchemaMap>,
    fetched_at: Instant,
}

/// Per-URL schema memo with optional expiry and explicit invalidation.
pub struct SchemaCache {
    provider: Arc<dyn SchemaProvider>,
    entries: DashMap<String, CachedSchema>,
    ttl: Option<Duration>,
}

impl SchemaCache {
    pub fn new(provider: Arc<dyn SchemaProvider>, ttl: Option<Duration>) -> Self {
        Self {
            provider,
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Cached schema for `base_url`, fetching on first use or after expiry.
    /// Concurrent first fetches may both hit the provider; the last insert wins.
    pub async fn get(&self, base_url: &str) -> Result<Arc<SchemaMap>, SchemaError> {
        if let Some(entry) = self.entries.get(base_url) {
            let fresh = self
                .ttl
                .map_or(true, |ttl| entry.fetched_at.elapsed() < ttl);
            if fresh {
                return Ok(Arc::clone(&entry.schema));
            }
        }

        let schema = Arc::new(self.provider.fetch(base_url).await?);
        self.entries.insert(
            base_url.to_string(),
            CachedSchema {
                schema: Arc::clone(&schema),
                fetched_at: Instant::now(),
            },
        );
        Ok(schema)
    }

    pub fn invalidate(&self, base_url: &str) {
        if self.entries.remove(base_url).is_some() {
            debug!(base_url, "schema cache entry invalidated");
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

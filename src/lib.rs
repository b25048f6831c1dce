pub mod commands;
pub mod config;
pub mod consistency;
pub mod db;
pub mod doc_processor;
pub mod embedding;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod llm;
pub mod memory;
pub mod retrieval;
pub mod router;
pub mod schema;
pub mod structured;

#[cfg(test)]
pub(crate) mod test_support;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{AppConfig, ODataConfig};
use consistency::ConsistencyManager;
use db::Database;
use embedding::{Embedder, OpenAiEmbedder};
use extractor::IntentExtractor;
use ingest::IngestionPipeline;
use llm::openai::OpenAiConfig;
use llm::{LanguageModel, Provider};
use memory::MemoryManager;
use retrieval::{RetrievalFallback, SqliteVectorSearch};
use router::{HybridRouter, StructuredSource};
use schema::{Credentials, ODataMetadataProvider, SchemaCache, SchemaProvider};
use structured::StructuredQueryHandler;

pub use error::{Error, Result};

/// Everything the commands need, wired from configuration.
pub struct AppState {
    pub config: AppConfig,
    pub db: Arc<Database>,
    pub router: HybridRouter,
    pub ingestion: IngestionPipeline,
    pub consistency: Arc<ConsistencyManager>,
    pub schema_cache: Option<Arc<SchemaCache>>,
}

impl AppState {
    /// Open the database and build the HTTP adapters named in `config`.
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let db = Arc::new(Database::new(Path::new(&config.database.path))?);
        let llm: Arc<dyn LanguageModel> = Arc::new(Provider::from_kind(
            &config.llm.provider,
            config.llm.api_key.clone(),
            config.llm.base_url.clone(),
        )?);
        let embedder: Arc<dyn Embedder> = Arc::new(OpenAiEmbedder::new(
            OpenAiConfig {
                api_key: config
                    .embedding
                    .api_key
                    .clone()
                    .unwrap_or_else(|| config.llm.api_key.clone()),
                base_url: config
                    .embedding
                    .base_url
                    .clone()
                    .unwrap_or_else(|| config.llm.base_url.clone()),
            },
            config.embedding.model.clone(),
            config.embedding.dimensions,
        ));
        let schema_provider: Option<Arc<dyn SchemaProvider>> = match config.odata.base_url {
            Some(_) => Some(Arc::new(ODataMetadataProvider::new(
                odata_client(&config.odata)?,
                credentials(&config.odata),
            ))),
            None => None,
        };
        Self::from_parts(config, db, llm, embedder, schema_provider)
    }

    /// Assemble the state around already-built capabilities.
    pub fn from_parts(
        config: AppConfig,
        db: Arc<Database>,
        llm: Arc<dyn LanguageModel>,
        embedder: Arc<dyn Embedder>,
        schema_provider: Option<Arc<dyn SchemaProvider>>,
    ) -> Result<Self> {
        let chat_model = config.llm.chat_model.clone();
        let title_model = config
            .memory
            .title_model
            .clone()
            .unwrap_or_else(|| chat_model.clone());

        let memory = Arc::new(MemoryManager::new(
            db.clone(),
            llm.clone(),
            title_model,
            config.memory.token_budget,
        )?);
        let retrieval = Arc::new(
            RetrievalFallback::new(
                llm.clone(),
                embedder.clone(),
                Arc::new(SqliteVectorSearch::new(db.clone())),
                chat_model.clone(),
            )
            .with_top_k(config.retrieval.top_k)
            .with_attribution(config.retrieval.attribution)
            .with_temperature(config.llm.temperature),
        );

        let mut router = HybridRouter::new(memory, retrieval);
        let mut schema_cache = None;
        if let (Some(base_url), Some(provider)) = (config.odata.base_url.clone(), schema_provider) {
            let cache = Arc::new(SchemaCache::new(
                provider,
                config.schema.ttl_secs.map(Duration::from_secs),
            ));
            let handler = StructuredQueryHandler::new(
                odata_client(&config.odata)?,
                credentials(&config.odata),
                config.odata.dialect,
                config.odata.page_size,
            );
            router = router.with_structured(StructuredSource::new(
                base_url,
                cache.clone(),
                IntentExtractor::new(llm, chat_model),
                handler,
            ));
            schema_cache = Some(cache);
        }

        Ok(Self {
            ingestion: IngestionPipeline::new(db.clone(), embedder, &config.ingest),
            consistency: Arc::new(ConsistencyManager::new(db.clone())),
            config,
            db,
            router,
            schema_cache,
        })
    }
}

fn odata_client(config: &ODataConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .danger_accept_invalid_certs(config.accept_invalid_certs)
        .build()?)
}

fn credentials(config: &ODataConfig) -> Option<Credentials> {
    config.username.clone().map(|username| Credentials {
        username,
        password: config.password.clone(),
    })
}

/// Install the global subscriber. `RUST_LOG` takes precedence over `level`.
pub fn init_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("hybrid_rag={level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

//! Engine assembly.
//!
//! Owns one instance of every subsystem and wires them together. There
//! are no ambient singletons: the store, embedder, pipeline, search
//! engine, and registry are constructed once here and passed around
//! explicitly.

use std::sync::Arc;

use crate::config::Config;
use crate::convert::{ConverterFacade, DocumentConverter};
use crate::embedder::{OnnxEmbedder, TextEmbedder};
use crate::error::KbResult;
use crate::pipeline::IngestionPipeline;
use crate::registry::KnowledgeBaseRegistry;
use crate::search::SearchEngine;
use crate::store::{VectorStore, SCHEMA_VERSION};

/// The assembled LocalKB engine.
pub struct KnowledgeEngine {
    config: Config,
    store: Arc<VectorStore>,
    embedder: Arc<dyn TextEmbedder>,
    pipeline: IngestionPipeline,
    search: SearchEngine,
    registry: KnowledgeBaseRegistry,
}

/// A point-in-time summary of the engine.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStatus {
    /// Directory holding the store database.
    pub store_path: String,
    /// Current store schema version.
    pub schema_version: String,
    /// Number of knowledgebases under the current version.
    pub knowledgebase_count: usize,
    /// Total non-placeholder chunks across all knowledgebases.
    pub total_chunks: usize,
    /// Output dimension of the configured embedder.
    pub embedding_dimensions: usize,
}

impl KnowledgeEngine {
    /// Build the engine from configuration with the production ONNX
    /// embedder. The model itself loads lazily on first use.
    pub fn new(config: Config) -> KbResult<Self> {
        config.validate()?;
        let embedder: Arc<dyn TextEmbedder> = Arc::new(OnnxEmbedder::new(
            &config.embedding,
            config.model_cache_path(),
        ));
        Self::with_embedder(config, embedder)
    }

    /// Build the engine around an explicit embedder (tests use a
    /// deterministic one).
    pub fn with_embedder(config: Config, embedder: Arc<dyn TextEmbedder>) -> KbResult<Self> {
        let store = Arc::new(VectorStore::open_at(&config.store_path())?);

        let converter: Arc<dyn DocumentConverter> = Arc::new(ConverterFacade::new(
            config.ingestion.converter_timeout_ms,
            config.ingestion.converter_command.clone(),
        ));

        let pipeline = IngestionPipeline::new(
            Arc::clone(&store),
            Arc::clone(&embedder),
            converter,
            config.ingestion.clone(),
            config.chunker.clone(),
        );

        let search = SearchEngine::new(
            Arc::clone(&store),
            Arc::clone(&embedder),
            config.search.default_max_results,
            config.search.cache_ttl_ms,
        );

        let registry = KnowledgeBaseRegistry::new(Arc::clone(&store));

        tracing::info!(
            store = %config.store_path().display(),
            model = %config.embedding.model,
            schema_version = SCHEMA_VERSION,
            "engine initialized"
        );

        Ok(Self {
            config,
            store,
            embedder,
            pipeline,
            search,
            registry,
        })
    }

    /// The ingestion pipeline.
    pub fn pipeline(&self) -> &IngestionPipeline {
        &self.pipeline
    }

    /// The search engine.
    pub fn search_engine(&self) -> &SearchEngine {
        &self.search
    }

    /// The knowledgebase registry.
    pub fn registry(&self) -> &KnowledgeBaseRegistry {
        &self.registry
    }

    /// The shared vector store.
    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    /// The engine configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Summarize the engine's current state.
    pub fn status(&self) -> KbResult<EngineStatus> {
        let summaries = self.registry.list()?;
        Ok(EngineStatus {
            store_path: self.config.store_path().display().to_string(),
            schema_version: SCHEMA_VERSION.to_string(),
            knowledgebase_count: summaries.len(),
            total_chunks: summaries.iter().map(|s| s.chunk_count).sum(),
            embedding_dimensions: self.embedder.dimensions(),
        })
    }
}

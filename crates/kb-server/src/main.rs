//! LocalKB tool-dispatch server.
//!
//! Speaks the newline-delimited JSON tool protocol over stdio. Logs go
//! to stderr so stdout stays clean for responses.

mod protocol;
mod serve;
mod tools;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use kb_core::{Config, KnowledgeEngine};

use crate::tools::ToolDispatcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let engine = Arc::new(KnowledgeEngine::new(config)?);
    let status = engine.status()?;
    tracing::info!(
        store = %status.store_path,
        knowledgebases = status.knowledgebase_count,
        chunks = status.total_chunks,
        schema_version = %status.schema_version,
        "kb-server ready on stdio"
    );

    let dispatcher = Arc::new(ToolDispatcher::new(engine));
    serve::serve(dispatcher, tokio::io::stdin(), tokio::io::stdout()).await
}

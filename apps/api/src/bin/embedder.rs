use std::sync::Arc;

use anyhow::Result;

use gitpulse::config::Config;
use gitpulse::embedder::EmbedderPool;
use gitpulse::embedding::EmbeddingClient;
use gitpulse::object_store::ObjectStore;
use gitpulse::store::VectorStore;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    gitpulse::init_tracing(&config.rust_log);

    let objects = ObjectStore::connect(&config).await?;
    let vectors = Arc::new(VectorStore::connect(&config.qdrant_url).await?);
    let embeddings = EmbeddingClient::new(config.embedding_api_url.clone());

    Arc::new(EmbedderPool::new(objects, vectors, embeddings))
        .run(&config)
        .await
}

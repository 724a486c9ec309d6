use std::sync::Arc;

use futures_util::StreamExt;
use lapin::message::Delivery;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::embedding::EmbeddingClient;
use crate::errors::Disposition;
use crate::messaging::{self, Bus, EMBED_QUEUE, RECONNECT_DELAY};
use crate::models::EmbedRequest;
use crate::object_store::ObjectStore;
use crate::store::VectorStore;

/// Fixed worker task count; the channel bound doubles as the intake
/// backpressure limit.
pub const NUM_WORKERS: usize = 20;

pub struct EmbedderPool {
    pub objects: ObjectStore,
    pub vectors: Arc<VectorStore>,
    pub embeddings: EmbeddingClient,
    pub http: reqwest::Client,
}

impl EmbedderPool {
    pub fn new(objects: ObjectStore, vectors: Arc<VectorStore>, embeddings: EmbeddingClient) -> Self {
        Self {
            objects,
            vectors,
            embeddings,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("Failed to build HTTP client"),
        }
    }

    /// Spawns the worker tasks once, then feeds them from the bus consumer,
    /// reconnecting whenever the connection drops. The bounded channel
    /// pauses intake while all workers are busy.
    pub async fn run(self: Arc<Self>, config: &Config) -> anyhow::Result<()> {
        let (tx, rx) = mpsc::channel::<Delivery>(NUM_WORKERS);
        let rx = Arc::new(Mutex::new(rx));

        for worker_id in 0..NUM_WORKERS {
            let pool = Arc::clone(&self);
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                loop {
                    let delivery = { rx.lock().await.recv().await };
                    let Some(delivery) = delivery else {
                        return;
                    };
                    let disposition = pool.handle_delivery(worker_id, &delivery.data).await;
                    messaging::settle(&delivery, disposition).await;
                }
            });
        }

        loop {
            let bus = match Bus::connect_with_retry(&config.rabbitmq_url).await {
                Ok(bus) => bus,
                Err(e) => {
                    error!("Broker unavailable: {e}. Retrying...");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };
            let mut consumer = match bus.consume(EMBED_QUEUE, "embedder").await {
                Ok(consumer) => consumer,
                Err(e) => {
                    error!("Failed to start consuming from {EMBED_QUEUE}: {e}. Reconnecting...");
                    bus.close().await;
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };
            info!("Embedder started. Waiting for messages on queue: {EMBED_QUEUE}");

            loop {
                tokio::select! {
                    delivery = consumer.next() => {
                        let Some(Ok(delivery)) = delivery else {
                            warn!("Consume stream ended. Reconnecting...");
                            break;
                        };
                        if tx.send(delivery).await.is_err() {
                            anyhow::bail!("Embedder worker pool is gone");
                        }
                    }
                    _ = bus.closed() => {
                        warn!("Bus connection lost. Reconnecting...");
                        break;
                    }
                }
            }

            bus.close().await;
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn handle_delivery(&self, worker_id: usize, payload: &[u8]) -> Disposition {
        let request: EmbedRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(e) => {
                error!("Worker {worker_id}: failed to decode embed request: {e}");
                return Disposition::Discard;
            }
        };
        info!(
            "Worker {worker_id}: embedding README for repository {}",
            request.repository_id
        );
        self.embed(worker_id, request).await
    }

    async fn embed(&self, worker_id: usize, request: EmbedRequest) -> Disposition {
        let content = match self.load_readme(&request).await {
            Ok(Some(content)) => content,
            Ok(None) => {
                info!(
                    "Worker {worker_id}: no README available for repository {}, skipping",
                    request.repository_id
                );
                return Disposition::Ack;
            }
            Err(e) => {
                error!(
                    "Worker {worker_id}: failed to load README for {}: {e}",
                    request.minio_path
                );
                return Disposition::Requeue;
            }
        };

        let text = String::from_utf8_lossy(&content);
        let vector = match self.embeddings.embed(&text).await {
            Ok(vector) => vector,
            Err(e) => {
                error!(
                    "Worker {worker_id}: embedding call failed for repository {}: {e}",
                    request.repository_id
                );
                return Disposition::Requeue;
            }
        };

        if let Err(e) = self.vectors.upsert(request.repository_id, vector).await {
            error!(
                "Worker {worker_id}: failed to upsert vector for repository {}: {e}",
                request.repository_id
            );
            return Disposition::Requeue;
        }

        info!(
            "Worker {worker_id}: embedded README for repository {}",
            request.repository_id
        );
        Disposition::Ack
    }

    /// Loads the README from the object store; when it is absent and the
    /// request carries a fallback URL, downloads it and caches it back so
    /// later replays hit the store. `Ok(None)` means there is genuinely
    /// nothing to embed.
    async fn load_readme(&self, request: &EmbedRequest) -> anyhow::Result<Option<Vec<u8>>> {
        if let Some(content) = self.objects.get_optional(&request.minio_path).await? {
            return Ok(Some(content));
        }

        let Some(url) = &request.download_url else {
            return Ok(None);
        };

        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("README download returned status {}", response.status());
        }
        let content = response.bytes().await?.to_vec();

        if let Err(e) = self
            .objects
            .upload(&request.minio_path, content.clone(), "text/markdown")
            .await
        {
            warn!("Failed to cache downloaded README {}: {e}", request.minio_path);
        }

        Ok(Some(content))
    }
}

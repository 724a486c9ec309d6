use anyhow::{anyhow, Context, Result};
use qdrant_client::qdrant::point_id::PointIdOptions;
use qdrant_client::qdrant::vectors_output::VectorsOptions;
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, Distance, Filter, GetPointsBuilder, PointId, PointStruct,
    SearchPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant};
use tracing::info;

/// Name of the one collection this system uses.
pub const COLLECTION: &str = "repositories";
/// Dimensionality of the embedding model's output.
pub const VECTOR_SIZE: u64 = 384;

/// Vector store adapter. Points are keyed by repository id and carry the
/// same id in their payload so searches can exclude the query point.
pub struct VectorStore {
    client: Qdrant,
}

impl VectorStore {
    /// Connects and creates the collection if it does not exist yet.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Qdrant::from_url(url)
            .build()
            .context("Failed to build vector store client")?;

        let store = Self { client };
        store.ensure_collection().await?;
        Ok(store)
    }

    async fn ensure_collection(&self) -> Result<()> {
        if self.client.collection_exists(COLLECTION).await? {
            return Ok(());
        }
        info!("Collection '{COLLECTION}' does not exist, creating it...");
        self.client
            .create_collection(
                CreateCollectionBuilder::new(COLLECTION)
                    .vectors_config(VectorParamsBuilder::new(VECTOR_SIZE, Distance::Cosine)),
            )
            .await?;
        Ok(())
    }

    pub async fn upsert(&self, repository_id: i64, vector: Vec<f32>) -> Result<()> {
        let payload = Payload::try_from(serde_json::json!({ "id": repository_id }))
            .map_err(|e| anyhow!("Failed to build point payload: {e}"))?;
        let point = PointStruct::new(repository_id as u64, vector, payload);
        self.client
            .upsert_points(UpsertPointsBuilder::new(COLLECTION, vec![point]).wait(true))
            .await?;
        Ok(())
    }

    pub async fn get_vector(&self, repository_id: i64) -> Result<Option<Vec<f32>>> {
        let response = self
            .client
            .get_points(
                GetPointsBuilder::new(
                    COLLECTION,
                    vec![PointId::from(repository_id as u64)],
                )
                .with_vectors(true),
            )
            .await?;

        let Some(point) = response.result.into_iter().next() else {
            return Ok(None);
        };
        let vector = point
            .vectors
            .and_then(|v| v.vectors_options)
            .and_then(|options| match options {
                VectorsOptions::Vector(v) => Some(v.data),
                _ => None,
            });
        Ok(vector)
    }

    /// Top-`limit` nearest neighbors by cosine similarity, excluding the
    /// point whose payload id equals `exclude_id`. Returns (id, score)
    /// pairs in descending score order.
    pub async fn search_neighbors(
        &self,
        vector: Vec<f32>,
        limit: u64,
        exclude_id: i64,
    ) -> Result<Vec<(i64, f32)>> {
        let response = self
            .client
            .search_points(
                SearchPointsBuilder::new(COLLECTION, vector, limit)
                    .filter(Filter::must_not([Condition::matches("id", exclude_id)]))
                    .with_payload(true),
            )
            .await?;

        Ok(response
            .result
            .into_iter()
            .filter_map(|scored| {
                let id = match scored.id.and_then(|p| p.point_id_options) {
                    Some(PointIdOptions::Num(n)) => n as i64,
                    _ => return None,
                };
                Some((id, scored.score))
            })
            .collect())
    }
}

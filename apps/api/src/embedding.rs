use serde::Deserialize;
use thiserror::Error;

/// Dimensionality every embedding must have; mirrors the vector collection.
pub const EMBEDDING_DIM: usize = 384;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Embedding API returned status {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Embedding has {got} dimensions, expected {EMBEDDING_DIM}")]
    BadDimension { got: usize },
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

/// Client for the embedding model backend, reached through the autoscaler
/// proxy.
#[derive(Clone)]
pub struct EmbeddingClient {
    http: reqwest::Client,
    base_url: String,
}

impl EmbeddingClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("Failed to build HTTP client"),
            base_url: base_url.into(),
        }
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let response = self
            .http
            .post(format!("{}/embed", self.base_url))
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: EmbedResponse = response.json().await?;
        validate_dimension(parsed.embedding)
    }
}

fn validate_dimension(embedding: Vec<f32>) -> Result<Vec<f32>, EmbeddingError> {
    if embedding.len() != EMBEDDING_DIM {
        return Err(EmbeddingError::BadDimension {
            got: embedding.len(),
        });
    }
    Ok(embedding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_exact_dimension() {
        let vector = vec![0.0_f32; EMBEDDING_DIM];
        assert_eq!(validate_dimension(vector).unwrap().len(), EMBEDDING_DIM);
    }

    #[test]
    fn test_rejects_wrong_dimension() {
        let result = validate_dimension(vec![0.0_f32; 768]);
        assert!(matches!(
            result,
            Err(EmbeddingError::BadDimension { got: 768 })
        ));
    }
}

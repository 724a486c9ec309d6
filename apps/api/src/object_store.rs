use anyhow::{anyhow, Result};
use aws_config::Region;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use tracing::info;

use crate::config::Config;

/// MinIO/S3 adapter holding the bucket README blobs live in.
#[derive(Clone)]
pub struct ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

/// Canonical object key for a repository README.
pub fn readme_key(repository_id: i64) -> String {
    format!("readmes/{repository_id}.md")
}

impl ObjectStore {
    /// Builds the client and creates the bucket if it does not exist yet.
    pub async fn connect(config: &Config) -> Result<Self> {
        let credentials = Credentials::new(
            &config.aws_access_key_id,
            &config.aws_secret_access_key,
            None,
            None,
            "gitpulse-static",
        );

        let s3_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .credentials_provider(credentials)
            .endpoint_url(&config.s3_endpoint)
            .load()
            .await;

        let client = aws_sdk_s3::Client::new(&s3_config);
        let store = Self {
            client,
            bucket: config.s3_bucket.clone(),
        };
        store.ensure_bucket().await?;
        Ok(store)
    }

    async fn ensure_bucket(&self) -> Result<()> {
        if self
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok()
        {
            return Ok(());
        }
        info!("Bucket '{}' does not exist, creating it...", self.bucket);
        self.client
            .create_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to create bucket '{}': {e}", self.bucket))?;
        Ok(())
    }

    pub async fn upload(&self, key: &str, content: Vec<u8>, content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(content))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| anyhow!("Upload of '{key}' failed: {e}"))?;
        Ok(())
    }

    /// Fetches an object in full; a missing key is `None`, every other
    /// failure an error.
    pub async fn get_optional(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => {
                let bytes = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| anyhow!("Read of '{key}' failed: {e}"))?;
                Ok(Some(bytes.into_bytes().to_vec()))
            }
            Err(e) => {
                let service_err = e.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(anyhow!("Fetch of '{key}' failed: {service_err}"))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readme_key_shape() {
        assert_eq!(readme_key(13329152), "readmes/13329152.md");
    }
}

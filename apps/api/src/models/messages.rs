use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Repository;

/// Published by discovery onto `repos_to_crawl`, one per search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryMessage {
    pub repository: Repository,
    pub discovered_at: DateTime<Utc>,
}

/// Published by the crawler onto `raw_data_to_process` after enrichment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlResult {
    pub repository: Repository,
    pub discovered_at: DateTime<Utc>,
    pub crawled_at: DateTime<Utc>,
}

/// Published onto `readme_to_embed` to trigger (re-)embedding of a README.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedRequest {
    pub repository_id: i64,
    pub minio_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

/// One neighbor in a persisted similarity blob.
///
/// Field names are capitalized on the wire; the blob predates this service
/// and existing rows decode with `Score`/`Member` keys.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityEntry {
    #[serde(rename = "Score")]
    pub score: f64,
    #[serde(rename = "Member")]
    pub member: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_similarity_entry_wire_keys() {
        let entry = SimilarityEntry {
            score: 0.9,
            member: 7,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, r#"{"Score":0.9,"Member":7}"#);
        let back: SimilarityEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_embed_request_omits_absent_download_url() {
        let req = EmbedRequest {
            repository_id: 13329152,
            minio_path: "readmes/13329152.md".to_string(),
            download_url: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("download_url"));
        let back: EmbedRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.repository_id, 13329152);
        assert!(back.download_url.is_none());
    }
}

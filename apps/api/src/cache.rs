use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

/// TTL applied to per-session seen-sets, refreshed on every write.
pub const SEEN_SET_TTL: Duration = Duration::from_secs(24 * 3600);

/// Redis adapter. All payloads except seen-set members are stored as
/// snappy-compressed JSON. Reads are best-effort: any transport or decode
/// failure is treated as a miss so callers always fall through to the
/// authoritative store.
#[derive(Clone)]
pub struct Cache {
    con: ConnectionManager,
}

fn compress(data: &[u8]) -> Vec<u8> {
    snap::raw::Encoder::new()
        .compress_vec(data)
        .unwrap_or_else(|_| data.to_vec())
}

fn decompress(data: &[u8]) -> Option<Vec<u8>> {
    snap::raw::Decoder::new().decompress_vec(data).ok()
}

impl Cache {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let con = client.get_connection_manager().await?;
        info!("Redis connection established");
        Ok(Self { con })
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut con = self.con.clone();
        let raw: Option<Vec<u8>> = con.get(key).await.ok()?;
        serde_json::from_slice(&decompress(&raw?)?).ok()
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let Ok(bytes) = serde_json::to_vec(value) else {
            return;
        };
        self.set_bytes(key, &bytes, ttl).await;
    }

    pub async fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        let mut con = self.con.clone();
        let raw: Option<Vec<u8>> = con.get(key).await.ok()?;
        decompress(&raw?)
    }

    pub async fn set_bytes(&self, key: &str, value: &[u8], ttl: Duration) {
        let mut con = self.con.clone();
        let compressed = compress(value);
        if let Err(e) = con
            .set_ex::<_, _, ()>(key, compressed, ttl.as_secs())
            .await
        {
            warn!("Failed to cache {key}: {e}");
        }
    }

    /// Batched get. The result is positionally aligned with `keys`; a miss or
    /// undecodable entry yields `None` at that position.
    pub async fn mget_json<T: DeserializeOwned>(&self, keys: &[String]) -> Vec<Option<T>> {
        if keys.is_empty() {
            return Vec::new();
        }
        let mut con = self.con.clone();
        let raw: Vec<Option<Vec<u8>>> = match con.mget(keys).await {
            Ok(values) => values,
            Err(e) => {
                debug!("MGET failed: {e}");
                return keys.iter().map(|_| None).collect();
            }
        };
        raw.into_iter()
            .map(|v| {
                v.and_then(|bytes| decompress(&bytes))
                    .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            })
            .collect()
    }

    pub async fn delete(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        let mut con = self.con.clone();
        if let Err(e) = con.del::<_, ()>(keys).await {
            warn!("Failed to invalidate cache keys: {e}");
        }
    }

    /// Records a repository as surfaced to the session and refreshes the
    /// set's 24 h lifetime.
    pub async fn add_seen(&self, session_id: &str, repository_id: i64) -> Result<()> {
        let key = seen_key(session_id);
        let mut con = self.con.clone();
        con.sadd::<_, _, ()>(&key, repository_id).await?;
        con.expire::<_, ()>(&key, SEEN_SET_TTL.as_secs() as i64)
            .await?;
        Ok(())
    }

    pub async fn seen_repository_ids(&self, session_id: &str) -> HashSet<i64> {
        let mut con = self.con.clone();
        match con.smembers::<_, Vec<i64>>(seen_key(session_id)).await {
            Ok(members) => members.into_iter().collect(),
            Err(e) => {
                debug!("Failed to read seen-set for session {session_id}: {e}");
                HashSet::new()
            }
        }
    }

    /// Top entries of a sorted set, highest score first, as (member, score).
    pub async fn sorted_set_top(&self, key: &str, count: usize) -> Vec<(i64, f64)> {
        let mut con = self.con.clone();
        let raw: Vec<(String, f64)> = match con
            .zrevrange_withscores(key, 0, count as isize - 1)
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                debug!("ZREVRANGE {key} failed: {e}");
                return Vec::new();
            }
        };
        raw.into_iter()
            .filter_map(|(member, score)| member.parse::<i64>().ok().map(|id| (id, score)))
            .collect()
    }

    /// Replaces scores in an existing sorted set without touching its TTL.
    /// Returns false (and writes nothing) when the key does not exist, so a
    /// periodic producer can never resurrect an expired hot copy.
    pub async fn update_sorted_set_if_exists(
        &self,
        key: &str,
        entries: &[(f64, i64)],
    ) -> Result<bool> {
        if entries.is_empty() {
            return Ok(false);
        }
        let mut con = self.con.clone();
        let exists: bool = con.exists(key).await?;
        if !exists {
            return Ok(false);
        }
        con.zadd_multiple::<_, _, _, ()>(key, entries).await?;
        Ok(true)
    }

    /// Populates a sorted set and stamps a fresh TTL; used by the online
    /// cold path when warming a neighborhood from the persisted blob.
    pub async fn warm_sorted_set(
        &self,
        key: &str,
        entries: &[(f64, i64)],
        ttl: Duration,
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut con = self.con.clone();
        con.zadd_multiple::<_, _, _, ()>(key, entries).await?;
        con.expire::<_, ()>(key, ttl.as_secs() as i64).await?;
        Ok(())
    }
}

fn seen_key(session_id: &str) -> String {
    format!("seen:{session_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_roundtrip() {
        let payload = br#"{"sessionId":"abc","repositories":[]}"#;
        let compressed = compress(payload);
        assert_eq!(decompress(&compressed).unwrap(), payload);
    }

    #[test]
    fn test_decompress_rejects_garbage() {
        assert!(decompress(b"not snappy data at all").is_none());
    }

    #[test]
    fn test_seen_key_shape() {
        assert_eq!(seen_key("s-1"), "seen:s-1");
    }
}

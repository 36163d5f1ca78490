use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

const RING_CAPACITY: usize = 100;

/// Rolling per-arm preview latency history, persisted as JSON.
/// Load-mutate-save on every `record_preview_latency` call.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PreviewLatencyStore {
    #[serde(rename = "preview_latency_s")]
    by_arm: HashMap<String, Vec<f64>>,
}

impl PreviewLatencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load(path: &PathBuf) -> Self {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    pub async fn save(&self, path: &PathBuf) -> Result<(), String> {
        let content = serde_json::to_vec_pretty(self).map_err(|e| e.to_string())?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| e.to_string())?;
        }
        tokio::fs::write(path, content).await.map_err(|e| e.to_string())
    }

    /// Append a latency sample for `arm`, dropping the oldest once the ring
    /// exceeds `RING_CAPACITY`.
    pub fn record(&mut self, arm: &str, latency_s: f64) {
        let series = self.by_arm.entry(arm.to_string()).or_default();
        series.push(latency_s);
        if series.len() > RING_CAPACITY {
            series.remove(0);
        }
    }

    /// p95 via nearest-rank on a sorted copy. `None` if no samples recorded.
    pub fn p95(&self, arm: &str) -> Option<f64> {
        let series = self.by_arm.get(arm)?;
        if series.is_empty() {
            return None;
        }
        let mut sorted = series.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
        let idx = rank.saturating_sub(1).min(sorted.len() - 1);
        Some(sorted[idx])
    }
}

/// Wraps a `PreviewLatencyStore` with the file it round-trips through:
/// every `record` call is load-mutate-save, treating the metrics file as
/// the single source of truth rather than an in-memory cache that happens
/// to get flushed.
pub struct LatencyTracker {
    path: PathBuf,
    store: Mutex<PreviewLatencyStore>,
}

impl LatencyTracker {
    pub async fn load(path: PathBuf) -> Self {
        let store = PreviewLatencyStore::load(&path).await;
        Self { path, store: Mutex::new(store) }
    }

    pub async fn p95(&self, arm: &str) -> Option<f64> {
        self.store.lock().await.p95(arm)
    }

    pub async fn record(&self, arm: &str, latency_s: f64) {
        let mut store = self.store.lock().await;
        store.record(arm, latency_s);
        if let Err(e) = store.save(&self.path).await {
            tracing::warn!("failed to persist preview latency store: {e}");
        }
    }
}

/// A key-value cache for full preview text, keyed by
/// `"preview:<model>:<min_tokens>:<sha256(query)>"`.
#[async_trait]
pub trait PreviewCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<(usize, String)>;
    async fn setex(&self, key: &str, ttl_s: u64, tokens: usize, text: String);
}

pub fn cache_key(model: &str, min_tokens: usize, query: &str) -> String {
    #[cfg(feature = "external-router-state")]
    {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(query.as_bytes());
        format!("preview:{model}:{min_tokens}:{}", hex::encode(digest))
    }
    #[cfg(not(feature = "external-router-state"))]
    {
        format!("preview:{model}:{min_tokens}:{}", query.len())
    }
}

struct CacheEntry {
    tokens: usize,
    text: String,
    expires_at: std::time::Instant,
}

/// Default in-process cache backend: a mutex-guarded map with manual TTL
/// expiry checked on read.
#[derive(Default)]
pub struct InMemoryPreviewCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl InMemoryPreviewCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PreviewCache for InMemoryPreviewCache {
    async fn get(&self, key: &str) -> Option<(usize, String)> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.expires_at > std::time::Instant::now() => {
                Some((entry.tokens, entry.text.clone()))
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn setex(&self, key: &str, ttl_s: u64, tokens: usize, text: String) {
        let expires_at = std::time::Instant::now() + std::time::Duration::from_secs(ttl_s);
        self.entries.lock().await.insert(key.to_string(), CacheEntry { tokens, text, expires_at });
    }
}

#[cfg(feature = "external-router-state")]
pub struct RedisPreviewCache {
    client: redis::Client,
}

#[cfg(feature = "external-router-state")]
impl RedisPreviewCache {
    pub fn new(redis_url: &str) -> Result<Self, String> {
        let client = redis::Client::open(redis_url).map_err(|e| e.to_string())?;
        Ok(Self { client })
    }
}

#[cfg(feature = "external-router-state")]
#[async_trait]
impl PreviewCache for RedisPreviewCache {
    async fn get(&self, key: &str) -> Option<(usize, String)> {
        use redis::AsyncCommands;
        let mut conn = self.client.get_connection_manager().await.ok()?;
        let raw: Option<String> = conn.get(key).await.ok()?;
        let raw = raw?;
        let value: serde_json::Value = serde_json::from_str(&raw).ok()?;
        let tokens = value.get("tokens")?.as_u64()? as usize;
        let text = value.get("text")?.as_str()?.to_string();
        Some((tokens, text))
    }

    async fn setex(&self, key: &str, ttl_s: u64, tokens: usize, text: String) {
        use redis::AsyncCommands;
        let Ok(mut conn) = self.client.get_connection_manager().await else { return };
        let payload = serde_json::json!({ "tokens": tokens, "text": text }).to_string();
        let _: Result<(), _> = conn.set_ex(key, payload, ttl_s).await;
    }
}

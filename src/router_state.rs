use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::router::{ArmState, RouterState, ROUTER_STATE_VERSION};

/// Parse a router-state document, falling back to the pre-versioned bare
/// `{arm: {a_inv, b}}` map (no `version`/`d`/`arms` wrapper) when the
/// current shape doesn't deserialize.
fn parse_router_state(raw: &str) -> Option<RouterState> {
    if let Ok(state) = serde_json::from_str::<RouterState>(raw) {
        return Some(state);
    }
    migrate_legacy_arms(raw)
}

/// Best-effort recovery of each arm from the legacy bare-map format. Arms
/// with empty vectors are dropped; `d` is inferred from the first surviving
/// arm's `b` length. Returns `None` if nothing usable survives.
fn migrate_legacy_arms(raw: &str) -> Option<RouterState> {
    let legacy: HashMap<String, ArmState> = serde_json::from_str(raw).ok()?;
    let arms: HashMap<String, ArmState> =
        legacy.into_iter().filter(|(_, s)| !s.b.is_empty() && !s.a_inv.is_empty()).collect();
    if arms.is_empty() {
        return None;
    }
    let d = arms.values().next()?.b.len();
    tracing::warn!(d, arms = arms.len(), "migrated legacy router state format");
    Some(RouterState { version: ROUTER_STATE_VERSION, d, arms })
}

/// A place the router's `ArmState`s can be persisted and reloaded from.
/// Every implementation must be best-effort on `save`: the router never
/// propagates a persistence error to the caller, it only logs and continues.
#[async_trait]
pub trait RouterStateBackend: Send + Sync {
    async fn load(&self) -> Option<RouterState>;
    async fn save(&self, state: &RouterState) -> Result<(), String>;
}

/// File-backed state store: atomic temp-write + rename, same discipline as
/// the local memory store's file writes.
pub struct FileRouterStateBackend {
    path: PathBuf,
}

impl FileRouterStateBackend {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl RouterStateBackend for FileRouterStateBackend {
    async fn load(&self) -> Option<RouterState> {
        let bytes = tokio::fs::read(&self.path).await.ok()?;
        let raw = std::str::from_utf8(&bytes).ok()?;
        parse_router_state(raw)
    }

    async fn save(&self, state: &RouterState) -> Result<(), String> {
        let content = serde_json::to_vec_pretty(state).map_err(|e| e.to_string())?;
        atomic_write(&self.path, &content).await.map_err(|e| e.to_string())
    }
}

async fn atomic_write(path: &PathBuf, content: &[u8]) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension(format!("tmp.{}", std::process::id()));
    tokio::fs::write(&tmp_path, content).await?;
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }
    Ok(())
}

/// Composite backend: reads/writes the local file first, then best-effort
/// mirrors to an external K/V store when one is configured. Mirrors the
/// local+optional-global split of a composite memory store.
pub struct CompositeRouterStateBackend {
    local: FileRouterStateBackend,
    #[cfg(feature = "external-router-state")]
    external: Option<RedisRouterStateBackend>,
}

impl CompositeRouterStateBackend {
    pub fn local_only(path: PathBuf) -> Self {
        Self {
            local: FileRouterStateBackend::new(path),
            #[cfg(feature = "external-router-state")]
            external: None,
        }
    }

    #[cfg(feature = "external-router-state")]
    pub fn with_external(path: PathBuf, external: RedisRouterStateBackend) -> Self {
        Self {
            local: FileRouterStateBackend::new(path),
            external: Some(external),
        }
    }
}

#[async_trait]
impl RouterStateBackend for CompositeRouterStateBackend {
    async fn load(&self) -> Option<RouterState> {
        if let Some(state) = self.local.load().await {
            return Some(state);
        }
        #[cfg(feature = "external-router-state")]
        if let Some(external) = &self.external {
            return external.load().await;
        }
        None
    }

    async fn save(&self, state: &RouterState) -> Result<(), String> {
        let local_result = self.local.save(state).await;

        #[cfg(feature = "external-router-state")]
        if let Some(external) = &self.external
            && let Err(e) = external.save(state).await
        {
            tracing::warn!("external router state mirror failed: {e}");
        }

        local_result
    }
}

#[cfg(feature = "external-router-state")]
pub struct RedisRouterStateBackend {
    client: redis::Client,
    key: String,
}

#[cfg(feature = "external-router-state")]
impl RedisRouterStateBackend {
    pub fn new(redis_url: &str, key: String) -> Result<Self, String> {
        let client = redis::Client::open(redis_url).map_err(|e| e.to_string())?;
        Ok(Self { client, key })
    }
}

#[cfg(feature = "external-router-state")]
#[async_trait]
impl RouterStateBackend for RedisRouterStateBackend {
    async fn load(&self) -> Option<RouterState> {
        use redis::AsyncCommands;
        let mut conn = self.client.get_connection_manager().await.ok()?;
        let raw: Option<String> = conn.get(&self.key).await.ok()?;
        parse_router_state(&raw?)
    }

    async fn save(&self, state: &RouterState) -> Result<(), String> {
        use redis::AsyncCommands;
        let payload = serde_json::to_string(state).map_err(|e| e.to_string())?;
        let mut conn = self
            .client
            .get_connection_manager()
            .await
            .map_err(|e| e.to_string())?;
        conn.set::<_, _, ()>(&self.key, payload)
            .await
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::ArmState;
    use std::collections::HashMap;

    fn sample_state() -> RouterState {
        let mut arms = HashMap::new();
        arms.insert(
            "gpt".to_string(),
            ArmState { a_inv: vec![vec![1.0, 0.0], vec![0.0, 1.0]], b: vec![0.1, 0.2] },
        );
        RouterState { version: 1, d: 2, arms }
    }

    #[tokio::test]
    async fn file_backend_round_trips() {
        let dir = std::env::temp_dir().join(format!("riptide-router-state-test-{}", std::process::id()));
        let path = dir.join("state.json");
        let backend = FileRouterStateBackend::new(path.clone());

        assert!(backend.load().await.is_none());

        let state = sample_state();
        backend.save(&state).await.unwrap();

        let loaded = backend.load().await.unwrap();
        assert_eq!(loaded.d, 2);
        assert_eq!(loaded.arms["gpt"].b, vec![0.1, 0.2]);

        let _ = tokio::fs::remove_dir_all(dir).await;
    }

    #[tokio::test]
    async fn file_backend_migrates_legacy_bare_arm_map() {
        let dir = std::env::temp_dir().join(format!("riptide-router-state-test-legacy-{}", std::process::id()));
        let path = dir.join("state.json");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let legacy = serde_json::json!({
            "gpt": {"a_inv": [[1.0, 0.0], [0.0, 1.0]], "b": [0.1, 0.2]},
            "empty-arm": {"a_inv": [], "b": []},
        });
        tokio::fs::write(&path, serde_json::to_vec(&legacy).unwrap()).await.unwrap();

        let backend = FileRouterStateBackend::new(path);
        let loaded = backend.load().await.unwrap();
        assert_eq!(loaded.d, 2);
        assert_eq!(loaded.arms.len(), 1);
        assert_eq!(loaded.arms["gpt"].b, vec![0.1, 0.2]);

        let _ = tokio::fs::remove_dir_all(dir).await;
    }

    #[test]
    fn migrate_legacy_arms_returns_none_when_all_arms_empty() {
        let legacy = serde_json::json!({
            "gpt": {"a_inv": [], "b": []},
        })
        .to_string();
        assert!(migrate_legacy_arms(&legacy).is_none());
    }

    #[tokio::test]
    async fn composite_local_only_round_trips() {
        let dir = std::env::temp_dir().join(format!("riptide-router-state-test-composite-{}", std::process::id()));
        let path = dir.join("state.json");
        let backend = CompositeRouterStateBackend::local_only(path);

        let state = sample_state();
        backend.save(&state).await.unwrap();
        let loaded = backend.load().await.unwrap();
        assert_eq!(loaded.arms.len(), 1);

        let _ = tokio::fs::remove_dir_all(dir).await;
    }
}

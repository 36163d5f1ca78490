use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use crate::error::RaceError;

/// Fixed seed for the embedding random projection, pinned so the same query
/// always maps to the same feature vector across process restarts.
const PROJECTION_SEED: u64 = 0x5175_616c;

/// Length/word-count feature vector: `[1.0, len_norm, words_norm]`, d=3.
pub fn length_features(query: &str) -> Vec<f64> {
    let len_norm = (query.len() as f64 / 2000.0).min(1.0);
    let words_norm = (query.split_whitespace().count() as f64 / 100.0).min(1.0);
    vec![1.0, len_norm, words_norm]
}

/// Project a raw embedding down to `dim` dimensions via a fixed seeded random
/// matrix, then z-score normalize. `dim` excludes the leading bias term;
/// the returned vector is `dim + 1` long (bias prepended).
pub fn embedding_features(embedding: &[f64], dim: usize) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(PROJECTION_SEED);
    let mut projected = vec![0.0f64; dim];
    for row in projected.iter_mut() {
        let mut acc = 0.0;
        for &x in embedding {
            let w: f64 = rng.random_range(-1.0..1.0);
            acc += w * x;
        }
        *row = acc;
    }

    let mean = projected.iter().sum::<f64>() / projected.len().max(1) as f64;
    let variance =
        projected.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / projected.len().max(1) as f64;
    let std = variance.sqrt().max(1e-9);

    let mut out = Vec::with_capacity(dim + 1);
    out.push(1.0);
    out.extend(projected.iter().map(|v| (v - mean) / std));
    out
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f64>,
}

/// Fetches a raw query embedding from an OpenAI-compatible `/embeddings`
/// endpoint, for callers wiring `BANDIT_FEATURES=embedding`. Failures are
/// the caller's responsibility to fall back on — this makes no attempt at
/// retry, since a missing embedding degrades to length features rather than
/// failing the race.
pub struct EmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    dim: usize,
}

impl EmbeddingProvider {
    pub fn new(model: impl Into<String>, api_key: impl Into<String>, dim: usize) -> Self {
        Self::with_base_url("https://api.openai.com/v1/embeddings", model, api_key, dim)
    }

    pub fn with_base_url(base_url: impl Into<String>, model: impl Into<String>, api_key: impl Into<String>, dim: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            api_key: api_key.into(),
            dim,
        }
    }

    /// The post-projection dimensionality this provider's embeddings reduce to.
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub async fn embed(&self, query: &str) -> Result<Vec<f64>, RaceError> {
        let body = serde_json::json!({ "model": self.model, "input": query });
        let response = self
            .client
            .post(&self.base_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let truncated: String = text.chars().take(500).collect();
            return Err(RaceError::Other(format!("embedding request failed: {status}: {truncated}")));
        }

        let parsed: EmbeddingResponse =
            response.json().await.map_err(|e| RaceError::Other(format!("embedding response parse error: {e}")))?;
        let datum = parsed
            .data
            .into_iter()
            .next()
            .ok_or_else(|| RaceError::Other("embedding response had no data".to_string()))?;
        Ok(datum.embedding)
    }
}

/// Full feature vector for a race: length/word features, optionally extended
/// with a seeded projection of a provider embedding. The embedding's own bias
/// term is dropped since `length_features` already supplies one.
pub fn compute_features(query: &str, embedding: Option<&[f64]>, embedding_dim: usize) -> Vec<f64> {
    let mut x = length_features(query);
    if let Some(embedding) = embedding {
        let projected = embedding_features(embedding, embedding_dim);
        x.extend_from_slice(&projected[1..]);
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_features_are_pure() {
        let a = length_features("hello world");
        let b = length_features("hello world");
        assert_eq!(a, b);
    }

    #[test]
    fn length_features_have_three_dims() {
        assert_eq!(length_features("a query").len(), 3);
    }

    #[test]
    fn embedding_features_are_deterministic() {
        let emb = vec![0.1, 0.2, 0.3, 0.4];
        let a = embedding_features(&emb, 8);
        let b = embedding_features(&emb, 8);
        assert_eq!(a, b);
        assert_eq!(a.len(), 9);
    }

    #[test]
    fn compute_features_without_embedding_matches_length_features() {
        assert_eq!(compute_features("a query", None, 8), length_features("a query"));
    }

    #[test]
    fn compute_features_with_embedding_appends_projection() {
        let emb = vec![0.1, 0.2, 0.3];
        let x = compute_features("a query", Some(&emb), 4);
        assert_eq!(x.len(), 3 + 4);
    }

    async fn mock_embedding_server(body: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = tokio::io::AsyncReadExt::read(&mut socket, &mut buf).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = tokio::io::AsyncWriteExt::write_all(&mut socket, response.as_bytes()).await;
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn embed_parses_first_embedding_from_response() {
        let body = r#"{"data": [{"embedding": [0.1, 0.2, 0.3]}]}"#;
        let url = mock_embedding_server(body).await;
        let provider = EmbeddingProvider::with_base_url(url, "text-embedding-3-small", "test-key", 4);

        let embedding = provider.embed("a query").await.unwrap();
        assert_eq!(embedding, vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn embed_surfaces_non_success_status_as_error() {
        let body = r#"{"error": "bad request"}"#;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = tokio::io::AsyncReadExt::read(&mut socket, &mut buf).await;
            let response = format!(
                "HTTP/1.1 400 Bad Request\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = tokio::io::AsyncWriteExt::write_all(&mut socket, response.as_bytes()).await;
        });
        let provider = EmbeddingProvider::with_base_url(format!("http://{addr}"), "text-embedding-3-small", "test-key", 4);

        let err = provider.embed("a query").await.unwrap_err();
        assert!(matches!(err, RaceError::Other(_)));
    }
}

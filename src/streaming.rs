use std::time::{Duration, Instant};

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::error::RaceError;
use crate::retry::STREAM_RETRY;

/// Maximum size of an accumulated streamed response.
pub const MAX_RESPONSE_BYTES: usize = 4 * 1024 * 1024;

const HEADERS_TIMEOUT: Duration = Duration::from_secs(30);
const FIRST_BYTE_TIMEOUT: Duration = Duration::from_secs(30);
const STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// A single normalized event out of a candidate's streamed response. Provider
/// wire formats differ in field names but always collapse into one of these
/// three kinds.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta(String),
    SearchResults(Vec<CitationItem>),
    Annotation(CitationItem),
}

#[derive(Debug, Clone)]
pub struct CitationItem {
    pub title: String,
    pub url: String,
}

/// Bounds and outcome-capture options for a single `stream()` call.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub stop_after_tokens: Option<usize>,
    pub timeout_s: Option<f64>,
    pub cancellation_token: Option<CancellationToken>,
}

/// Result of consuming a stream to completion (or early stop).
#[derive(Debug, Clone, Default)]
pub struct StreamOutcome {
    pub text: String,
    pub token_count: usize,
    pub citations: Vec<CitationItem>,
    pub partial: bool,
}

/// Provider-agnostic streaming contract. `HttpAgent` is the production
/// implementation; `ScriptedAgent` replays fixed events for tests.
#[async_trait]
pub trait StreamingAgent: Send + Sync {
    fn name(&self) -> &str;

    async fn run_streamed(
        &self,
        prompt: &str,
        opts: &StreamOptions,
    ) -> Result<StreamOutcome, RaceError>;
}

/// Drive a `StreamingAgent` with retry-with-jitter wrapped around the whole
/// call, matching the streaming driver's retry contract (0.2s/3s/5 attempts).
pub async fn stream(
    agent: &dyn StreamingAgent,
    prompt: &str,
    opts: StreamOptions,
) -> Result<StreamOutcome, RaceError> {
    STREAM_RETRY
        .run(|_attempt| async { agent.run_streamed(prompt, &opts).await })
        .await
}

/// Counts whitespace-separated tokens in a fragment. A coarse but stable
/// proxy for provider tokenizers — precise tokenizer parity is not a goal.
pub fn count_tokens(fragment: &str) -> usize {
    fragment.split_whitespace().count()
}

// --- HTTP (OpenAI-compatible chat completions SSE) implementation ---

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
}

pub struct HttpAgent {
    name: String,
    model: String,
    base_url: String,
    api_key: String,
    client: Client,
}

impl HttpAgent {
    pub fn new(name: impl Into<String>, model: impl Into<String>, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("failed to build HTTP client");
        Self {
            name: name.into(),
            model: model.into(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            client,
        }
    }
}

#[async_trait]
impl StreamingAgent for HttpAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run_streamed(
        &self,
        prompt: &str,
        opts: &StreamOptions,
    ) -> Result<StreamOutcome, RaceError> {
        let start = Instant::now();
        let overall_timeout = opts
            .timeout_s
            .map(Duration::from_secs_f64)
            .unwrap_or(Duration::from_secs(600));

        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "stream": true,
        });

        let send_future = self
            .client
            .post(&self.base_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send();

        let response = tokio::time::timeout(HEADERS_TIMEOUT.min(overall_timeout), send_future)
            .await
            .map_err(|_| RaceError::FullStream {
                arm: self.name.clone(),
                message: "timed out waiting for response headers".into(),
            })?
            .map_err(RaceError::from)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let truncated: String = text.chars().take(500).collect();
            return Err(RaceError::FullStream {
                arm: self.name.clone(),
                message: format!("{status}: {truncated}"),
            });
        }

        let mut byte_stream = response.bytes_stream().eventsource();
        let mut accumulated = String::new();
        let mut token_count = 0usize;
        let mut citations = Vec::new();

        let generation_deadline = tokio::time::Instant::now() + overall_timeout.saturating_sub(start.elapsed());
        let cancel = opts.cancellation_token.clone();
        let cancel_fut = async {
            match &cancel {
                Some(t) => t.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(cancel_fut);

        let mut received_first = false;
        let mut last_chunk_at = tokio::time::Instant::now();
        let initial_deadline = generation_deadline.min(tokio::time::Instant::now() + FIRST_BYTE_TIMEOUT);
        let deadline_sleep = tokio::time::sleep_until(initial_deadline);
        tokio::pin!(deadline_sleep);

        loop {
            let effective_deadline = if received_first {
                generation_deadline.min(last_chunk_at + STALL_TIMEOUT)
            } else {
                generation_deadline.min(tokio::time::Instant::now() + FIRST_BYTE_TIMEOUT)
            };
            deadline_sleep.as_mut().reset(effective_deadline);

            tokio::select! {
                _ = &mut cancel_fut => {
                    return Ok(StreamOutcome { text: accumulated, token_count, citations, partial: true });
                }
                _ = &mut deadline_sleep => {
                    if accumulated.is_empty() {
                        return Err(RaceError::FullStream { arm: self.name.clone(), message: "stream timed out".into() });
                    }
                    return Ok(StreamOutcome { text: accumulated, token_count, citations, partial: true });
                }
                event = byte_stream.next() => match event {
                    Some(Ok(ev)) => {
                        if ev.data.trim() == "[DONE]" {
                            break;
                        }
                        let Ok(chunk) = serde_json::from_str::<StreamChunk>(&ev.data) else {
                            received_first = true;
                            last_chunk_at = tokio::time::Instant::now();
                            continue;
                        };
                        let Some(choice) = chunk.choices.first() else { continue };
                        if let Some(ref text) = choice.delta.content
                            && !text.is_empty()
                        {
                            received_first = true;
                            last_chunk_at = tokio::time::Instant::now();
                            token_count += count_tokens(text);
                            if accumulated.len() + text.len() > MAX_RESPONSE_BYTES {
                                return Err(RaceError::FullStream {
                                    arm: self.name.clone(),
                                    message: format!("response exceeded {MAX_RESPONSE_BYTES} bytes"),
                                });
                            }
                            accumulated.push_str(text);
                            if let Some(stop) = opts.stop_after_tokens
                                && token_count >= stop
                            {
                                return Ok(StreamOutcome { text: accumulated, token_count, citations, partial: false });
                            }
                        }
                    }
                    Some(Err(e)) => {
                        if accumulated.is_empty() {
                            return Err(RaceError::FullStream { arm: self.name.clone(), message: format!("stream error: {e}") });
                        }
                        return Ok(StreamOutcome { text: accumulated, token_count, citations, partial: true });
                    }
                    None => break,
                },
            }
        }

        Ok(StreamOutcome { text: accumulated, token_count, citations, partial: false })
    }
}

// --- deterministic test fake ---

/// Replays a fixed sequence of events regardless of prompt. Used throughout
/// the test suite in place of live network calls.
pub struct ScriptedAgent {
    name: String,
    events: Vec<StreamEvent>,
    latency: Option<Duration>,
}

impl ScriptedAgent {
    pub fn new(name: impl Into<String>, events: Vec<StreamEvent>) -> Self {
        Self {
            name: name.into(),
            events,
            latency: None,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

#[async_trait]
impl StreamingAgent for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run_streamed(
        &self,
        _prompt: &str,
        opts: &StreamOptions,
    ) -> Result<StreamOutcome, RaceError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut accumulated = String::new();
        let mut token_count = 0usize;
        let mut citations = Vec::new();

        for event in &self.events {
            if let Some(token) = opts.cancellation_token.as_ref()
                && token.is_cancelled()
            {
                return Ok(StreamOutcome { text: accumulated, token_count, citations, partial: true });
            }
            match event {
                StreamEvent::TextDelta(text) => {
                    token_count += count_tokens(text);
                    accumulated.push_str(text);
                    if let Some(stop) = opts.stop_after_tokens
                        && token_count >= stop
                    {
                        return Ok(StreamOutcome { text: accumulated, token_count, citations, partial: false });
                    }
                }
                StreamEvent::SearchResults(items) => citations.extend(items.iter().cloned()),
                StreamEvent::Annotation(item) => citations.push(item.clone()),
            }
        }

        Ok(StreamOutcome { text: accumulated, token_count, citations, partial: false })
    }
}

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use crate::error::RaceError;
use crate::features::EmbeddingProvider;
use crate::streaming::HttpAgent;
use crate::types::{RaceTuning, Strategy};

/// Which feature family the router sees. `Embedding` additionally requires
/// `EMBEDDING_DIM` and a provider capable of producing query embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanditFeatures {
    Length,
    Embedding,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum StrategyArg {
    Baseline,
    Bandit,
}

impl From<StrategyArg> for Strategy {
    fn from(s: StrategyArg) -> Self {
        match s {
            StrategyArg::Baseline => Strategy::Baseline,
            StrategyArg::Bandit => Strategy::Bandit,
        }
    }
}

/// CLI flags, one per tunable knob. Anything left `None` falls back to the
/// env-driven default in [`RaceTuning::default`].
#[derive(Debug, Parser)]
#[command(name = "riptide", about = "Race candidate agents, judge the previews, answer with the winner")]
pub struct Cli {
    /// The user query to race.
    pub query: String,

    /// Model used to judge previews.
    #[arg(long, default_value = "gpt-5")]
    pub judge_model: String,

    /// Candidate agent names to race (must be configured via env API keys).
    #[arg(long = "candidate", value_delimiter = ',')]
    pub candidates: Vec<String>,

    #[arg(long)]
    pub min_preview_tokens: Option<usize>,

    #[arg(long, value_enum, default_value = "baseline")]
    pub strategy: StrategyArg,

    #[arg(long)]
    pub bandit_alpha: Option<f64>,

    #[arg(long)]
    pub bandit_lambda: Option<f64>,

    #[arg(long)]
    pub state_path: Option<PathBuf>,

    #[arg(long)]
    pub length_threshold: Option<f64>,

    #[arg(long)]
    pub reward_weight_quality: Option<f64>,

    #[arg(long)]
    pub reward_weight_latency: Option<f64>,

    #[arg(long)]
    pub reward_weight_cost: Option<f64>,

    #[arg(long)]
    pub fallback_penalty: Option<f64>,

    #[arg(long)]
    pub adaptive_min_scale: Option<f64>,

    #[arg(long)]
    pub adaptive_max_scale: Option<f64>,

    #[arg(long)]
    pub latency_bias_scale: Option<f64>,

    #[arg(long)]
    pub speculative_min_query_length: Option<usize>,

    #[arg(long)]
    pub speculative_top_k: Option<usize>,

    #[arg(long)]
    pub max_total_preview_tokens: Option<usize>,

    #[arg(long)]
    pub max_total_full_tokens: Option<usize>,

    #[arg(long)]
    pub max_total_cost_usd: Option<f64>,

    /// Exercise the race with `ScriptedAgent` candidates instead of live HTTP calls.
    #[arg(long)]
    pub fake: bool,
}

/// Process-wide configuration: candidate agents wired from provider API keys,
/// plus tuning knobs merged from the environment and CLI overrides.
pub struct Config {
    pub agents: HashMap<String, Arc<HttpAgent>>,
    pub tuning: RaceTuning,
    pub bandit_features: BanditFeatures,
    pub embedding_model: String,
    pub embedding_dim: usize,
    pub redis_url: Option<String>,
    pub router_metrics_path: PathBuf,
    pub router_state_key: String,
    pub price_table: Option<HashMap<String, f64>>,
    /// `Some` only when `BANDIT_FEATURES=embedding` *and* an API key capable
    /// of producing embeddings is configured; `None` means the router falls
    /// back to length features regardless of what `bandit_features` says.
    pub embedding_provider: Option<EmbeddingProvider>,
}

impl Config {
    pub fn from_env(cli: &Cli) -> Result<Self, RaceError> {
        let mut agents: HashMap<String, Arc<HttpAgent>> = HashMap::new();

        if let Ok(key) = env::var("XAI_API_KEY") {
            agents.insert(
                "grok-4-1-fast-reasoning".to_string(),
                Arc::new(HttpAgent::new(
                    "grok-4-1-fast-reasoning",
                    "grok-4-1-fast-reasoning",
                    "https://api.x.ai/v1/chat/completions",
                    key,
                )),
            );
        } else {
            tracing::warn!("XAI_API_KEY not set — grok candidate unavailable");
        }

        if let Ok(key) = env::var("OPENROUTER_API_KEY") {
            let base_url = "https://openrouter.ai/api/v1/chat/completions";
            agents.insert(
                "moonshotai/kimi-k2.5".to_string(),
                Arc::new(HttpAgent::new("moonshotai/kimi-k2.5", "moonshotai/kimi-k2.5", base_url, key.clone())),
            );
            agents.insert(
                "z-ai/glm-5".to_string(),
                Arc::new(HttpAgent::new("z-ai/glm-5", "z-ai/glm-5", base_url, key)),
            );
        } else {
            tracing::warn!("OPENROUTER_API_KEY not set — openrouter candidates unavailable");
        }

        if let Ok(key) = env::var("DEEPSEEK_API_KEY") {
            agents.insert(
                "deepseek-r1".to_string(),
                Arc::new(HttpAgent::new("deepseek-r1", "deepseek-reasoner", "https://api.deepseek.com/chat/completions", key)),
            );
        } else {
            tracing::warn!("DEEPSEEK_API_KEY not set — deepseek candidate unavailable");
        }

        if let Ok(key) = env::var("OPENAI_API_KEY") {
            agents.insert(
                "gpt-5".to_string(),
                Arc::new(HttpAgent::new("gpt-5", "gpt-5", "https://api.openai.com/v1/chat/completions", key)),
            );
        } else {
            tracing::warn!("OPENAI_API_KEY not set — gpt-5 candidate/judge unavailable");
        }

        if let Ok(key) = env::var("MISTRAL_API_KEY") {
            agents.insert(
                "mistral-large".to_string(),
                Arc::new(HttpAgent::new("mistral-large", "mistral-large-latest", "https://api.mistral.ai/v1/chat/completions", key)),
            );
        } else {
            tracing::warn!("MISTRAL_API_KEY not set — mistral candidate unavailable");
        }

        if let Ok(key) = env::var("TOGETHER_API_KEY") {
            agents.insert(
                "qwen-3.5".to_string(),
                Arc::new(HttpAgent::new("qwen-3.5", "Qwen/Qwen3.5-72B", "https://api.together.xyz/v1/chat/completions", key)),
            );
        } else {
            tracing::warn!("TOGETHER_API_KEY not set — qwen candidate unavailable");
        }

        if agents.is_empty() && !cli.fake {
            tracing::error!("no candidate agents configured — set at least one provider API key or pass --fake");
        }

        let bandit_features = match env::var("BANDIT_FEATURES").as_deref() {
            Ok("embedding") => BanditFeatures::Embedding,
            _ => BanditFeatures::Length,
        };
        let embedding_model = env::var("EMBEDDING_MODEL").unwrap_or_else(|_| "text-embedding-3-small".to_string());
        let embedding_dim: usize = env::var("EMBEDDING_DIM").ok().and_then(|v| v.parse().ok()).unwrap_or(24);
        let redis_url = env::var("REDIS_URL").ok();
        let router_metrics_path = env::var("ROUTER_METRICS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".router_metrics.json"));
        let router_state_key = env::var("ROUTER_STATE_KEY").unwrap_or_else(|_| "router_state".to_string());

        let price_table = env::var("MODEL_PRICE_USD_PER_TOKEN_JSON")
            .ok()
            .and_then(|raw| serde_json::from_str::<HashMap<String, f64>>(&raw).ok());

        let embedding_provider = match (bandit_features, env::var("OPENAI_API_KEY")) {
            (BanditFeatures::Embedding, Ok(key)) => Some(EmbeddingProvider::new(embedding_model.clone(), key, embedding_dim)),
            (BanditFeatures::Embedding, Err(_)) => {
                tracing::warn!("BANDIT_FEATURES=embedding requires OPENAI_API_KEY; falling back to length features");
                None
            }
            (BanditFeatures::Length, _) => None,
        };

        let mut tuning = RaceTuning {
            strategy: cli.strategy.into(),
            ..RaceTuning::default()
        };
        if let Some(v) = cli.min_preview_tokens {
            tuning.min_preview_tokens = v;
        }
        if let Some(v) = cli.bandit_alpha {
            tuning.bandit_alpha = v;
        }
        if let Some(v) = cli.bandit_lambda {
            tuning.bandit_lambda = v;
        }
        tuning.router_state_path = cli.state_path.clone();
        if let Some(v) = cli.length_threshold {
            tuning.length_threshold = v;
        }
        if let Some(v) = cli.reward_weight_quality {
            tuning.reward_weight_quality = v;
        }
        if let Some(v) = cli.reward_weight_latency {
            tuning.reward_weight_latency = v;
        }
        if let Some(v) = cli.reward_weight_cost {
            tuning.reward_weight_cost = v;
        }
        if let Some(v) = cli.fallback_penalty {
            tuning.fallback_penalty = v;
        }
        if let Some(v) = cli.adaptive_min_scale {
            tuning.adaptive_min_scale = v;
        }
        if let Some(v) = cli.adaptive_max_scale {
            tuning.adaptive_max_scale = v;
        }
        if let Some(v) = cli.latency_bias_scale {
            tuning.latency_bias_scale = v;
        }
        if let Some(v) = cli.speculative_min_query_length {
            tuning.speculative_min_query_length = v;
        }
        if let Ok(raw) = env::var("SPECULATIVE_TOP_K") {
            if let Ok(v) = raw.parse() {
                tuning.speculative_top_k = v;
            }
        }
        if let Some(v) = cli.speculative_top_k {
            tuning.speculative_top_k = v;
        }
        tuning.max_total_preview_tokens = cli.max_total_preview_tokens;
        tuning.max_total_full_tokens = cli.max_total_full_tokens;
        tuning.max_total_cost_usd = cli.max_total_cost_usd;
        if let Ok(raw) = env::var("PREVIEW_CACHE_TTL") {
            if let Ok(v) = raw.parse() {
                tuning.preview_cache_ttl_s = v;
            }
        }
        if tuning.speculative_top_k < 2 {
            return Err(RaceError::Config("speculative_top_k must be >= 2".into()));
        }

        Ok(Self {
            agents,
            tuning,
            bandit_features,
            embedding_model,
            embedding_dim,
            redis_url,
            router_metrics_path,
            router_state_key,
            price_table,
            embedding_provider,
        })
    }

    /// The K/V key the router state is mirrored under, keyed by the
    /// dimensionality of whatever feature vector this run's bandit uses.
    pub fn router_state_kv_key(&self, d: usize) -> String {
        format!("{}:d{d}", self.router_state_key)
    }
}

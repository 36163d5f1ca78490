use serde::{Deserialize, Serialize};

/// An LLM identifier known to the router and the streaming driver.
pub type Arm = String;

/// A short bounded preview produced by one candidate before the full answer.
#[derive(Debug, Clone, Serialize)]
pub struct PreviewOutcome {
    pub name: Arm,
    pub text: String,
    pub tokens: usize,
    pub latency_s: Option<f64>,
}

/// Per-candidate judge score, all fields clamped to [0, 1].
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct JudgeScores {
    pub index: usize,
    #[serde(default)]
    pub relevance: f64,
    #[serde(default)]
    pub coverage: f64,
    #[serde(default)]
    pub faithfulness: f64,
    #[serde(default)]
    pub overall: f64,
}

/// The judge's full verdict over a set of previews.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JudgeVerdict {
    pub winner_index: usize,
    #[serde(default)]
    pub scores: Vec<JudgeScores>,
}

/// A citation surfaced by a candidate's streamed output.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, Hash)]
pub struct Citation {
    pub title: String,
    pub url: String,
}

/// Per-run debug payload returned alongside the winning candidate.
#[derive(Debug, Clone, Serialize)]
pub struct RaceDebug {
    pub strategy: String,
    pub judge_model: String,
    pub previews: Vec<PreviewOutcome>,
    pub verdict: Option<JudgeVerdict>,
    pub failed_full_indices: Vec<usize>,
    pub full_tokens: usize,
    pub citations: Vec<Citation>,
    pub latencies_s: Vec<Option<f64>>,
}

/// Outcome of a completed race.
#[derive(Debug, Clone, Serialize)]
pub struct RaceResult {
    pub winner_index: usize,
    pub winner_name: Arm,
    pub answer: String,
    pub debug: RaceDebug,
}

/// Caller-supplied knobs that tune a single race invocation.
#[derive(Debug, Clone)]
pub struct RaceTuning {
    pub strategy: Strategy,
    pub min_preview_tokens: usize,
    pub bandit_alpha: f64,
    pub bandit_lambda: f64,
    pub router_state_path: Option<std::path::PathBuf>,
    pub length_threshold: f64,
    pub reward_weight_quality: f64,
    pub reward_weight_latency: f64,
    pub reward_weight_cost: f64,
    pub fallback_penalty: f64,
    pub adaptive_min_scale: f64,
    pub adaptive_max_scale: f64,
    pub latency_bias_scale: f64,
    pub speculative_min_query_length: usize,
    pub speculative_top_k: usize,
    pub preview_timeout_s: Option<f64>,
    pub full_timeout_s: Option<f64>,
    pub preview_cache_ttl_s: u64,
    /// Best-effort global ceilings for a single race. Once exceeded, the
    /// full-answer fallback stops trying further candidates (any attempt
    /// already in flight is allowed to finish); `None` means unbounded.
    pub max_total_preview_tokens: Option<usize>,
    pub max_total_full_tokens: Option<usize>,
    pub max_total_cost_usd: Option<f64>,
}

impl Default for RaceTuning {
    fn default() -> Self {
        Self {
            strategy: Strategy::Baseline,
            min_preview_tokens: 64,
            bandit_alpha: 1.0,
            bandit_lambda: 1e-2,
            router_state_path: None,
            length_threshold: 400.0,
            reward_weight_quality: 0.6,
            reward_weight_latency: 0.25,
            reward_weight_cost: 0.15,
            fallback_penalty: 0.2,
            adaptive_min_scale: 1.0,
            adaptive_max_scale: 2.5,
            latency_bias_scale: 0.1,
            speculative_min_query_length: 200,
            speculative_top_k: 2,
            preview_timeout_s: Some(20.0),
            full_timeout_s: None,
            preview_cache_ttl_s: 600,
            max_total_preview_tokens: None,
            max_total_full_tokens: None,
            max_total_cost_usd: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Baseline,
    Bandit,
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "baseline" => Ok(Self::Baseline),
            "bandit" => Ok(Self::Bandit),
            other => Err(format!("unknown strategy: {other}")),
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Baseline => write!(f, "baseline"),
            Self::Bandit => write!(f, "bandit"),
        }
    }
}

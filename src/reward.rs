use std::collections::{HashMap, HashSet};

/// Reward weights for the quality/latency/cost blend. Each in `[0,1]`;
/// normalized internally so they need not sum to exactly 1.
#[derive(Debug, Clone, Copy)]
pub struct RewardWeights {
    pub quality: f64,
    pub latency: f64,
    pub cost: f64,
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self { quality: 0.6, latency: 0.2, cost: 0.2 }
    }
}

/// One candidate's inputs to the reward computation.
pub struct CandidateReward<'a> {
    pub model: &'a str,
    pub quality: f64,
    pub p95_latency_s: Option<f64>,
    pub preview_tokens: usize,
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// Normalizes a p95 latency against a query-length-scaled ceiling, used both
/// to bias bandit selection toward faster arms and as the reward's latency term.
pub fn latency_norm(query_len: usize, p95_s: f64, length_threshold: f64) -> f64 {
    let length_threshold = length_threshold.max(1.0);
    let scale = 3.0 + 3.0 * clamp01(query_len as f64 / length_threshold);
    clamp01(p95_s / scale)
}

fn cost_term(
    model: &str,
    preview_tokens: usize,
    min_preview_tokens: usize,
    price_table: Option<&HashMap<String, f64>>,
) -> f64 {
    let min_preview_tokens = min_preview_tokens.max(1);
    match price_table.and_then(|t| t.get(model)) {
        Some(&price) => {
            let est_cost = price * preview_tokens as f64;
            let baseline = price * min_preview_tokens as f64;
            if baseline <= 0.0 {
                1.0
            } else {
                1.0 - clamp01(est_cost / baseline)
            }
        }
        None => 1.0 - clamp01(preview_tokens as f64 / min_preview_tokens as f64),
    }
}

/// Compose a `{model: reward}` map for a race. `failed_full_indices` marks
/// candidates whose full-answer stream failed (speculative loss of a fallback
/// race): their reward is penalized, clamped to stay non-negative.
pub fn compute_rewards(
    candidates: &[CandidateReward],
    query_len: usize,
    length_threshold: f64,
    weights: RewardWeights,
    min_preview_tokens: usize,
    price_table: Option<&HashMap<String, f64>>,
    failed_full_indices: &HashSet<usize>,
    fallback_penalty: f64,
) -> HashMap<String, f64> {
    let mut out = HashMap::with_capacity(candidates.len());

    let total_weight = (weights.quality + weights.latency + weights.cost).max(1e-9);
    let wq = weights.quality / total_weight;
    let wl = weights.latency / total_weight;
    let wc = weights.cost / total_weight;

    for (i, c) in candidates.iter().enumerate() {
        let quality = clamp01(c.quality);
        let latency = match c.p95_latency_s {
            Some(p95) => 1.0 - latency_norm(query_len, p95, length_threshold),
            None => 0.5,
        };
        let cost = cost_term(c.model, c.preview_tokens, min_preview_tokens, price_table);

        let mut r = clamp01(wq * quality + wl * latency + wc * cost);
        if failed_full_indices.contains(&i) {
            r = (r - fallback_penalty).max(0.0);
        }
        out.insert(c.model.to_string(), r);
    }

    out
}

/// Estimated USD cost for `tokens` generated by `model`, per the price table.
/// Used for `max_total_cost_usd` budget checks in the orchestrator.
pub fn estimate_token_cost_usd(model: &str, tokens: usize, price_table: &HashMap<String, f64>) -> f64 {
    price_table.get(model).copied().unwrap_or(0.0) * tokens as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_p95_defaults_to_half_latency_score() {
        let candidates = vec![CandidateReward { model: "gpt", quality: 1.0, p95_latency_s: None, preview_tokens: 100 }];
        let rewards = compute_rewards(
            &candidates,
            50,
            2000.0,
            RewardWeights { quality: 0.0, latency: 1.0, cost: 0.0 },
            100,
            None,
            &HashSet::new(),
            0.2,
        );
        assert!((rewards["gpt"] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn fallback_penalty_reduces_reward_but_not_below_zero() {
        let candidates = vec![CandidateReward { model: "gpt", quality: 0.1, p95_latency_s: None, preview_tokens: 100 }];
        let mut failed = HashSet::new();
        failed.insert(0);
        let rewards = compute_rewards(
            &candidates,
            50,
            2000.0,
            RewardWeights { quality: 1.0, latency: 0.0, cost: 0.0 },
            100,
            None,
            &failed,
            0.9,
        );
        assert_eq!(rewards["gpt"], 0.0);
    }

    #[test]
    fn higher_preview_tokens_costs_more_without_price_table() {
        let candidates = vec![
            CandidateReward { model: "cheap", quality: 0.0, p95_latency_s: None, preview_tokens: 50 },
            CandidateReward { model: "expensive", quality: 0.0, p95_latency_s: None, preview_tokens: 200 },
        ];
        let rewards = compute_rewards(
            &candidates,
            50,
            2000.0,
            RewardWeights { quality: 0.0, latency: 0.0, cost: 1.0 },
            100,
            None,
            &HashSet::new(),
            0.2,
        );
        assert!(rewards["cheap"] > rewards["expensive"]);
    }

    #[test]
    fn price_table_scales_cost_relative_to_baseline() {
        let mut prices = HashMap::new();
        prices.insert("gpt".to_string(), 0.00002);
        let candidates = vec![CandidateReward { model: "gpt", quality: 0.0, p95_latency_s: None, preview_tokens: 100 }];
        let rewards = compute_rewards(
            &candidates,
            50,
            2000.0,
            RewardWeights { quality: 0.0, latency: 0.0, cost: 1.0 },
            100,
            Some(&prices),
            &HashSet::new(),
            0.2,
        );
        // preview_tokens == min_preview_tokens -> est_cost == baseline -> cost term 0
        assert!((rewards["gpt"]).abs() < 1e-9);
    }

    #[test]
    fn non_unit_sum_weights_are_normalized_before_blending() {
        // quality=1.0 throughout; weights scaled 2x from a unit-sum triple
        // should produce the same reward as the unscaled triple.
        let candidates = vec![CandidateReward { model: "gpt", quality: 1.0, p95_latency_s: None, preview_tokens: 100 }];
        let unit = compute_rewards(
            &candidates,
            50,
            2000.0,
            RewardWeights { quality: 0.6, latency: 0.2, cost: 0.2 },
            100,
            None,
            &HashSet::new(),
            0.2,
        );
        let scaled = compute_rewards(
            &candidates,
            50,
            2000.0,
            RewardWeights { quality: 1.2, latency: 0.4, cost: 0.4 },
            100,
            None,
            &HashSet::new(),
            0.2,
        );
        assert!((unit["gpt"] - scaled["gpt"]).abs() < 1e-9);
    }

    #[test]
    fn estimate_cost_is_zero_for_unknown_model() {
        let prices = HashMap::new();
        assert_eq!(estimate_token_cost_usd("unknown", 1000, &prices), 0.0);
    }
}

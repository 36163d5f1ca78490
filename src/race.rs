use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::citations;
use crate::error::RaceError;
use crate::features::{self, EmbeddingProvider};
use crate::judge;
use crate::metrics::{LatencyTracker, PreviewCache, cache_key};
use crate::reward::{self, CandidateReward, RewardWeights};
use crate::router::Router;
use crate::streaming::{self, StreamOptions, StreamOutcome, StreamingAgent};
use crate::types::{Arm, PreviewOutcome, RaceDebug, RaceResult, RaceTuning, Strategy};

/// One candidate agent entered into a race: its arm name and streaming transport.
pub struct Candidate {
    pub name: Arm,
    pub agent: Arc<dyn StreamingAgent>,
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// Running tally of full-answer token/cost spend for one race, checked
/// between sequential attempts. Best-effort: an attempt already in flight
/// always finishes, and the very first attempt always runs regardless of
/// budget so a race never fails purely because the caller set a tiny ceiling.
struct FullStageBudget<'a> {
    max_tokens: Option<usize>,
    max_cost_usd: Option<f64>,
    price_table: Option<&'a HashMap<String, f64>>,
    tokens_used: usize,
    cost_used: f64,
    attempts: usize,
}

impl<'a> FullStageBudget<'a> {
    fn new(tuning: &RaceTuning, price_table: Option<&'a HashMap<String, f64>>) -> Self {
        Self {
            max_tokens: tuning.max_total_full_tokens,
            max_cost_usd: tuning.max_total_cost_usd,
            price_table,
            tokens_used: 0,
            cost_used: 0.0,
            attempts: 0,
        }
    }

    /// Whether a further attempt should be skipped. Always `false` before the
    /// first attempt so at least one candidate is always tried.
    fn exhausted(&self) -> bool {
        if self.attempts == 0 {
            return false;
        }
        let over_tokens = self.max_tokens.is_some_and(|limit| self.tokens_used > limit);
        let over_cost = self.max_cost_usd.is_some_and(|limit| self.cost_used > limit);
        over_tokens || over_cost
    }

    fn record(&mut self, model: &str, tokens: usize) {
        self.attempts += 1;
        self.tokens_used += tokens;
        if let Some(table) = self.price_table {
            self.cost_used += reward::estimate_token_cost_usd(model, tokens, table);
        }
    }
}

/// Race `candidates` through a short preview stage, judge them, and run a
/// full-answer stage (speculative top-k or sequential fallback) to produce a
/// winning answer. If `tuning.strategy` is `Bandit`, `router` must be `Some`
/// and is updated with the observed reward after the race completes.
#[allow(clippy::too_many_arguments)]
pub async fn race(
    query: &str,
    judge_agent: &dyn StreamingAgent,
    candidates: &[Candidate],
    tuning: &RaceTuning,
    router: Option<&Router>,
    latency_tracker: &LatencyTracker,
    preview_cache: Option<Arc<dyn PreviewCache>>,
    price_table: Option<&HashMap<String, f64>>,
    embedding_provider: Option<&EmbeddingProvider>,
) -> Result<RaceResult, RaceError> {
    if candidates.is_empty() {
        return Err(RaceError::Config("at least one candidate is required".into()));
    }

    // --- 1. Feature/selection ---
    let x = match embedding_provider {
        Some(provider) => match provider.embed(query).await {
            Ok(embedding) => features::compute_features(query, Some(&embedding), provider.dim()),
            Err(e) => {
                tracing::warn!("embedding fetch failed, falling back to length features: {e}");
                features::compute_features(query, None, 0)
            }
        },
        None => features::compute_features(query, None, 0),
    };
    let order_names: Vec<Arm> = if tuning.strategy == Strategy::Bandit {
        let Some(router) = router else {
            return Err(RaceError::Config("bandit strategy requires a router".into()));
        };
        let arms: Vec<Arm> = candidates.iter().map(|c| c.name.clone()).collect();
        let mut arm_bias = HashMap::new();
        for arm in &arms {
            if let Some(p95) = latency_tracker.p95(arm).await {
                let norm = reward::latency_norm(query.len(), p95, tuning.length_threshold);
                arm_bias.insert(arm.clone(), -tuning.latency_bias_scale * norm);
            }
        }
        router.select(&x, &arms, arms.len(), Some(&arm_bias)).await?
    } else {
        candidates.iter().map(|c| c.name.clone()).collect()
    };

    let ordered: Vec<&Candidate> = order_names
        .iter()
        .filter_map(|name| candidates.iter().find(|c| &c.name == name))
        .collect();
    let n = ordered.len();

    // --- 2. Adaptive preview budget ---
    let len_norm = clamp01(query.len() as f64 / tuning.length_threshold.max(1.0));
    let scale = tuning.adaptive_min_scale + (tuning.adaptive_max_scale - tuning.adaptive_min_scale) * len_norm;
    let adaptive_min_tokens = ((tuning.min_preview_tokens as f64) * scale).round().max(1.0) as usize;

    // --- 3. Parallel previews (cache-checked, then raced) ---
    let mut preview_outcomes: Vec<Option<PreviewOutcome>> = vec![None; n];
    let mut preview_set = JoinSet::new();

    for (idx, candidate) in ordered.iter().enumerate() {
        let key = cache_key(&candidate.name, adaptive_min_tokens, query);
        if let Some(cache) = &preview_cache
            && let Some((tokens, text)) = cache.get(&key).await
        {
            preview_outcomes[idx] =
                Some(PreviewOutcome { name: candidate.name.clone(), text, tokens, latency_s: None });
            continue;
        }

        let agent = candidate.agent.clone();
        let name = candidate.name.clone();
        let query = query.to_string();
        let timeout_s = tuning.preview_timeout_s;
        preview_set.spawn(async move {
            let start = Instant::now();
            let opts = StreamOptions {
                stop_after_tokens: Some(adaptive_min_tokens),
                timeout_s,
                cancellation_token: None,
            };
            let result = streaming::stream(agent.as_ref(), &query, opts).await;
            (idx, name, key, result, start.elapsed().as_secs_f64())
        });
    }

    while let Some(joined) = preview_set.join_next().await {
        let Ok((idx, name, key, result, elapsed)) = joined else {
            tracing::warn!("preview task panicked");
            continue;
        };
        match result {
            Ok(outcome) => {
                latency_tracker.record(&name, elapsed).await;
                if let Some(cache) = &preview_cache {
                    cache.setex(&key, tuning.preview_cache_ttl_s, outcome.token_count, outcome.text.clone()).await;
                }
                preview_outcomes[idx] =
                    Some(PreviewOutcome { name, text: outcome.text, tokens: outcome.token_count, latency_s: Some(elapsed) });
            }
            Err(e) => {
                tracing::warn!(arm = %name, "preview stream failed: {e}");
                preview_outcomes[idx] = Some(PreviewOutcome { name, text: String::new(), tokens: 0, latency_s: None });
            }
        }
    }

    let previews: Vec<PreviewOutcome> = preview_outcomes
        .into_iter()
        .enumerate()
        .map(|(i, o)| o.unwrap_or_else(|| PreviewOutcome { name: ordered[i].name.clone(), text: String::new(), tokens: 0, latency_s: None }))
        .collect();

    // --- 4. Judging ---
    let verdict = judge::judge_previews(judge_agent, query, &previews).await?;
    let candidate_order = judge::compute_candidate_order(&verdict, n);

    // --- 5. Full-answer stage ---
    let preview_tokens_used: usize = previews.iter().map(|p| p.tokens).sum();
    if let Some(limit) = tuning.max_total_preview_tokens
        && preview_tokens_used > limit
    {
        tracing::warn!(used = preview_tokens_used, limit, "preview token budget exceeded");
    }

    let mut failed_full_indices: HashSet<usize> = HashSet::new();
    let mut budget = FullStageBudget::new(tuning, price_table);
    let (winner_pos, winner_outcome) =
        if query.len() >= tuning.speculative_min_query_length && candidate_order.len() >= 2 {
            run_speculative(&ordered, &candidate_order, query, tuning, &mut failed_full_indices, &mut budget).await?
        } else {
            run_sequential(&ordered, &candidate_order, query, tuning, &mut failed_full_indices, &mut budget).await?
        };

    // --- 6. Reward emission (bandit only) ---
    if tuning.strategy == Strategy::Bandit
        && let Some(router) = router
    {
        let mut p95_by_arm = HashMap::with_capacity(n);
        for p in &previews {
            p95_by_arm.insert(p.name.clone(), latency_tracker.p95(&p.name).await);
        }
        let candidate_rewards: Vec<CandidateReward> = previews
            .iter()
            .enumerate()
            .map(|(i, p)| CandidateReward {
                model: &p.name,
                quality: verdict.scores.iter().find(|s| s.index == i).map(|s| s.overall).unwrap_or(0.0),
                p95_latency_s: p95_by_arm.get(&p.name).copied().flatten(),
                preview_tokens: p.tokens,
            })
            .collect();
        let weights = RewardWeights {
            quality: tuning.reward_weight_quality,
            latency: tuning.reward_weight_latency,
            cost: tuning.reward_weight_cost,
        };
        let rewards = reward::compute_rewards(
            &candidate_rewards,
            query.len(),
            tuning.length_threshold,
            weights,
            tuning.min_preview_tokens,
            price_table,
            &failed_full_indices,
            tuning.fallback_penalty,
        );
        router.bulk_update(&x, &rewards).await;
    }

    // --- 7. Citations ---
    let mut text_sources: Vec<&str> = previews.iter().map(|p| p.text.as_str()).collect();
    text_sources.push(winner_outcome.text.as_str());
    let item_sources = [winner_outcome.citations.as_slice()];
    let citations = citations::merge_citations(&text_sources, &item_sources);

    // --- 8. Return ---
    let mut failed_sorted: Vec<usize> = failed_full_indices.into_iter().collect();
    failed_sorted.sort_unstable();

    let debug = RaceDebug {
        strategy: tuning.strategy.to_string(),
        judge_model: judge_agent.name().to_string(),
        previews: previews.clone(),
        verdict: Some(verdict),
        failed_full_indices: failed_sorted,
        full_tokens: winner_outcome.token_count,
        citations,
        latencies_s: previews.iter().map(|p| p.latency_s).collect(),
    };

    Ok(RaceResult {
        winner_index: winner_pos,
        winner_name: previews[winner_pos].name.clone(),
        answer: winner_outcome.text,
        debug,
    })
}

/// Launch the top-k full-answer streams concurrently; the first success wins
/// and siblings are cancelled. If every top-k candidate fails, falls back to
/// sequential traversal of the remaining order.
async fn run_speculative(
    ordered: &[&Candidate],
    order: &[usize],
    query: &str,
    tuning: &RaceTuning,
    failed: &mut HashSet<usize>,
    budget: &mut FullStageBudget<'_>,
) -> Result<(usize, StreamOutcome), RaceError> {
    let top_k = tuning.speculative_top_k.max(2).min(order.len());
    let cancel = CancellationToken::new();
    let mut set = JoinSet::new();

    for &pos in &order[..top_k] {
        let agent = ordered[pos].agent.clone();
        let query = query.to_string();
        let token = cancel.clone();
        let timeout_s = tuning.full_timeout_s;
        set.spawn(async move {
            let opts = StreamOptions { stop_after_tokens: None, timeout_s, cancellation_token: Some(token) };
            let result = streaming::stream(agent.as_ref(), &query, opts).await;
            (pos, result)
        });
    }

    let mut winner = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((pos, Ok(outcome))) if !outcome.text.is_empty() => {
                budget.record(&ordered[pos].name, outcome.token_count);
                winner = Some((pos, outcome));
                cancel.cancel();
                break;
            }
            Ok((pos, Ok(outcome))) => {
                budget.record(&ordered[pos].name, outcome.token_count);
                failed.insert(pos);
            }
            Ok((pos, Err(e))) => {
                tracing::warn!(arm = %ordered[pos].name, "speculative full stream failed: {e}");
                failed.insert(pos);
            }
            Err(e) => {
                tracing::warn!("speculative full task panicked: {e}");
            }
        }
    }
    // drain stragglers cancelled above
    while set.join_next().await.is_some() {}

    match winner {
        Some(result) => Ok(result),
        None => {
            let remaining: Vec<usize> = order[top_k..].to_vec();
            if remaining.is_empty() {
                return Err(RaceError::AllFullFailed(order.len()));
            }
            run_sequential(ordered, &remaining, query, tuning, failed, budget).await
        }
    }
}

/// Traverse `order` sequentially; the first successful full stream wins.
/// Once `budget` is exhausted by a prior attempt, remaining candidates are
/// skipped (marked failed) rather than attempted — the first candidate in
/// `order` is always tried regardless of budget.
async fn run_sequential(
    ordered: &[&Candidate],
    order: &[usize],
    query: &str,
    tuning: &RaceTuning,
    failed: &mut HashSet<usize>,
    budget: &mut FullStageBudget<'_>,
) -> Result<(usize, StreamOutcome), RaceError> {
    for &pos in order {
        let candidate = ordered[pos];
        if budget.exhausted() {
            tracing::warn!(arm = %candidate.name, "full-answer budget exhausted, skipping remaining candidates");
            failed.insert(pos);
            continue;
        }
        let opts = StreamOptions { stop_after_tokens: None, timeout_s: tuning.full_timeout_s, cancellation_token: None };
        match streaming::stream(candidate.agent.as_ref(), query, opts).await {
            Ok(outcome) if !outcome.text.is_empty() => {
                budget.record(&candidate.name, outcome.token_count);
                return Ok((pos, outcome));
            }
            Ok(outcome) => {
                budget.record(&candidate.name, outcome.token_count);
                failed.insert(pos);
            }
            Err(e) => {
                tracing::warn!(arm = %candidate.name, "full stream failed: {e}");
                failed.insert(pos);
            }
        }
    }
    Err(RaceError::AllFullFailed(order.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::InMemoryPreviewCache;
    use crate::streaming::{ScriptedAgent, StreamEvent};
    use std::time::Duration;

    fn tuning() -> RaceTuning {
        RaceTuning {
            adaptive_min_scale: 1.0,
            adaptive_max_scale: 1.0,
            preview_timeout_s: Some(5.0),
            full_timeout_s: Some(5.0),
            ..Default::default()
        }
    }

    fn temp_tracker_path(label: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("riptide-race-test-{label}-{}.json", std::process::id()))
    }

    fn scripted(name: &str, text: &str) -> Candidate {
        Candidate {
            name: name.to_string(),
            agent: Arc::new(ScriptedAgent::new(name, vec![StreamEvent::TextDelta(text.to_string())])),
        }
    }

    fn judge_always(winner: usize, n: usize) -> ScriptedAgent {
        let scores: Vec<serde_json::Value> = (0..n)
            .map(|i| {
                let overall = if i == winner { 0.9 } else { 0.3 };
                serde_json::json!({"index": i, "relevance": overall, "coverage": overall, "faithfulness": overall, "overall": overall})
            })
            .collect();
        let verdict = serde_json::json!({"winner_index": winner, "scores": scores}).to_string();
        ScriptedAgent::new("judge", vec![StreamEvent::TextDelta(verdict)])
    }

    #[tokio::test]
    async fn baseline_two_arm_race_picks_judged_winner() {
        let candidates = vec![scripted("a", "short answer a"), scripted("b", "short answer b, the better one")];
        let judge = judge_always(1, 2);
        let latency_tracker = LatencyTracker::load(temp_tracker_path("baseline")).await;

        let result = race(
            "what is the weather",
            &judge,
            &candidates,
            &tuning(),
            None,
            &latency_tracker,
            None,
            None,
            None,
        )
        .await
        .unwrap();

        assert_eq!(result.winner_name, "b");
        assert!(result.answer.contains("better"));
    }

    /// Produces a short preview but an empty, token-heavy full answer —
    /// stands in for a generation that burned a lot of budget before
    /// ultimately failing to produce usable text.
    struct ExpensiveFailAgent {
        name: String,
        tokens: usize,
    }

    #[async_trait::async_trait]
    impl StreamingAgent for ExpensiveFailAgent {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run_streamed(
            &self,
            _prompt: &str,
            opts: &StreamOptions,
        ) -> Result<StreamOutcome, RaceError> {
            if opts.stop_after_tokens.is_some() {
                return Ok(StreamOutcome { text: "a preview".to_string(), token_count: 2, citations: vec![], partial: false });
            }
            Ok(StreamOutcome { text: String::new(), token_count: self.tokens, citations: vec![], partial: false })
        }
    }

    #[tokio::test]
    async fn full_token_budget_skips_remaining_candidates_after_first_attempt() {
        let candidates = vec![
            Candidate {
                name: "expensive-fail".to_string(),
                agent: Arc::new(ExpensiveFailAgent { name: "expensive-fail".to_string(), tokens: 1000 }),
            },
            scripted("would-normally-win", "a perfectly good answer"),
        ];
        // Judge ranks "expensive-fail" first so it is tried before the
        // candidate that would otherwise have succeeded.
        let judge = judge_always(0, 2);
        let latency_tracker = LatencyTracker::load(temp_tracker_path("budget-skip")).await;
        let mut t = tuning();
        t.max_total_full_tokens = Some(500);

        let err = race("short query", &judge, &candidates, &t, None, &latency_tracker, None, None, None)
            .await
            .unwrap_err();

        assert!(matches!(err, RaceError::AllFullFailed(2)));
    }

    #[tokio::test]
    async fn all_full_failures_is_fatal() {
        let empty_agent = Arc::new(ScriptedAgent::new("a", vec![]));
        let candidates = vec![Candidate { name: "a".to_string(), agent: empty_agent }];
        let judge = judge_always(0, 1);
        let latency_tracker = LatencyTracker::load(temp_tracker_path("all-fail")).await;

        let err = race("hi", &judge, &candidates, &tuning(), None, &latency_tracker, None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RaceError::AllFullFailed(_)));
    }

    #[tokio::test]
    async fn preview_cache_hit_skips_stream_and_has_no_latency() {
        let cache: Arc<dyn PreviewCache> = Arc::new(InMemoryPreviewCache::new());
        let query = "cached query";
        let key = cache_key("a", 64, query);
        cache.setex(&key, 600, 3, "cached text".to_string()).await;

        let candidates = vec![scripted("a", "fresh text"), scripted("b", "fresh text from b, much longer")];
        let judge = judge_always(1, 2);
        let latency_tracker = LatencyTracker::load(temp_tracker_path("cache-hit")).await;

        let result = race(
            query,
            &judge,
            &candidates,
            &tuning(),
            None,
            &latency_tracker,
            Some(cache),
            None,
            None,
        )
        .await
        .unwrap();

        assert_eq!(result.debug.previews[0].text, "cached text");
        assert_eq!(result.debug.previews[0].latency_s, None);
    }

    #[tokio::test]
    async fn speculative_stage_picks_fastest_completion_not_judge_favorite() {
        // A query long enough to trigger the speculative top-k stage.
        let query = "x".repeat(250);
        let candidates = vec![
            Candidate {
                name: "slow-favorite".to_string(),
                agent: Arc::new(
                    ScriptedAgent::new("slow-favorite", vec![StreamEvent::TextDelta("slow but judged best".to_string())])
                        .with_latency(Duration::from_millis(60)),
                ),
            },
            Candidate {
                name: "fast-underdog".to_string(),
                agent: Arc::new(
                    ScriptedAgent::new("fast-underdog", vec![StreamEvent::TextDelta("fast answer".to_string())])
                        .with_latency(Duration::from_millis(1)),
                ),
            },
        ];
        // Judge prefers index 0 ("slow-favorite"), but the speculative race
        // takes whichever of the top-k finishes first.
        let judge = judge_always(0, 2);
        let latency_tracker = LatencyTracker::load(temp_tracker_path("speculative")).await;

        let result = race(&query, &judge, &candidates, &tuning(), None, &latency_tracker, None, None, None)
            .await
            .unwrap();

        assert_eq!(result.winner_name, "fast-underdog");
    }
}

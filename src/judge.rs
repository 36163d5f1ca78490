use crate::error::RaceError;
use crate::retry::JUDGE_RETRY;
use crate::streaming::{StreamOptions, StreamingAgent};
use crate::types::{JudgeScores, JudgeVerdict, PreviewOutcome};

/// Build the judge prompt: a JSON payload describing each candidate preview,
/// with instructions to emit strict JSON back.
fn build_prompt(query: &str, previews: &[PreviewOutcome]) -> String {
    let candidates: Vec<serde_json::Value> = previews
        .iter()
        .enumerate()
        .map(|(index, p)| {
            serde_json::json!({
                "index": index,
                "name": p.name,
                "preview": p.text,
            })
        })
        .collect();

    let payload = serde_json::json!({ "query": query, "candidates": candidates });

    format!(
        "You are judging {n} candidate previews for the query below. \
         Score each candidate's relevance, coverage, and faithfulness in [0, 1], \
         and an overall score in [0, 1]. Reply with strict JSON only: \
         {{\"winner_index\": <int>, \"scores\": [{{\"index\": <int>, \"relevance\": <f>, \
         \"coverage\": <f>, \"faithfulness\": <f>, \"overall\": <f>}}, ...]}}.\n\n{payload}",
        n = previews.len(),
    )
}

/// Extract a JSON object from `text`: first attempt a literal parse, then
/// fall back to the substring between the first `{` and the last `}`.
fn extract_json(text: &str) -> Result<serde_json::Value, serde_json::Error> {
    if let Ok(v) = serde_json::from_str(text) {
        return Ok(v);
    }
    let start = text.find('{');
    let end = text.rfind('}');
    match (start, end) {
        (Some(s), Some(e)) if e > s => serde_json::from_str(&text[s..=e]),
        _ => serde_json::from_str(text),
    }
}

fn validate(verdict: &JudgeVerdict, n: usize) -> Result<(), String> {
    if verdict.winner_index >= n {
        return Err(format!(
            "winner_index {} out of range for {n} candidates",
            verdict.winner_index
        ));
    }
    for s in &verdict.scores {
        if s.index >= n {
            return Err(format!("score index {} out of range for {n} candidates", s.index));
        }
        for (label, v) in [
            ("relevance", s.relevance),
            ("coverage", s.coverage),
            ("faithfulness", s.faithfulness),
            ("overall", s.overall),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(format!("{label} score {v} out of [0, 1] for candidate {}", s.index));
            }
        }
    }
    Ok(())
}

fn parse_verdict(text: &str, n: usize) -> Result<JudgeVerdict, String> {
    let value = extract_json(text).map_err(|e| e.to_string())?;
    let verdict: JudgeVerdict = serde_json::from_value(value).map_err(|e| e.to_string())?;
    validate(&verdict, n)?;
    Ok(verdict)
}

/// Invoke the judge against a set of previews, retrying parse failures with
/// exponential-jitter backoff. Fatal after the retry budget is exhausted.
pub async fn judge_previews(
    judge: &dyn StreamingAgent,
    query: &str,
    previews: &[PreviewOutcome],
) -> Result<JudgeVerdict, RaceError> {
    let prompt = build_prompt(query, previews);
    let n = previews.len();

    let mut last_message = String::new();
    let result = JUDGE_RETRY
        .run(|_attempt| {
            let prompt = prompt.clone();
            async move {
                let outcome = judge
                    .run_streamed(&prompt, &StreamOptions::default())
                    .await
                    .map_err(|e| format!("{e}"))?;
                parse_verdict(&outcome.text, n)
            }
        })
        .await;

    result.map_err(|message| {
        last_message = message.clone();
        RaceError::JudgeParse {
            attempts: JUDGE_RETRY.max_attempts,
            message: last_message.clone(),
        }
    })
}

/// Order candidate indices `[0..n)` by `scores[i].overall` descending.
/// Any index missing from `verdict.scores` defaults to an overall of 0.
pub fn compute_candidate_order(verdict: &JudgeVerdict, n: usize) -> Vec<usize> {
    let mut overall = vec![0.0f64; n];
    for s in &verdict.scores {
        if s.index < n {
            overall[s.index] = s.overall;
        }
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        overall[b]
            .partial_cmp(&overall[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_order_sorts_descending() {
        let verdict = JudgeVerdict {
            winner_index: 1,
            scores: vec![
                JudgeScores { index: 0, relevance: 0.5, coverage: 0.5, faithfulness: 0.5, overall: 0.5 },
                JudgeScores { index: 1, relevance: 0.9, coverage: 0.9, faithfulness: 0.9, overall: 0.9 },
            ],
        };
        assert_eq!(compute_candidate_order(&verdict, 2), vec![1, 0]);
    }

    #[test]
    fn missing_indices_default_to_zero() {
        let verdict = JudgeVerdict {
            winner_index: 0,
            scores: vec![JudgeScores { index: 1, relevance: 0.2, coverage: 0.2, faithfulness: 0.2, overall: 0.2 }],
        };
        // candidate 0 has no score → defaults to 0, candidate 1 scores 0.2 → comes first
        assert_eq!(compute_candidate_order(&verdict, 2), vec![1, 0]);
    }

    #[test]
    fn extracts_json_embedded_in_prose() {
        let text = "Sure, here you go: {\"winner_index\": 0, \"scores\": []} thanks!";
        let verdict = parse_verdict(text, 1).unwrap();
        assert_eq!(verdict.winner_index, 0);
    }

    #[test]
    fn rejects_out_of_range_winner() {
        let text = "{\"winner_index\": 5, \"scores\": []}";
        assert!(parse_verdict(text, 2).is_err());
    }
}

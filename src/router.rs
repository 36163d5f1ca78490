use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::RaceError;
use crate::router_state::RouterStateBackend;
use crate::types::Arm;

pub(crate) const ROUTER_STATE_VERSION: u32 = 1;

/// Per-arm ridge-regression state for disjoint LinUCB.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmState {
    /// Inverse of the regularized design matrix, d x d, row-major.
    pub a_inv: Vec<Vec<f64>>,
    /// Reward-weighted feature sum, length d.
    pub b: Vec<f64>,
}

impl ArmState {
    fn new(d: usize, lambda: f64) -> Self {
        let mut a_inv = vec![vec![0.0; d]; d];
        for i in 0..d {
            a_inv[i][i] = 1.0 / lambda;
        }
        Self { a_inv, b: vec![0.0; d] }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterState {
    pub version: u32,
    pub d: usize,
    pub arms: HashMap<String, ArmState>,
}

/// A disjoint LinUCB contextual bandit, one independent linear model per arm.
pub struct Router {
    d: usize,
    alpha: f64,
    lambda: f64,
    state: tokio::sync::Mutex<RouterState>,
    backend: Option<Box<dyn RouterStateBackend>>,
}

impl Router {
    pub async fn new(d: usize, alpha: f64, lambda: f64, backend: Option<Box<dyn RouterStateBackend>>) -> Self {
        let loaded = match &backend {
            Some(b) => b.load().await,
            None => None,
        };

        let state = match loaded {
            Some(s) if s.d == d => s,
            Some(_) => {
                tracing::warn!("router state dimension mismatch, resetting all arms");
                RouterState { version: ROUTER_STATE_VERSION, d, arms: HashMap::new() }
            }
            None => RouterState { version: ROUTER_STATE_VERSION, d, arms: HashMap::new() },
        };

        Self {
            d,
            alpha,
            lambda,
            state: tokio::sync::Mutex::new(state),
            backend,
        }
    }

    pub fn dimension(&self) -> usize {
        self.d
    }

    /// Select the top-`k` arms by UCB score, optionally biased per-arm.
    pub async fn select(
        &self,
        x: &[f64],
        arms: &[Arm],
        k: usize,
        arm_bias: Option<&HashMap<String, f64>>,
    ) -> Result<Vec<Arm>, RaceError> {
        if x.len() != self.d {
            return Err(RaceError::FeatureDim { expected: self.d, actual: x.len() });
        }

        let mut state = self.state.lock().await;
        let mut scored: Vec<(usize, f64, &Arm)> = Vec::with_capacity(arms.len());

        for (idx, arm) in arms.iter().enumerate() {
            if !state.arms.contains_key(arm) {
                state.arms.insert(arm.clone(), ArmState::new(self.d, self.lambda));
            }
            let arm_state = &state.arms[arm];

            let theta = matvec(&arm_state.a_inv, &arm_state.b);
            let mean = dot(x, &theta);
            let variance = dot(x, &matvec(&arm_state.a_inv, x)).max(0.0);
            let bias = arm_bias.and_then(|m| m.get(arm)).copied().unwrap_or(0.0);
            let score = mean + self.alpha * variance.sqrt() + bias;

            scored.push((idx, score, arm));
        }
        drop(state);

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });

        let take = k.min(scored.len());
        Ok(scored.into_iter().take(take).map(|(_, _, arm)| arm.clone()).collect())
    }

    /// Sherman-Morrison rank-one update of a single arm's state, then persist.
    pub async fn update(&self, x: &[f64], arm: &Arm, reward: f64) -> Result<(), RaceError> {
        if x.len() != self.d {
            return Err(RaceError::FeatureDim { expected: self.d, actual: x.len() });
        }

        let mut state = self.state.lock().await;
        if !state.arms.contains_key(arm) {
            state.arms.insert(arm.clone(), ArmState::new(self.d, self.lambda));
        }
        let arm_state = state.arms.get_mut(arm).unwrap();

        let ainv_x = matvec(&arm_state.a_inv, x);
        let denom = (1.0 + dot(x, &ainv_x)).max(1e-9);

        for i in 0..self.d {
            for j in 0..self.d {
                arm_state.a_inv[i][j] -= ainv_x[i] * ainv_x[j] / denom;
            }
        }
        for i in 0..self.d {
            arm_state.b[i] += reward * x[i];
        }

        let snapshot = state.clone();
        drop(state);
        self.persist(&snapshot).await;
        Ok(())
    }

    /// Update every arm's reward independently. A single arm's failure to
    /// persist never blocks the others.
    pub async fn bulk_update(&self, x: &[f64], rewards: &HashMap<Arm, f64>) {
        for (arm, reward) in rewards {
            if let Err(e) = self.update(x, arm, *reward).await {
                tracing::warn!(%arm, "router update failed: {e}");
            }
        }
    }

    /// Forget stale evidence: scale `A_inv` up and `b` down by `factor`.
    pub async fn decay(&self, factor: f64) {
        let mut state = self.state.lock().await;
        for arm_state in state.arms.values_mut() {
            for row in arm_state.a_inv.iter_mut() {
                for v in row.iter_mut() {
                    *v /= factor;
                }
            }
            for v in arm_state.b.iter_mut() {
                *v *= factor;
            }
        }
        let snapshot = state.clone();
        drop(state);
        self.persist(&snapshot).await;
    }

    async fn persist(&self, state: &RouterState) {
        if let Some(backend) = &self.backend
            && let Err(e) = backend.save(state).await
        {
            tracing::warn!("router state persistence failed: {e}");
        }
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn matvec(m: &[Vec<f64>], v: &[f64]) -> Vec<f64> {
    m.iter().map(|row| dot(row, v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn select_returns_min_k_distinct_arms() {
        let router = Router::new(2, 1.0, 1e-2, None).await;
        let arms = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let selected = router.select(&[1.0, 0.5], &arms, 2, None).await.unwrap();
        assert_eq!(selected.len(), 2);
        let unique: std::collections::HashSet<_> = selected.iter().collect();
        assert_eq!(unique.len(), 2);
    }

    #[tokio::test]
    async fn select_is_deterministic() {
        let router = Router::new(2, 1.0, 1e-2, None).await;
        let arms = vec!["a".to_string(), "b".to_string()];
        let x = [1.0, 0.5];
        let first = router.select(&x, &arms, 2, None).await.unwrap();
        let second = router.select(&x, &arms, 2, None).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn update_then_select_prefers_rewarded_arm() {
        let router = Router::new(2, 1.0, 1e-2, None).await;
        let x = vec![1.0, 0.5];
        router.update(&x, &"a".to_string(), 1.0).await.unwrap();
        let arms = vec!["a".to_string(), "b".to_string()];
        let selected = router.select(&x, &arms, 2, None).await.unwrap();
        assert_eq!(selected[0], "a");
    }

    #[tokio::test]
    async fn a_inv_stays_symmetric_after_updates() {
        let router = Router::new(2, 1.0, 1e-2, None).await;
        let x = vec![0.7, -0.3];
        for _ in 0..5 {
            router.update(&x, &"a".to_string(), 0.5).await.unwrap();
        }
        let state = router.state.lock().await;
        let a = &state.arms["a"].a_inv;
        for i in 0..2 {
            for j in 0..2 {
                assert!((a[i][j] - a[j][i]).abs() < 1e-8);
            }
        }
    }

    #[tokio::test]
    async fn feature_dim_mismatch_errors() {
        let router = Router::new(3, 1.0, 1e-2, None).await;
        let arms = vec!["a".to_string()];
        let err = router.select(&[1.0, 0.5], &arms, 1, None).await.unwrap_err();
        assert!(matches!(err, RaceError::FeatureDim { .. }));
    }
}

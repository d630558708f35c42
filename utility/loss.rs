//! Composite loss `sum_i score(est_i, targ_i) * risk(targ_i) * market_i` and the
//! pairwise loss matrix built from it.

use crate::config::ConfigError;
use crate::score::{RiskSpec, ScoreSpec};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Score, risk and per-node market weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossSpec {
    /// Per-node importance weights; uniform when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market: Option<Vec<f64>>,
    pub score: ScoreSpec,
    pub risk: RiskSpec,
}

impl LossSpec {
    pub fn new(score: ScoreSpec, risk: RiskSpec) -> Result<Self, ConfigError> {
        let spec = Self {
            market: None,
            score,
            risk,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn with_market(mut self, market: Vec<f64>) -> Result<Self, ConfigError> {
        self.market = Some(market);
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.score.validate()?;
        self.risk.validate()?;
        if let Some(market) = &self.market {
            if let Some(&bad) = market.iter().find(|&&m| !m.is_finite() || m < 0.0) {
                return Err(ConfigError::InvalidParameter {
                    parameter: "market",
                    value: bad,
                    requirement: "entries must be finite and nonnegative",
                });
            }
        }
        Ok(())
    }

    /// Market weights for a rate vector of length `num_nodes`.
    pub fn market_weights(&self, num_nodes: usize) -> Result<Array1<f64>, ConfigError> {
        match &self.market {
            None => Ok(Array1::ones(num_nodes)),
            Some(market) if market.len() == num_nodes => Ok(Array1::from_vec(market.clone())),
            Some(market) => Err(ConfigError::MarketLength {
                found: market.len(),
                expected: num_nodes,
            }),
        }
    }

    /// Loss of one estimate against one target, node by node.
    pub fn loss(
        &self,
        est: ArrayView1<f64>,
        targ: ArrayView1<f64>,
        market: ArrayView1<f64>,
    ) -> f64 {
        let mut total = 0.0;
        for i in 0..est.len() {
            total += self.score.score(est[i], targ[i]) * self.risk.risk(targ[i]) * market[i];
        }
        total
    }
}

/// Loss of arbitrary estimates against a fixed set of target draws.
///
/// The risk of each target, scaled by market weight, does not depend on the
/// estimate and is computed once.
pub struct DrawLoss<'a> {
    score: ScoreSpec,
    targets: ArrayView2<'a, f64>,
    weighted_risk: Array2<f64>,
}

impl<'a> DrawLoss<'a> {
    pub fn new(spec: &LossSpec, targets: ArrayView2<'a, f64>) -> Result<Self, ConfigError> {
        spec.validate()?;
        let market = spec.market_weights(targets.ncols())?;
        let weighted_risk = spec.risk.risk_batch(targets) * &market.insert_axis(Axis(0));
        Ok(Self {
            score: spec.score,
            targets,
            weighted_risk,
        })
    }

    pub fn num_targets(&self) -> usize {
        self.targets.nrows()
    }

    /// Loss of `est` against every target.
    pub fn losses(&self, est: ArrayView1<f64>) -> Array1<f64> {
        let scores = self.score.score_batch(est, self.targets);
        (scores * &self.weighted_risk).sum_axis(Axis(1))
    }

    /// Mean loss of `est` over the targets, weighted by `weights` when given.
    pub fn expected(&self, est: ArrayView1<f64>, weights: Option<ArrayView1<f64>>) -> f64 {
        let losses = self.losses(est);
        match weights {
            Some(w) => {
                let total = w.sum();
                if total > 0.0 {
                    losses.dot(&w) / total
                } else {
                    f64::NAN
                }
            }
            None => losses.mean().unwrap_or(f64::NAN),
        }
    }
}

/// Pairwise loss between estimate candidates and truth candidates.
///
/// Entry `[k][j]` is the loss of using draw `estimate_indices[k]` (or draw `k`
/// when no subset is given) as the estimate when draw `j` is the truth. The
/// matrix holds `subset x draws` entries, which bounds how many draws can be
/// used at scale.
pub fn build_loss_matrix(
    draws: ArrayView2<f64>,
    spec: &LossSpec,
    estimate_indices: Option<&[usize]>,
) -> Result<Array2<f64>, ConfigError> {
    let evaluator = DrawLoss::new(spec, draws)?;
    let all: Vec<usize>;
    let indices = match estimate_indices {
        Some(indices) => indices,
        None => {
            all = (0..draws.nrows()).collect();
            &all
        }
    };
    if let Some(&bad) = indices.iter().find(|&&i| i >= draws.nrows()) {
        return Err(ConfigError::IndexOutOfRange {
            index: bad,
            len: draws.nrows(),
        });
    }
    log::debug!(
        "Building {} x {} loss matrix ({} score, {} risk).",
        indices.len(),
        draws.nrows(),
        spec.score.name(),
        spec.risk.name()
    );

    let rows: Vec<Array1<f64>> = indices
        .par_iter()
        .map(|&i| evaluator.losses(draws.row(i)))
        .collect();

    let mut matrix = Array2::zeros((indices.len(), draws.nrows()));
    for (mut row, values) in matrix.axis_iter_mut(Axis(0)).zip(rows) {
        row.assign(&values);
    }
    Ok(matrix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn spec() -> LossSpec {
        LossSpec::new(
            ScoreSpec::AbsDiff { under_est_wt: 2.0 },
            RiskSpec::Parabolic { threshold: 0.2 },
        )
        .unwrap()
    }

    #[test]
    fn loss_matrix_matches_scalar_loss() {
        let mut rng = StdRng::seed_from_u64(3);
        let draws = Array2::from_shape_fn((30, 4), |_| rng.gen_range(0.0..1.0));
        let spec = spec().with_market(vec![1.0, 0.5, 2.0, 0.0]).unwrap();
        let market = spec.market_weights(4).unwrap();
        let subset = [2usize, 7, 29];
        let matrix = build_loss_matrix(draws.view(), &spec, Some(&subset)).unwrap();
        assert_eq!(matrix.dim(), (3, 30));
        for (k, &i) in subset.iter().enumerate() {
            for j in [0usize, 4, 17, 29] {
                let direct = spec.loss(draws.row(i), draws.row(j), market.view());
                assert_abs_diff_eq!(matrix[[k, j]], direct, epsilon = 1e-12);
            }
        }
        let full = build_loss_matrix(draws.view(), &spec, None).unwrap();
        assert_eq!(full.dim(), (30, 30));
        for i in 0..30 {
            assert_abs_diff_eq!(full[[i, i]], 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn weighted_expected_loss_uses_weights() {
        let targets = array![[0.1, 0.2], [0.5, 0.5]];
        let spec = spec();
        let evaluator = DrawLoss::new(&spec, targets.view()).unwrap();
        let est = array![0.1, 0.2];
        let losses = evaluator.losses(est.view());
        assert_abs_diff_eq!(losses[0], 0.0, epsilon = 1e-12);
        let concentrated = evaluator.expected(est.view(), Some(array![0.0, 3.0].view()));
        assert_abs_diff_eq!(concentrated, losses[1], epsilon = 1e-12);
        let uniform = evaluator.expected(est.view(), None);
        assert_abs_diff_eq!(uniform, losses[1] / 2.0, epsilon = 1e-12);
    }

    #[test]
    fn market_length_is_checked() {
        let spec = spec().with_market(vec![1.0, 1.0]).unwrap();
        assert!(matches!(
            spec.market_weights(3),
            Err(ConfigError::MarketLength { .. })
        ));
        assert!(spec.clone().with_market(vec![1.0, -1.0]).is_err());
    }

    #[test]
    fn out_of_range_subset_is_rejected() {
        let draws = array![[0.1, 0.2]];
        let result = build_loss_matrix(draws.view(), &spec(), Some(&[1]));
        assert!(matches!(result, Err(ConfigError::IndexOutOfRange { .. })));
    }
}

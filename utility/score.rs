//! Score and risk terms of the design loss.
//!
//! A *score* penalizes the distance between an estimated SFP rate and the true
//! rate; a *risk* weights how much a given true rate matters. Both act
//! node-by-node. Each term comes in three shapes:
//!
//! - scalar: one estimate against one target value,
//! - batch: one estimate vector against a `(targets, nodes)` array,
//! - tensor: every draw in an estimate subset against every draw in the set,
//!   shaped `(subset, targets, nodes)`.
//!
//! The batch and tensor forms are broadcast implementations of the scalar rule
//! and must agree with it element-wise.

use crate::config::ConfigError;
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Penalty for estimating a rate of `est` when the truth is `targ`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum ScoreSpec {
    /// `max(est - targ, 0) + under_est_wt * max(targ - est, 0)`.
    AbsDiff { under_est_wt: f64 },
    /// Pinball score `(est - targ) * (slope - 1{est < targ})`.
    Check { slope: f64 },
    /// Absolute difference between the classes of `est` and `targ`, where a
    /// rate is classified as 1 when it reaches `threshold`.
    Class { threshold: f64, under_est_wt: f64 },
}

impl ScoreSpec {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AbsDiff { .. } => "AbsDiff",
            Self::Check { .. } => "Check",
            Self::Class { .. } => "Class",
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            Self::AbsDiff { under_est_wt } => check_under_est_wt(under_est_wt),
            Self::Check { slope } => check_slope(slope),
            Self::Class {
                threshold,
                under_est_wt,
            } => {
                check_threshold(threshold)?;
                check_under_est_wt(under_est_wt)
            }
        }
    }

    /// Score of a single node.
    #[inline]
    pub fn score(&self, est: f64, targ: f64) -> f64 {
        match *self {
            Self::AbsDiff { under_est_wt } => abs_diff(est - targ, under_est_wt),
            Self::Check { slope } => check(est - targ, slope),
            Self::Class {
                threshold,
                under_est_wt,
            } => abs_diff(classify(est, threshold) - classify(targ, threshold), under_est_wt),
        }
    }

    /// Node-wise score of one estimate vector against one target vector.
    pub fn score_vec(&self, est: ArrayView1<f64>, targ: ArrayView1<f64>) -> Array1<f64> {
        let diff = self.signed_difference(est, targ.insert_axis(Axis(0)));
        self.apply(diff).remove_axis(Axis(0))
    }

    /// Scores of `est` against every row of `targs`, shaped `(targets, nodes)`.
    pub fn score_batch(&self, est: ArrayView1<f64>, targs: ArrayView2<f64>) -> Array2<f64> {
        let diff = self.signed_difference(est, targs);
        self.apply(diff)
    }

    /// Scores of every draw in `estimate_indices` (all draws when `None`)
    /// against every draw, shaped `(subset, targets, nodes)`.
    pub fn score_tensor(
        &self,
        draws: ArrayView2<f64>,
        estimate_indices: Option<&[usize]>,
    ) -> Array3<f64> {
        let all: Vec<usize>;
        let indices = match estimate_indices {
            Some(indices) => indices,
            None => {
                all = (0..draws.nrows()).collect();
                &all
            }
        };
        let mut out = Array3::zeros((indices.len(), draws.nrows(), draws.ncols()));
        for (mut slab, &i) in out.axis_iter_mut(Axis(0)).zip(indices) {
            slab.assign(&self.score_batch(draws.row(i), draws));
        }
        out
    }

    /// `est - targ` broadcast over target rows, after classification for the
    /// classification score.
    fn signed_difference(&self, est: ArrayView1<f64>, targs: ArrayView2<f64>) -> Array2<f64> {
        match *self {
            Self::Class { threshold, .. } => {
                let est_class = est.mapv(|v| classify(v, threshold));
                let targ_class = targs.mapv(|v| classify(v, threshold));
                &est_class.insert_axis(Axis(0)) - &targ_class
            }
            Self::AbsDiff { .. } | Self::Check { .. } => &est.insert_axis(Axis(0)) - &targs,
        }
    }

    fn apply(&self, mut diff: Array2<f64>) -> Array2<f64> {
        match *self {
            Self::AbsDiff { under_est_wt } | Self::Class { under_est_wt, .. } => {
                diff.mapv_inplace(|d| abs_diff(d, under_est_wt))
            }
            Self::Check { slope } => diff.mapv_inplace(|d| check(d, slope)),
        }
        diff
    }
}

/// Weight given to a node whose true SFP rate is `targ`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum RiskSpec {
    /// Quadratic `(targ + 2(0.5 - threshold)) * (1 - targ)`, peaking at
    /// `threshold` and floored at zero.
    Parabolic { threshold: f64 },
    /// Piecewise-linear `1 - (targ - threshold) * (slope - 1{targ < threshold})`,
    /// equal to 1 at `threshold`.
    Check { threshold: f64, slope: f64 },
}

impl RiskSpec {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Parabolic { .. } => "Parabolic",
            Self::Check { .. } => "Check",
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            Self::Parabolic { threshold } => check_threshold(threshold),
            Self::Check { threshold, slope } => {
                check_threshold(threshold)?;
                check_slope(slope)
            }
        }
    }

    #[inline]
    pub fn risk(&self, targ: f64) -> f64 {
        match *self {
            Self::Parabolic { threshold } => {
                ((targ + 2.0 * (0.5 - threshold)) * (1.0 - targ)).max(0.0)
            }
            Self::Check { threshold, slope } => {
                let below = if targ < threshold { 1.0 } else { 0.0 };
                1.0 - (targ - threshold) * (slope - below)
            }
        }
    }

    pub fn risk_vec(&self, targ: ArrayView1<f64>) -> Array1<f64> {
        targ.mapv(|t| self.risk(t))
    }

    /// Risk of every row of `targs`, shaped `(targets, nodes)`.
    pub fn risk_batch(&self, targs: ArrayView2<f64>) -> Array2<f64> {
        match *self {
            Self::Parabolic { threshold } => {
                let shift = 2.0 * (0.5 - threshold);
                let upper = targs.mapv(|t| t + shift);
                let lower = targs.mapv(|t| 1.0 - t);
                (upper * lower).mapv_into(|v| v.max(0.0))
            }
            Self::Check { threshold, slope } => targs.mapv(|t| {
                let below = if t < threshold { 1.0 } else { 0.0 };
                1.0 - (t - threshold) * (slope - below)
            }),
        }
    }
}

#[inline]
fn abs_diff(diff: f64, under_est_wt: f64) -> f64 {
    diff.max(0.0) + under_est_wt * (-diff).max(0.0)
}

#[inline]
fn check(diff: f64, slope: f64) -> f64 {
    let under = if diff < 0.0 { 1.0 } else { 0.0 };
    diff * (slope - under)
}

#[inline]
fn classify(rate: f64, threshold: f64) -> f64 {
    if rate >= threshold { 1.0 } else { 0.0 }
}

fn check_under_est_wt(under_est_wt: f64) -> Result<(), ConfigError> {
    if under_est_wt.is_finite() && under_est_wt > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidParameter {
            parameter: "under_est_wt",
            value: under_est_wt,
            requirement: "must be finite and > 0",
        })
    }
}

fn check_slope(slope: f64) -> Result<(), ConfigError> {
    if slope > 0.0 && slope < 1.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidParameter {
            parameter: "slope",
            value: slope,
            requirement: "must lie in (0, 1)",
        })
    }
}

fn check_threshold(threshold: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&threshold) {
        Ok(())
    } else {
        Err(ConfigError::InvalidParameter {
            parameter: "threshold",
            value: threshold,
            requirement: "must lie in [0, 1]",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn score_specs() -> Vec<ScoreSpec> {
        vec![
            ScoreSpec::AbsDiff { under_est_wt: 1.0 },
            ScoreSpec::AbsDiff { under_est_wt: 5.0 },
            ScoreSpec::AbsDiff { under_est_wt: 0.3 },
            ScoreSpec::Check { slope: 0.5 },
            ScoreSpec::Check { slope: 0.2 },
            ScoreSpec::Class {
                threshold: 0.15,
                under_est_wt: 1.0,
            },
            ScoreSpec::Class {
                threshold: 0.3,
                under_est_wt: 4.0,
            },
        ]
    }

    fn risk_specs() -> Vec<RiskSpec> {
        vec![
            RiskSpec::Parabolic { threshold: 0.1 },
            RiskSpec::Parabolic { threshold: 0.5 },
            RiskSpec::Parabolic { threshold: 0.8 },
            RiskSpec::Check {
                threshold: 0.2,
                slope: 0.6,
            },
            RiskSpec::Check {
                threshold: 0.5,
                slope: 0.1,
            },
        ]
    }

    fn random_draws(rng: &mut StdRng, rows: usize, cols: usize) -> Array2<f64> {
        Array2::from_shape_fn((rows, cols), |_| rng.gen_range(0.0..1.0))
    }

    #[test]
    fn batch_scores_match_scalar_scores() {
        let mut rng = StdRng::seed_from_u64(11);
        let targs = random_draws(&mut rng, 40, 5);
        let est = random_draws(&mut rng, 1, 5).row(0).to_owned();
        for spec in score_specs() {
            let batch = spec.score_batch(est.view(), targs.view());
            assert_eq!(batch.dim(), (40, 5));
            for (row, targ) in targs.axis_iter(Axis(0)).enumerate() {
                let vec = spec.score_vec(est.view(), targ);
                for node in 0..5 {
                    let scalar = spec.score(est[node], targ[node]);
                    assert_abs_diff_eq!(batch[[row, node]], scalar, epsilon = 1e-12);
                    assert_abs_diff_eq!(vec[node], scalar, epsilon = 1e-12);
                }
            }
        }
    }

    #[test]
    fn score_tensor_matches_scalar_scores() {
        let mut rng = StdRng::seed_from_u64(12);
        let draws = random_draws(&mut rng, 12, 4);
        let subset = [0usize, 5, 11];
        for spec in score_specs() {
            let tensor = spec.score_tensor(draws.view(), Some(&subset));
            assert_eq!(tensor.dim(), (3, 12, 4));
            for (k, &i) in subset.iter().enumerate() {
                for j in 0..12 {
                    for node in 0..4 {
                        let scalar = spec.score(draws[[i, node]], draws[[j, node]]);
                        assert_abs_diff_eq!(tensor[[k, j, node]], scalar, epsilon = 1e-12);
                    }
                }
            }
            let full = spec.score_tensor(draws.view(), None);
            assert_eq!(full.dim(), (12, 12, 4));
        }
    }

    #[test]
    fn batch_risks_match_scalar_risks() {
        let mut rng = StdRng::seed_from_u64(13);
        let targs = random_draws(&mut rng, 50, 3);
        for spec in risk_specs() {
            let batch = spec.risk_batch(targs.view());
            for ((row, node), &value) in batch.indexed_iter() {
                assert_abs_diff_eq!(value, spec.risk(targs[[row, node]]), epsilon = 1e-12);
            }
            let vec = spec.risk_vec(targs.row(0));
            assert_abs_diff_eq!(vec[2], spec.risk(targs[[0, 2]]), epsilon = 1e-12);
        }
    }

    #[test]
    fn abs_diff_weights_underestimation() {
        let spec = ScoreSpec::AbsDiff { under_est_wt: 3.0 };
        assert_abs_diff_eq!(spec.score(0.2, 0.1), 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(spec.score(0.1, 0.2), 0.3, epsilon = 1e-12);
    }

    #[test]
    fn check_score_is_pinball_loss() {
        let spec = ScoreSpec::Check { slope: 0.25 };
        assert_abs_diff_eq!(spec.score(0.4, 0.2), 0.05, epsilon = 1e-12);
        assert_abs_diff_eq!(spec.score(0.2, 0.4), 0.15, epsilon = 1e-12);
        assert_abs_diff_eq!(spec.score(0.3, 0.3), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn class_score_compares_classes() {
        let spec = ScoreSpec::Class {
            threshold: 0.2,
            under_est_wt: 2.0,
        };
        assert_abs_diff_eq!(spec.score(0.1, 0.15), 0.0);
        assert_abs_diff_eq!(spec.score(0.25, 0.15), 1.0);
        assert_abs_diff_eq!(spec.score(0.15, 0.25), 2.0);
        let scores = spec.score_vec(array![0.25, 0.1].view(), array![0.9, 0.3].view());
        assert_eq!(scores, array![0.0, 2.0]);
    }

    #[test]
    fn parabolic_risk_peaks_at_threshold() {
        let spec = RiskSpec::Parabolic { threshold: 0.1 };
        let peak = spec.risk(0.1);
        assert!(spec.risk(0.0) < peak);
        assert!(spec.risk(0.3) < peak);
        assert_abs_diff_eq!(spec.risk(1.0), 0.0, epsilon = 1e-12);
        let high = RiskSpec::Parabolic { threshold: 0.9 };
        assert!(high.risk(0.0) >= 0.0);
    }

    #[test]
    fn check_risk_is_one_at_threshold() {
        let spec = RiskSpec::Check {
            threshold: 0.3,
            slope: 0.5,
        };
        assert_abs_diff_eq!(spec.risk(0.3), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(spec.risk(0.1), 0.9, epsilon = 1e-12);
        assert_abs_diff_eq!(spec.risk(0.5), 0.9, epsilon = 1e-12);
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        assert!(ScoreSpec::AbsDiff { under_est_wt: 0.0 }.validate().is_err());
        assert!(ScoreSpec::Check { slope: 1.0 }.validate().is_err());
        assert!(
            ScoreSpec::Class {
                threshold: 1.5,
                under_est_wt: 1.0
            }
            .validate()
            .is_err()
        );
        assert!(RiskSpec::Parabolic { threshold: -0.1 }.validate().is_err());
        assert!(
            RiskSpec::Check {
                threshold: 0.5,
                slope: 0.5
            }
            .validate()
            .is_ok()
        );
    }
}

//! Bayes estimates from (weighted) posterior draws.
//!
//! Every score in [`ScoreSpec`] is minimized in expectation by a quantile of
//! the marginal posterior of each node, so the estimate is computed node by
//! node. No joint multivariate quantile is formed.

use crate::score::ScoreSpec;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BayesError {
    #[error("Cannot compute a Bayes estimate from an empty draw set.")]
    EmptyDraws,

    #[error("Weight vector has length {found}, but there are {expected} draws.")]
    WeightLength { found: usize, expected: usize },

    #[error("Weights must be finite, nonnegative and sum to a positive total (total was {total}).")]
    DegenerateWeights { total: f64 },
}

/// Quantile of the marginal posterior that minimizes the expected score.
pub fn target_quantile(score: &ScoreSpec) -> f64 {
    match *score {
        ScoreSpec::AbsDiff { under_est_wt } | ScoreSpec::Class { under_est_wt, .. } => {
            under_est_wt / (1.0 + under_est_wt)
        }
        ScoreSpec::Check { slope } => 1.0 - slope,
    }
}

/// Classification scores report the class of the quantile, not the quantile.
fn finalize(score: &ScoreSpec, quantile: f64) -> f64 {
    match *score {
        ScoreSpec::Class { threshold, .. } => {
            if quantile >= threshold {
                1.0
            } else {
                0.0
            }
        }
        ScoreSpec::AbsDiff { .. } | ScoreSpec::Check { .. } => quantile,
    }
}

/// Bayes estimate from equally weighted draws.
///
/// Uses the linearly interpolated sample quantile (the common default in
/// numerical libraries).
pub fn bayes_estimate(draws: ArrayView2<f64>, score: &ScoreSpec) -> Result<Array1<f64>, BayesError> {
    if draws.nrows() == 0 {
        return Err(BayesError::EmptyDraws);
    }
    let q = target_quantile(score);
    Ok(draws
        .axis_iter(Axis(1))
        .map(|column| finalize(score, interpolated_quantile(column, q)))
        .collect())
}

/// Bayes estimate from draws carrying arbitrary nonnegative weights.
///
/// For each node the draws are sorted by value and weights accumulated in that
/// order; the estimate is the first value whose cumulative weight reaches the
/// target fraction of the total weight.
pub fn bayes_estimate_weighted(
    draws: ArrayView2<f64>,
    weights: ArrayView1<f64>,
    score: &ScoreSpec,
) -> Result<Array1<f64>, BayesError> {
    if draws.nrows() == 0 {
        return Err(BayesError::EmptyDraws);
    }
    check_weights(weights, draws.nrows())?;
    let q = target_quantile(score);
    Ok(draws
        .axis_iter(Axis(1))
        .map(|column| {
            let order = argsort(column);
            finalize(score, weighted_quantile(column, &order, weights, q))
        })
        .collect())
}

/// [`bayes_estimate_weighted`] for many weight vectors at once.
///
/// `weights` is `(draws, scenarios)`, one column per scenario. The draws are
/// sorted once per node and shared by every scenario. Returns
/// `(scenarios, nodes)`.
pub fn bayes_estimate_weighted_batch(
    draws: ArrayView2<f64>,
    weights: ArrayView2<f64>,
    score: &ScoreSpec,
) -> Result<Array2<f64>, BayesError> {
    if draws.nrows() == 0 {
        return Err(BayesError::EmptyDraws);
    }
    if weights.nrows() != draws.nrows() {
        return Err(BayesError::WeightLength {
            found: weights.nrows(),
            expected: draws.nrows(),
        });
    }
    for column in weights.axis_iter(Axis(1)) {
        check_weights(column, draws.nrows())?;
    }
    let q = target_quantile(score);
    let orders: Vec<Vec<usize>> = draws.axis_iter(Axis(1)).map(argsort).collect();

    let estimates: Vec<Array1<f64>> = weights
        .axis_iter(Axis(1))
        .into_par_iter()
        .map(|column| {
            orders
                .iter()
                .enumerate()
                .map(|(node, order)| {
                    finalize(score, weighted_quantile(draws.column(node), order, column, q))
                })
                .collect()
        })
        .collect();

    let mut out = Array2::zeros((weights.ncols(), draws.ncols()));
    for (mut row, estimate) in out.axis_iter_mut(Axis(0)).zip(estimates) {
        row.assign(&estimate);
    }
    Ok(out)
}

fn check_weights(weights: ArrayView1<f64>, expected: usize) -> Result<(), BayesError> {
    if weights.len() != expected {
        return Err(BayesError::WeightLength {
            found: weights.len(),
            expected,
        });
    }
    let total = weights.sum();
    if !total.is_finite() || total <= 0.0 || weights.iter().any(|&w| !(w >= 0.0)) {
        return Err(BayesError::DegenerateWeights { total });
    }
    Ok(())
}

fn argsort(values: ArrayView1<f64>) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    order
}

fn interpolated_quantile(values: ArrayView1<f64>, q: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let position = (sorted.len() - 1) as f64 * q;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let frac = position - lower as f64;
    sorted[lower] + frac * (sorted[upper] - sorted[lower])
}

/// Inverted weighted CDF. When the running weight lands exactly on the
/// target, the result is the midpoint with the next weighted draw, so uniform
/// weights reproduce the usual sample median.
fn weighted_quantile(
    values: ArrayView1<f64>,
    order: &[usize],
    weights: ArrayView1<f64>,
    q: f64,
) -> f64 {
    let total = weights.sum();
    let target = q * total;
    let tolerance = 1e-12 * total;
    let mut cumulative = 0.0;
    for (pos, &idx) in order.iter().enumerate() {
        if weights[idx] <= 0.0 {
            continue;
        }
        cumulative += weights[idx];
        if cumulative >= target - tolerance {
            let on_target = (cumulative - target).abs() <= tolerance;
            let next = order[pos + 1..].iter().find(|&&j| weights[j] > 0.0);
            return match next {
                Some(&next) if on_target => values[idx] + 0.5 * (values[next] - values[idx]),
                _ => values[idx],
            };
        }
    }
    // Rounding can leave the running sum just short of the target.
    order
        .iter()
        .rev()
        .find(|&&idx| weights[idx] > 0.0)
        .map(|&idx| values[idx])
        .unwrap_or(values[order[order.len() - 1]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_draws(seed: u64, rows: usize, cols: usize) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((rows, cols), |_| rng.gen_range(0.0..1.0))
    }

    #[test]
    fn symmetric_abs_diff_gives_the_median() {
        let draws = array![[0.3, 0.9], [0.1, 0.5], [0.2, 0.7]];
        let score = ScoreSpec::AbsDiff { under_est_wt: 1.0 };
        let est = bayes_estimate(draws.view(), &score).unwrap();
        assert_eq!(est, array![0.2, 0.7]);
    }

    #[test]
    fn unweighted_quantile_interpolates() {
        let draws = array![[0.0], [1.0], [2.0], [3.0]];
        // under_est_wt = 3 targets the 0.75 quantile: position 2.25.
        let score = ScoreSpec::AbsDiff { under_est_wt: 3.0 };
        let est = bayes_estimate(draws.view(), &score).unwrap();
        assert_abs_diff_eq!(est[0], 2.25, epsilon = 1e-12);
        let check = ScoreSpec::Check { slope: 0.75 };
        let est = bayes_estimate(draws.view(), &check).unwrap();
        assert_abs_diff_eq!(est[0], 0.75, epsilon = 1e-12);
    }

    #[test]
    fn uniform_weights_reproduce_unweighted_median() {
        let draws = random_draws(5, 501, 4);
        let score = ScoreSpec::AbsDiff { under_est_wt: 1.0 };
        let unweighted = bayes_estimate(draws.view(), &score).unwrap();
        let weights = Array1::ones(draws.nrows());
        let weighted = bayes_estimate_weighted(draws.view(), weights.view(), &score).unwrap();
        assert_eq!(unweighted, weighted);
        let rescaled = Array1::from_elem(draws.nrows(), 0.37);
        let weighted = bayes_estimate_weighted(draws.view(), rescaled.view(), &score).unwrap();
        assert_eq!(unweighted, weighted);
    }

    #[test]
    fn even_draw_counts_average_the_middle_pair() {
        let draws = array![[0.4, 0.9], [0.1, 0.6], [0.3, 0.8], [0.2, 0.7]];
        let score = ScoreSpec::AbsDiff { under_est_wt: 1.0 };
        let unweighted = bayes_estimate(draws.view(), &score).unwrap();
        assert_abs_diff_eq!(unweighted[0], 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(unweighted[1], 0.75, epsilon = 1e-12);
        for w in [1.0, 0.37, 12.5] {
            let weights = Array1::from_elem(4, w);
            let weighted = bayes_estimate_weighted(draws.view(), weights.view(), &score).unwrap();
            assert_abs_diff_eq!(weighted[0], unweighted[0], epsilon = 1e-12);
            assert_abs_diff_eq!(weighted[1], unweighted[1], epsilon = 1e-12);
        }

        let even = random_draws(12, 500, 3);
        let unweighted = bayes_estimate(even.view(), &score).unwrap();
        let weights = Array1::ones(even.nrows());
        let weighted = bayes_estimate_weighted(even.view(), weights.view(), &score).unwrap();
        for (a, b) in unweighted.iter().zip(weighted.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }

        // A zero-weight draw between the middle pair is skipped.
        let gapped = array![[0.1], [0.2], [0.25], [0.3], [0.4]];
        let weights = array![1.0, 1.0, 0.0, 1.0, 1.0];
        let weighted = bayes_estimate_weighted(gapped.view(), weights.view(), &score).unwrap();
        assert_abs_diff_eq!(weighted[0], 0.25, epsilon = 1e-12);
    }

    #[test]
    fn concentrated_weight_returns_that_draw() {
        let draws = random_draws(6, 200, 3);
        let mut weights = Array1::zeros(draws.nrows());
        weights[137] = 4.2;
        for score in [
            ScoreSpec::AbsDiff { under_est_wt: 0.2 },
            ScoreSpec::AbsDiff { under_est_wt: 9.0 },
            ScoreSpec::Check { slope: 0.9 },
        ] {
            let est = bayes_estimate_weighted(draws.view(), weights.view(), &score).unwrap();
            assert_eq!(est, draws.row(137).to_owned());
        }
    }

    #[test]
    fn class_estimate_is_binary() {
        let draws = array![[0.05, 0.3], [0.1, 0.4], [0.12, 0.5]];
        let score = ScoreSpec::Class {
            threshold: 0.2,
            under_est_wt: 1.0,
        };
        let est = bayes_estimate(draws.view(), &score).unwrap();
        assert_eq!(est, array![0.0, 1.0]);
        let weights = array![1.0, 1.0, 1.0];
        let est = bayes_estimate_weighted(draws.view(), weights.view(), &score).unwrap();
        assert_eq!(est, array![0.0, 1.0]);
    }

    #[test]
    fn batch_matches_column_by_column() {
        let draws = random_draws(8, 300, 5);
        let mut rng = StdRng::seed_from_u64(9);
        let weights = Array2::from_shape_fn((300, 7), |_| rng.gen_range(0.0..2.0));
        let score = ScoreSpec::AbsDiff { under_est_wt: 2.5 };
        let batch = bayes_estimate_weighted_batch(draws.view(), weights.view(), &score).unwrap();
        assert_eq!(batch.dim(), (7, 5));
        for s in 0..7 {
            let single =
                bayes_estimate_weighted(draws.view(), weights.column(s), &score).unwrap();
            assert_eq!(batch.row(s).to_owned(), single);
        }
    }

    #[test]
    fn degenerate_weights_are_rejected() {
        let draws = random_draws(10, 4, 2);
        let score = ScoreSpec::AbsDiff { under_est_wt: 1.0 };
        let zeros = Array1::zeros(4);
        assert!(matches!(
            bayes_estimate_weighted(draws.view(), zeros.view(), &score),
            Err(BayesError::DegenerateWeights { .. })
        ));
        let short = Array1::ones(3);
        assert!(matches!(
            bayes_estimate_weighted(draws.view(), short.view(), &score),
            Err(BayesError::WeightLength { .. })
        ));
        let nan = array![1.0, f64::NAN, 1.0, 1.0];
        assert!(bayes_estimate_weighted(draws.view(), nan.view(), &score).is_err());
    }
}

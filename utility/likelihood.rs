//! Detection probabilities, testing-data likelihood and importance weights.
//!
//! # Model
//!
//! A rate vector `gamma` holds supply-node rates first and test-node rates
//! after. For test node `t` and supply node `s` the consolidated SFP rate is
//!
//! ```text
//! z*(t, s) = gamma[SN + t] + (1 - gamma[SN + t]) * gamma[s]
//! ```
//!
//! and a test on that trace is positive with probability
//! `sens * z* + (1 - spec) * (1 - z*)`. Untracked data observe only the test
//! node, so the trace rates are mixed by the sourcing matrix first.
//!
//! # Numerical stability
//!
//! Probabilities are floored at [`PROB_FLOOR`] away from 0 and 1 before any
//! logarithm, log-likelihoods are accumulated per draw, and importance weights
//! are exponentiated only after subtracting the largest log-likelihood.

use crate::types::{DataError, Diagnostic, SupplyChain, TestingData};
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, Axis, Zip};
use rayon::prelude::*;
use statrs::function::gamma::ln_gamma;
use thiserror::Error;

/// Distance kept from 0 and 1 before taking logarithms.
pub const PROB_FLOOR: f64 = 1e-10;

#[derive(Error, Debug)]
pub enum LikelihoodError {
    #[error(transparent)]
    Data(#[from] DataError),

    #[error(
        "Importance weights collapsed: no draw gives the outcome a finite likelihood (largest log-likelihood {max_log_lik})."
    )]
    WeightCollapse { max_log_lik: f64 },
}

/// Consolidated SFP rate `z*` of a trace.
#[inline]
pub fn consolidated_rate(test_rate: f64, supply_rate: f64) -> f64 {
    test_rate + (1.0 - test_rate) * supply_rate
}

/// Probability that a test on trace `(test_node, supply_node)` is positive
/// under the rates `gamma`.
pub fn trace_detection_prob(
    test_node: usize,
    supply_node: usize,
    gamma: ArrayView1<f64>,
    chain: SupplyChain,
    diagnostic: &Diagnostic,
) -> f64 {
    let z_star = consolidated_rate(gamma[chain.test_node_index(test_node)], gamma[supply_node]);
    diagnostic.positive_probability(z_star)
}

/// Positive-test probability of every trace, `(numTN, numSN)`.
pub fn trace_detection_matrix(
    gamma: ArrayView1<f64>,
    chain: SupplyChain,
    diagnostic: &Diagnostic,
) -> Array2<f64> {
    Array2::from_shape_fn(chain.trace_shape(), |(t, s)| {
        trace_detection_prob(t, s, gamma, chain, diagnostic)
    })
}

/// Positive-test probability of every trace for every draw,
/// `(numDraws, numTN, numSN)`.
pub fn trace_detection_prob_batch(
    draws: ArrayView2<f64>,
    chain: SupplyChain,
    diagnostic: &Diagnostic,
) -> Array3<f64> {
    let (num_tn, num_sn) = chain.trace_shape();
    let mut out = Array3::zeros((draws.nrows(), num_tn, num_sn));
    Zip::from(out.outer_iter_mut())
        .and(draws.outer_iter())
        .par_for_each(|mut slab, gamma| {
            slab.assign(&trace_detection_matrix(gamma, chain, diagnostic));
        });
    out
}

/// Positive-test probability at each test node when the supply node is not
/// observed: trace rates mixed by `sourcing` before the assay is applied.
pub fn node_detection_probs(
    gamma: ArrayView1<f64>,
    chain: SupplyChain,
    sourcing: ArrayView2<f64>,
    diagnostic: &Diagnostic,
) -> Array1<f64> {
    Array1::from_shape_fn(chain.num_test_nodes, |t| {
        let test_rate = gamma[chain.test_node_index(t)];
        let mixed: f64 = (0..chain.num_supply_nodes)
            .map(|s| sourcing[[t, s]] * consolidated_rate(test_rate, gamma[s]))
            .sum();
        diagnostic.positive_probability(mixed.clamp(0.0, 1.0))
    })
}

/// `ln C(n, y)` for possibly fractional counts.
#[inline]
pub fn ln_choose(n: f64, y: f64) -> f64 {
    ln_gamma(n + 1.0) - ln_gamma(y + 1.0) - ln_gamma(n - y + 1.0)
}

#[inline]
fn binomial_log_lik(n: f64, y: f64, p: f64) -> f64 {
    if n <= 0.0 {
        return 0.0;
    }
    let p = p.clamp(PROB_FLOOR, 1.0 - PROB_FLOOR);
    y * p.ln() + (n - y) * (1.0 - p).ln()
}

/// Binomial log-likelihood of `data` under one rate vector, including the
/// binomial coefficients.
pub fn log_likelihood(
    data: &TestingData,
    gamma: ArrayView1<f64>,
    diagnostic: &Diagnostic,
) -> f64 {
    let chain = data.supply_chain();
    let mut ll = 0.0;
    match data {
        TestingData::Tracked { tests, positives } => {
            for ((t, s), &n) in tests.indexed_iter() {
                if n <= 0.0 {
                    continue;
                }
                let y = positives[[t, s]];
                let p = trace_detection_prob(t, s, gamma, chain, diagnostic);
                ll += ln_choose(n, y) + binomial_log_lik(n, y, p);
            }
        }
        TestingData::Untracked {
            tests,
            positives,
            sourcing,
        } => {
            let probs = node_detection_probs(gamma, chain, sourcing.view(), diagnostic);
            for (t, &n) in tests.iter().enumerate() {
                if n <= 0.0 {
                    continue;
                }
                let y = positives[t];
                ll += ln_choose(n, y) + binomial_log_lik(n, y, probs[t]);
            }
        }
    }
    ll
}

/// [`log_likelihood`] for every draw.
pub fn log_likelihood_batch(
    data: &TestingData,
    draws: ArrayView2<f64>,
    diagnostic: &Diagnostic,
) -> Result<Array1<f64>, LikelihoodError> {
    let chain = data.supply_chain();
    if draws.ncols() != chain.num_nodes() {
        return Err(DataError::ShapeMismatch {
            what: "posterior draws",
            expected: (draws.nrows(), chain.num_nodes()),
            found: draws.dim(),
        }
        .into());
    }
    let values: Vec<f64> = draws
        .axis_iter(Axis(0))
        .into_par_iter()
        .map(|gamma| log_likelihood(data, gamma, diagnostic))
        .collect();
    Ok(Array1::from_vec(values))
}

/// Importance weights from per-draw log-likelihoods, normalized to sum to the
/// number of draws.
pub fn importance_weights(log_lik: ArrayView1<f64>) -> Result<Array1<f64>, LikelihoodError> {
    let max_log_lik = log_lik
        .iter()
        .copied()
        .filter(|v| !v.is_nan())
        .fold(f64::NEG_INFINITY, f64::max);
    if !max_log_lik.is_finite() {
        return Err(LikelihoodError::WeightCollapse { max_log_lik });
    }
    let mut weights = log_lik.mapv(|l| {
        let w = (l - max_log_lik).exp();
        if w.is_finite() { w } else { 0.0 }
    });
    let total = weights.sum();
    weights *= log_lik.len() as f64 / total;
    Ok(weights)
}

/// `ln(mean(exp(log_lik)))`: the log marginal probability of an outcome when
/// `log_lik` holds its log-likelihood under equally weighted draws.
pub fn log_mean_exp(log_lik: ArrayView1<f64>) -> f64 {
    let max = log_lik
        .iter()
        .copied()
        .filter(|v| !v.is_nan())
        .fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = log_lik.iter().map(|&l| (l - max).exp()).filter(|w| w.is_finite()).sum();
    max + sum.ln() - (log_lik.len() as f64).ln()
}

/// Kish effective sample size of a weight vector.
pub fn effective_sample_size(weights: ArrayView1<f64>) -> f64 {
    let total = weights.sum();
    let squares = weights.dot(&weights);
    if squares > 0.0 {
        total * total / squares
    } else {
        0.0
    }
}

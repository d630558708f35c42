//! Exhaustive enumeration of test outcomes and sourcing compositions.
//!
//! Both enumerations grow exponentially with the number of cells and the
//! budget. They exist to compute exact expectations on small problems, which
//! in turn validate the sampling-based estimators, and they refuse to run past
//! [`MAX_ENUMERATED_OUTCOMES`].

use crate::design::DesignError;
use itertools::Itertools;
use ndarray::{Array, ArrayView1, Dimension};
use statrs::function::factorial::ln_factorial;

/// Largest enumeration attempted before reporting a precondition violation.
pub const MAX_ENUMERATED_OUTCOMES: u128 = 1_000_000;

/// Number of outcome arrays `enumerate_outcomes` would produce:
/// `prod(allocation[cell] + 1)`.
pub fn outcome_count<D: Dimension>(allocation: &Array<f64, D>) -> u128 {
    allocation
        .iter()
        .map(|&n| n.max(0.0).round() as u128 + 1)
        .fold(1u128, |acc, k| acc.saturating_mul(k))
}

/// Every positive-count array compatible with `allocation`: each cell ranges
/// independently over `0..=allocation[cell]`.
pub fn enumerate_outcomes<D: Dimension>(
    allocation: &Array<f64, D>,
) -> Result<Vec<Array<f64, D>>, DesignError> {
    let count = outcome_count(allocation);
    if count > MAX_ENUMERATED_OUTCOMES {
        return Err(DesignError::EnumerationTooLarge {
            count,
            limit: MAX_ENUMERATED_OUTCOMES,
        });
    }
    log::debug!("Enumerating {count} outcomes.");

    if allocation.is_empty() {
        return Ok(vec![allocation.clone()]);
    }

    let outcomes = allocation
        .iter()
        .map(|&n| 0..=(n.max(0.0).round() as usize))
        .multi_cartesian_product()
        .map(|positives| {
            let mut outcome = allocation.clone();
            for (cell, y) in outcome.iter_mut().zip(positives) {
                *cell = y as f64;
            }
            outcome
        })
        .collect();
    Ok(outcomes)
}

/// Number of compositions of `target` into `length` nonnegative parts.
pub fn composition_count(length: usize, target: usize) -> u128 {
    if length == 0 {
        return u128::from(target == 0);
    }
    // C(target + length - 1, length - 1), built incrementally to stay exact.
    let k = (length - 1) as u128;
    let n = (target + length - 1) as u128;
    let mut result: u128 = 1;
    for i in 1..=k {
        result = result.saturating_mul(n - k + i) / i;
    }
    result
}

/// All nonnegative integer vectors of `length` entries summing to `target`,
/// in lexicographic order.
pub fn compositions(length: usize, target: usize) -> Result<Vec<Vec<usize>>, DesignError> {
    let count = composition_count(length, target);
    if count > MAX_ENUMERATED_OUTCOMES {
        return Err(DesignError::EnumerationTooLarge {
            count,
            limit: MAX_ENUMERATED_OUTCOMES,
        });
    }
    let mut out = Vec::with_capacity(count as usize);
    let mut prefix = Vec::with_capacity(length);
    extend_compositions(length, target, &mut prefix, &mut out);
    Ok(out)
}

fn extend_compositions(
    remaining_parts: usize,
    remaining: usize,
    prefix: &mut Vec<usize>,
    out: &mut Vec<Vec<usize>>,
) {
    match remaining_parts {
        0 => {
            if remaining == 0 {
                out.push(prefix.clone());
            }
        }
        1 => {
            prefix.push(remaining);
            out.push(prefix.clone());
            prefix.pop();
        }
        _ => {
            for first in 0..=remaining {
                prefix.push(first);
                extend_compositions(remaining_parts - 1, remaining - first, prefix, out);
                prefix.pop();
            }
        }
    }
}

/// Log-probability of `counts` under a multinomial with cell probabilities
/// `probs`.
pub fn multinomial_ln_pmf(counts: &[usize], probs: ArrayView1<f64>) -> f64 {
    let total: usize = counts.iter().sum();
    let mut ln_p = ln_factorial(total as u64);
    for (&c, &p) in counts.iter().zip(probs.iter()) {
        if c == 0 {
            continue;
        }
        if p <= 0.0 {
            return f64::NEG_INFINITY;
        }
        ln_p += c as f64 * p.ln() - ln_factorial(c as u64);
    }
    ln_p
}

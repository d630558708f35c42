//! Sampling designs and their conversion to integer test allocations.

use crate::config::ConfigError;
use crate::types::SupplyChain;
use ndarray::{Array, Array1, Array2, ArrayView2, Dimension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const DESIGN_SUM_TOLERANCE: f64 = 1e-8;

#[derive(Error, Debug)]
pub enum DesignError {
    #[error("Invalid design: {0}")]
    InvalidDesign(String),

    #[error("Design has shape {found:?}, but the supply chain requires {expected:?}.")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error(
        "Enumeration would produce {count} outcomes, above the limit of {limit}. Use a sampling-based method for this budget."
    )]
    EnumerationTooLarge { count: u128, limit: u128 },

    #[error(
        "Node-sampling design places tests at test nodes {nodes:?}; this method requires exactly one test node."
    )]
    MultipleTestNodes { nodes: Vec<usize> },

    #[error("A balanced design needs a positive number of new tests.")]
    ZeroBudget,
}

/// Whether tests are allocated to traces or to test nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingType {
    /// Tests are assigned to (test node, supply node) traces directly.
    Path,
    /// Tests are assigned to test nodes; supply nodes follow the sourcing matrix.
    Node,
}

impl fmt::Display for SamplingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Path => "path",
            Self::Node => "node",
        })
    }
}

impl FromStr for SamplingType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "path" => Ok(Self::Path),
            "node" => Ok(Self::Node),
            other => Err(ConfigError::UnknownName {
                kind: "sampling type",
                name: other.to_string(),
            }),
        }
    }
}

/// Tie-break policy used to reconcile rounding drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundingPolicy {
    /// Remove surplus from the largest cells, add deficit to the smallest.
    #[default]
    Low,
    /// Remove surplus from the smallest cells, add deficit to the largest.
    High,
}

impl FromStr for RoundingPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "high" => Ok(Self::High),
            other => Err(ConfigError::UnknownName {
                kind: "rounding policy",
                name: other.to_string(),
            }),
        }
    }
}

/// Proportional allocation of sampling effort, normalized to sum to one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Design {
    /// `numTN x numSN` trace proportions.
    Path(Array2<f64>),
    /// Length-`numTN` test-node proportions.
    Node(Array1<f64>),
}

/// Integer number of tests per trace or per test node.
#[derive(Debug, Clone, PartialEq)]
pub enum Allocation {
    Path(Array2<f64>),
    Node(Array1<f64>),
}

impl Allocation {
    pub fn total(&self) -> f64 {
        match self {
            Self::Path(counts) => counts.sum(),
            Self::Node(counts) => counts.sum(),
        }
    }
}

impl Design {
    pub fn path(proportions: Array2<f64>) -> Result<Self, DesignError> {
        Ok(Self::Path(normalized(proportions)?))
    }

    pub fn node(proportions: Array1<f64>) -> Result<Self, DesignError> {
        Ok(Self::Node(normalized(proportions)?))
    }

    /// All tests at one test node.
    pub fn single_test_node(num_test_nodes: usize, test_node: usize) -> Result<Self, DesignError> {
        if test_node >= num_test_nodes {
            return Err(DesignError::InvalidDesign(format!(
                "test node {test_node} out of range for {num_test_nodes} test nodes"
            )));
        }
        let mut proportions = Array1::zeros(num_test_nodes);
        proportions[test_node] = 1.0;
        Ok(Self::Node(proportions))
    }

    /// All tests on one trace.
    pub fn single_trace(
        chain: SupplyChain,
        test_node: usize,
        supply_node: usize,
    ) -> Result<Self, DesignError> {
        if test_node >= chain.num_test_nodes || supply_node >= chain.num_supply_nodes {
            return Err(DesignError::InvalidDesign(format!(
                "trace ({test_node}, {supply_node}) out of range for {:?}",
                chain.trace_shape()
            )));
        }
        let mut proportions = Array2::zeros(chain.trace_shape());
        proportions[[test_node, supply_node]] = 1.0;
        Ok(Self::Path(proportions))
    }

    pub fn sampling_type(&self) -> SamplingType {
        match self {
            Self::Path(_) => SamplingType::Path,
            Self::Node(_) => SamplingType::Node,
        }
    }

    pub fn check_chain(&self, chain: SupplyChain) -> Result<(), DesignError> {
        let (expected, found) = match self {
            Self::Path(p) => (chain.trace_shape(), p.dim()),
            Self::Node(p) => ((chain.num_test_nodes, 1), (p.len(), 1)),
        };
        if expected != found {
            return Err(DesignError::ShapeMismatch { expected, found });
        }
        Ok(())
    }

    /// Test nodes receiving a positive share of the design.
    pub fn active_test_nodes(&self) -> Vec<usize> {
        match self {
            Self::Path(p) => p
                .outer_iter()
                .enumerate()
                .filter(|(_, row)| row.iter().any(|&v| v > 0.0))
                .map(|(t, _)| t)
                .collect(),
            Self::Node(p) => p
                .iter()
                .enumerate()
                .filter(|&(_, &v)| v > 0.0)
                .map(|(t, _)| t)
                .collect(),
        }
    }

    /// Integer allocation of `budget` tests.
    pub fn allocate(&self, budget: usize, policy: RoundingPolicy) -> Allocation {
        match self {
            Self::Path(p) => Allocation::Path(round_design(p, budget, policy)),
            Self::Node(p) => Allocation::Node(round_design(p, budget, policy)),
        }
    }
}

fn normalized<D: Dimension>(proportions: Array<f64, D>) -> Result<Array<f64, D>, DesignError> {
    if proportions.iter().any(|&v| !v.is_finite() || v < 0.0) {
        return Err(DesignError::InvalidDesign(
            "proportions must be finite and nonnegative".to_string(),
        ));
    }
    let total = proportions.sum();
    if total <= 0.0 {
        return Err(DesignError::InvalidDesign(
            "proportions sum to zero".to_string(),
        ));
    }
    if (total - 1.0).abs() > DESIGN_SUM_TOLERANCE {
        log::debug!("Normalizing design that sums to {total}.");
    }
    Ok(proportions / total)
}

/// Rounds `design * n` to integers that sum to exactly `n`, biased toward
/// balance: surplus is removed from the largest cells, deficit added to the
/// smallest cells that carry a positive share.
pub fn round_design_low<D: Dimension>(design: &Array<f64, D>, n: usize) -> Array<f64, D> {
    round_design(design, n, RoundingPolicy::Low)
}

/// Rounds `design * n` to integers that sum to exactly `n`, biased toward
/// concentration: surplus is removed from the smallest nonzero cells, deficit
/// added to the largest cells that carry a positive share.
pub fn round_design_high<D: Dimension>(design: &Array<f64, D>, n: usize) -> Array<f64, D> {
    round_design(design, n, RoundingPolicy::High)
}

fn round_design<D: Dimension>(
    design: &Array<f64, D>,
    n: usize,
    policy: RoundingPolicy,
) -> Array<f64, D> {
    let budget = n as f64;
    let shares: Vec<bool> = design.iter().map(|&p| p > 0.0).collect();
    let any_share = shares.iter().any(|&s| s);
    let mut counts: Vec<f64> = design
        .iter()
        .map(|&p| (p.max(0.0) * budget).round())
        .collect();
    let mut total: f64 = counts.iter().sum();

    while total > budget {
        let extreme = match policy {
            RoundingPolicy::Low => Extreme::Max,
            RoundingPolicy::High => Extreme::Min,
        };
        let Some(idx) = extreme_index(&counts, |i| counts[i] > 0.0, extreme) else {
            break;
        };
        counts[idx] -= 1.0;
        total -= 1.0;
    }
    while total < budget {
        let extreme = match policy {
            RoundingPolicy::Low => Extreme::Min,
            RoundingPolicy::High => Extreme::Max,
        };
        let Some(idx) = extreme_index(&counts, |i| shares[i] || !any_share, extreme) else {
            break;
        };
        counts[idx] += 1.0;
        total += 1.0;
    }

    let mut out = design.clone();
    for (cell, count) in out.iter_mut().zip(counts) {
        *cell = count;
    }
    out
}

#[derive(Clone, Copy)]
enum Extreme {
    Max,
    Min,
}

/// First index holding the largest (or smallest) value among cells passing `keep`.
fn extreme_index(values: &[f64], keep: impl Fn(usize) -> bool, extreme: Extreme) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, &v) in values.iter().enumerate() {
        if !keep(i) {
            continue;
        }
        best = match best {
            None => Some(i),
            Some(b) => {
                let better = match extreme {
                    Extreme::Max => v > values[b],
                    Extreme::Min => v < values[b],
                };
                if better { Some(i) } else { Some(b) }
            }
        };
    }
    best
}

/// Design that evens out the number of tests per trace once `new_tests` more
/// tests are added to the existing counts `tests`.
///
/// Each trace targets `(sum(tests) + new_tests) / numTraces` tests; traces
/// already above target get nothing.
pub fn balanced_design(tests: ArrayView2<f64>, new_tests: usize) -> Result<Design, DesignError> {
    if new_tests == 0 {
        return Err(DesignError::ZeroBudget);
    }
    if tests.is_empty() {
        return Err(DesignError::InvalidDesign(
            "the trace matrix is empty".to_string(),
        ));
    }
    let target = (tests.sum() + new_tests as f64) / tests.len() as f64;
    let needed = tests.mapv(|n| (target - n).max(0.0));
    Design::path(needed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn assert_valid_rounding<D: Dimension>(rounded: &Array<f64, D>, n: usize) {
        assert_eq!(rounded.sum(), n as f64);
        for &v in rounded.iter() {
            assert!(v >= 0.0);
            assert_eq!(v, v.round());
        }
    }

    #[test]
    fn rounding_hits_the_budget_exactly() {
        let mut rng = StdRng::seed_from_u64(21);
        for trial in 0..200 {
            let rows = 1 + trial % 4;
            let cols = 1 + (trial / 4) % 3;
            let mut raw = Array2::from_shape_fn((rows, cols), |_| rng.gen_range(0.0..1.0));
            if trial % 3 == 0 {
                raw[[0, 0]] = 0.0;
            }
            if raw.sum() == 0.0 {
                continue;
            }
            let design = raw.clone() / raw.sum();
            let n = rng.gen_range(0..60);
            assert_valid_rounding(&round_design_low(&design, n), n);
            assert_valid_rounding(&round_design_high(&design, n), n);
        }
    }

    #[test]
    fn low_rounding_balances_and_high_rounding_concentrates() {
        let design = array![1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0];
        // 3.33 each rounds to 3, one test short.
        let low = round_design_low(&design, 10);
        assert_eq!(low, array![4.0, 3.0, 3.0]);
        let high = round_design_high(&design, 10);
        assert_eq!(high, array![4.0, 3.0, 3.0]);

        let design = array![0.5, 0.25, 0.25];
        // 1.5, 0.75, 0.75 round to 2, 1, 1: one surplus.
        let low = round_design_low(&design, 3);
        assert_eq!(low, array![1.0, 1.0, 1.0]);
        let high = round_design_high(&design, 3);
        assert_eq!(high, array![2.0, 0.0, 1.0]);
    }

    #[test]
    fn deficit_goes_only_to_designed_cells() {
        let design = array![[0.0, 0.5], [0.5, 0.0]];
        // Both halves round up, leaving one surplus test.
        let rounded = round_design_low(&design, 1);
        assert_valid_rounding(&rounded, 1);
        assert_eq!(rounded[[0, 0]], 0.0);
        assert_eq!(rounded[[1, 1]], 0.0);
    }

    #[test]
    fn zero_share_cells_never_receive_the_deficit() {
        let design = array![0.0, 1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0];
        // 1.33 each rounds to 1; the unassigned cell is the lowest but stays empty.
        assert_eq!(round_design_low(&design, 4), array![0.0, 2.0, 1.0, 1.0]);
        assert_eq!(round_design_high(&design, 4), array![0.0, 2.0, 1.0, 1.0]);
    }

    #[test]
    fn half_shares_round_away_from_zero_before_reconciling() {
        let design = array![0.25, 0.25, 0.25, 0.25];
        // Every 0.5 rounds up to 1, so two tests are removed, first index first.
        assert_eq!(round_design_low(&design, 2), array![0.0, 0.0, 1.0, 1.0]);
        assert_eq!(round_design_high(&design, 2), array![0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn zero_budget_rounds_to_zero() {
        let design = array![0.2, 0.8];
        assert_eq!(round_design_low(&design, 0), array![0.0, 0.0]);
    }

    #[test]
    fn allocation_follows_design_type() {
        let design = Design::single_test_node(3, 1).unwrap();
        match design.allocate(5, RoundingPolicy::Low) {
            Allocation::Node(counts) => assert_eq!(counts, array![0.0, 5.0, 0.0]),
            Allocation::Path(_) => panic!("expected a node allocation"),
        }
        let design = Design::path(array![[0.0, 0.0], [1.0, 0.0], [0.0, 0.0]]).unwrap();
        assert_eq!(design.active_test_nodes(), vec![1]);
        assert_eq!(design.allocate(5, RoundingPolicy::High).total(), 5.0);
    }

    #[test]
    fn designs_are_normalized_and_validated() {
        let design = Design::node(array![2.0, 2.0]).unwrap();
        assert_eq!(design, Design::Node(array![0.5, 0.5]));
        assert!(Design::node(array![0.0, 0.0]).is_err());
        assert!(Design::node(array![-1.0, 2.0]).is_err());
        let chain = SupplyChain::new(3, 2);
        assert!(design.check_chain(chain).is_err());
        assert!(Design::single_trace(chain, 3, 0).is_err());
    }

    #[test]
    fn balanced_design_fills_the_emptiest_traces() {
        let tests = array![[6.0, 11.0], [12.0, 6.0], [2.0, 13.0]];
        // Target per trace: (50 + 10) / 6 = 10.
        let design = balanced_design(tests.view(), 10).unwrap();
        let Design::Path(p) = design else {
            panic!("expected a path design");
        };
        assert_abs_diff_eq!(p.sum(), 1.0, epsilon = 1e-12);
        assert_eq!(p[[0, 1]], 0.0);
        assert_eq!(p[[1, 0]], 0.0);
        assert_eq!(p[[2, 1]], 0.0);
        assert!(p[[2, 0]] > p[[0, 0]]);
        assert_abs_diff_eq!(p[[2, 0]], 8.0 / 16.0, epsilon = 1e-12);
        assert!(balanced_design(tests.view(), 0).is_err());
    }

    #[test]
    fn names_parse_strictly() {
        assert_eq!("node".parse::<SamplingType>().unwrap(), SamplingType::Node);
        assert_eq!("high".parse::<RoundingPolicy>().unwrap(), RoundingPolicy::High);
        assert!("trace".parse::<SamplingType>().is_err());
        assert!("nearest".parse::<RoundingPolicy>().is_err());
    }
}

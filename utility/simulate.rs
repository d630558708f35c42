//! Hypothetical testing data generated from a known rate vector.
//!
//! Both generators return a record of the same kind as the base data, so the
//! result can be appended to the existing counts with
//! [`TestingData::combined`] or scored on its own by the likelihood.

use crate::design::{Allocation, DesignError};
use crate::likelihood::{node_detection_probs, trace_detection_matrix};
use crate::types::{Diagnostic, SupplyChain, TestingData};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};

/// Testing context shared by every simulated outcome: what kind of record is
/// produced and how node-level tests are attributed to supply nodes.
#[derive(Debug, Clone, Copy)]
pub struct OutcomeModel<'a> {
    pub chain: SupplyChain,
    pub diagnostic: Diagnostic,
    pub sourcing: ArrayView2<'a, f64>,
    pub tracked: bool,
}

impl<'a> OutcomeModel<'a> {
    pub fn new(
        chain: SupplyChain,
        diagnostic: Diagnostic,
        sourcing: ArrayView2<'a, f64>,
        tracked: bool,
    ) -> Result<Self, DesignError> {
        if sourcing.dim() != chain.trace_shape() {
            return Err(DesignError::ShapeMismatch {
                expected: chain.trace_shape(),
                found: sourcing.dim(),
            });
        }
        Ok(Self {
            chain,
            diagnostic,
            sourcing,
            tracked,
        })
    }

    fn check_allocation(&self, allocation: &Allocation) -> Result<(), DesignError> {
        match allocation {
            Allocation::Path(counts) => {
                if counts.dim() != self.chain.trace_shape() {
                    return Err(DesignError::ShapeMismatch {
                        expected: self.chain.trace_shape(),
                        found: counts.dim(),
                    });
                }
                if !self.tracked {
                    return Err(DesignError::InvalidDesign(
                        "path sampling needs trace-level (tracked) testing data".to_string(),
                    ));
                }
            }
            Allocation::Node(counts) => {
                if counts.len() != self.chain.num_test_nodes {
                    return Err(DesignError::ShapeMismatch {
                        expected: (self.chain.num_test_nodes, 1),
                        found: (counts.len(), 1),
                    });
                }
            }
        }
        Ok(())
    }

    fn empty_record(&self) -> (Array2<f64>, Array2<f64>, Array1<f64>, Array1<f64>) {
        let shape = self.chain.trace_shape();
        let num_tn = self.chain.num_test_nodes;
        (
            Array2::zeros(shape),
            Array2::zeros(shape),
            Array1::zeros(num_tn),
            Array1::zeros(num_tn),
        )
    }

    fn finish(
        &self,
        trace_tests: Array2<f64>,
        trace_positives: Array2<f64>,
        node_tests: Array1<f64>,
        node_positives: Array1<f64>,
    ) -> TestingData {
        if self.tracked {
            TestingData::Tracked {
                tests: trace_tests,
                positives: trace_positives,
            }
        } else {
            TestingData::Untracked {
                tests: node_tests,
                positives: node_positives,
                sourcing: self.sourcing.to_owned(),
            }
        }
    }
}

/// Simulates the outcome of `allocation` one test at a time under the rates
/// `truth`.
///
/// Path allocations walk the traces in order. Node allocations draw the supply
/// node of every test from the test node's sourcing row.
pub fn simulate_data_stochastic<R: Rng + ?Sized>(
    allocation: &Allocation,
    truth: ArrayView1<f64>,
    model: &OutcomeModel<'_>,
    rng: &mut R,
) -> Result<TestingData, DesignError> {
    model.check_allocation(allocation)?;
    let probs = trace_detection_matrix(truth, model.chain, &model.diagnostic);
    let (mut trace_tests, mut trace_positives, mut node_tests, mut node_positives) =
        model.empty_record();

    match allocation {
        Allocation::Path(counts) => {
            for ((t, s), &n) in counts.indexed_iter() {
                let mut remaining = n.max(0.0).round() as usize;
                while remaining > 0 {
                    trace_tests[[t, s]] += 1.0;
                    if rng.gen_bool(probs[[t, s]]) {
                        trace_positives[[t, s]] += 1.0;
                    }
                    remaining -= 1;
                }
            }
        }
        Allocation::Node(counts) => {
            for (t, &n) in counts.iter().enumerate() {
                let mut remaining = n.max(0.0).round() as usize;
                if remaining == 0 {
                    continue;
                }
                let sourcing = WeightedIndex::new(model.sourcing.row(t).iter().copied())
                    .map_err(|e| {
                        DesignError::InvalidDesign(format!(
                            "sourcing row {t} cannot be sampled: {e}"
                        ))
                    })?;
                while remaining > 0 {
                    let s = sourcing.sample(rng);
                    let positive = rng.gen_bool(probs[[t, s]]);
                    trace_tests[[t, s]] += 1.0;
                    node_tests[t] += 1.0;
                    if positive {
                        trace_positives[[t, s]] += 1.0;
                        node_positives[t] += 1.0;
                    }
                    remaining -= 1;
                }
            }
        }
    }

    Ok(model.finish(trace_tests, trace_positives, node_tests, node_positives))
}

/// Expected outcome of `allocation` under the rates `truth`: each cell
/// receives `tests * detection probability` positives. Node allocations spread
/// their tests over supply nodes in proportion to the sourcing row.
pub fn simulate_data_expectation(
    allocation: &Allocation,
    truth: ArrayView1<f64>,
    model: &OutcomeModel<'_>,
) -> Result<TestingData, DesignError> {
    model.check_allocation(allocation)?;
    let probs = trace_detection_matrix(truth, model.chain, &model.diagnostic);
    let (mut trace_tests, mut trace_positives, mut node_tests, mut node_positives) =
        model.empty_record();

    match allocation {
        Allocation::Path(counts) => {
            trace_tests.assign(counts);
            trace_positives = counts * &probs;
        }
        Allocation::Node(counts) => {
            let node_probs =
                node_detection_probs(truth, model.chain, model.sourcing, &model.diagnostic);
            for (t, &n) in counts.iter().enumerate() {
                for s in 0..model.chain.num_supply_nodes {
                    let share = n * model.sourcing[[t, s]];
                    trace_tests[[t, s]] = share;
                    trace_positives[[t, s]] = share * probs[[t, s]];
                }
                node_tests[t] = n;
                node_positives[t] = n * node_probs[t];
            }
        }
    }

    Ok(model.finish(trace_tests, trace_positives, node_tests, node_positives))
}

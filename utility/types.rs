use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use rand::Rng;
use rand::seq::index;
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use thiserror::Error;

/// Tolerance used when checking that probability vectors sum to one.
const SIMPLEX_TOLERANCE: f64 = 1e-8;

/// Errors raised while assembling testing data or posterior draws.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("{what} has shape {found:?}, expected {expected:?}.")]
    ShapeMismatch {
        what: &'static str,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Invalid test counts: {0}")]
    InvalidCounts(String),

    #[error("Invalid sourcing matrix: {0}")]
    InvalidSourcing(String),

    #[error("Sensitivity ({sensitivity}) and specificity ({specificity}) must both lie in [0, 1].")]
    InvalidAccuracy { sensitivity: f64, specificity: f64 },

    #[error("Posterior draws are invalid: {0}")]
    InvalidDraws(String),

    #[error("Cannot combine tracked and untracked testing data.")]
    KindMismatch,
}

/// Dimensions of the two-tier supply chain.
///
/// Rate vectors are laid out supply nodes first, then test nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplyChain {
    pub num_test_nodes: usize,
    pub num_supply_nodes: usize,
}

impl SupplyChain {
    pub fn new(num_test_nodes: usize, num_supply_nodes: usize) -> Self {
        Self {
            num_test_nodes,
            num_supply_nodes,
        }
    }

    /// Length of a rate vector (`numSN + numTN`).
    pub fn num_nodes(&self) -> usize {
        self.num_test_nodes + self.num_supply_nodes
    }

    /// Column of a test node inside a rate vector.
    pub fn test_node_index(&self, test_node: usize) -> usize {
        self.num_supply_nodes + test_node
    }

    pub fn trace_shape(&self) -> (usize, usize) {
        (self.num_test_nodes, self.num_supply_nodes)
    }
}

/// Sensitivity and specificity of the field assay.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub sensitivity: f64,
    pub specificity: f64,
}

impl Diagnostic {
    pub fn new(sensitivity: f64, specificity: f64) -> Result<Self, DataError> {
        let valid = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
        if !valid(sensitivity) || !valid(specificity) {
            return Err(DataError::InvalidAccuracy {
                sensitivity,
                specificity,
            });
        }
        Ok(Self {
            sensitivity,
            specificity,
        })
    }

    /// A perfect assay: `sens = spec = 1`.
    pub fn perfect() -> Self {
        Self {
            sensitivity: 1.0,
            specificity: 1.0,
        }
    }

    /// Probability of a positive result given the consolidated SFP rate `z*`.
    #[inline]
    pub fn positive_probability(&self, consolidated: f64) -> f64 {
        let p = self.sensitivity * consolidated + (1.0 - self.specificity) * (1.0 - consolidated);
        p.clamp(0.0, 1.0)
    }
}

impl Default for Diagnostic {
    fn default() -> Self {
        Self::perfect()
    }
}

/// Sufficient statistics of the testing record.
///
/// Counts are stored as `f64` so that expected (fractional) positives can be
/// appended by the expectation-based generators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TestingData {
    /// Trace-level counts, `numTN x numSN`.
    Tracked {
        tests: Array2<f64>,
        positives: Array2<f64>,
    },
    /// Test-node-level counts with the sourcing matrix used to attribute them.
    Untracked {
        tests: Array1<f64>,
        positives: Array1<f64>,
        sourcing: Array2<f64>,
    },
}

impl TestingData {
    pub fn tracked(tests: Array2<f64>, positives: Array2<f64>) -> Result<Self, DataError> {
        if tests.dim() != positives.dim() {
            return Err(DataError::ShapeMismatch {
                what: "positives",
                expected: tests.dim(),
                found: positives.dim(),
            });
        }
        check_counts(tests.iter().copied().zip(positives.iter().copied()))?;
        Ok(Self::Tracked { tests, positives })
    }

    pub fn untracked(
        tests: Array1<f64>,
        positives: Array1<f64>,
        sourcing: Array2<f64>,
    ) -> Result<Self, DataError> {
        if tests.len() != positives.len() {
            return Err(DataError::ShapeMismatch {
                what: "positives",
                expected: (tests.len(), 1),
                found: (positives.len(), 1),
            });
        }
        if sourcing.nrows() != tests.len() {
            return Err(DataError::ShapeMismatch {
                what: "sourcing matrix",
                expected: (tests.len(), sourcing.ncols()),
                found: sourcing.dim(),
            });
        }
        check_counts(tests.iter().copied().zip(positives.iter().copied()))?;
        validate_sourcing(sourcing.view())?;
        Ok(Self::Untracked {
            tests,
            positives,
            sourcing,
        })
    }

    /// Empty record of the same kind and shape.
    pub fn empty_like(&self) -> Self {
        match self {
            Self::Tracked { tests, .. } => Self::Tracked {
                tests: Array2::zeros(tests.dim()),
                positives: Array2::zeros(tests.dim()),
            },
            Self::Untracked {
                tests, sourcing, ..
            } => Self::Untracked {
                tests: Array1::zeros(tests.len()),
                positives: Array1::zeros(tests.len()),
                sourcing: sourcing.clone(),
            },
        }
    }

    pub fn supply_chain(&self) -> SupplyChain {
        match self {
            Self::Tracked { tests, .. } => SupplyChain::new(tests.nrows(), tests.ncols()),
            Self::Untracked { sourcing, .. } => {
                SupplyChain::new(sourcing.nrows(), sourcing.ncols())
            }
        }
    }

    pub fn total_tests(&self) -> f64 {
        match self {
            Self::Tracked { tests, .. } => tests.sum(),
            Self::Untracked { tests, .. } => tests.sum(),
        }
    }

    pub fn total_positives(&self) -> f64 {
        match self {
            Self::Tracked { positives, .. } => positives.sum(),
            Self::Untracked { positives, .. } => positives.sum(),
        }
    }

    pub fn is_tracked(&self) -> bool {
        matches!(self, Self::Tracked { .. })
    }

    /// Appends `other`'s counts to this record. Untracked records keep this
    /// record's sourcing matrix.
    pub fn combined(&self, other: &TestingData) -> Result<TestingData, DataError> {
        match (self, other) {
            (
                Self::Tracked { tests, positives },
                Self::Tracked {
                    tests: new_tests,
                    positives: new_positives,
                },
            ) => {
                if tests.dim() != new_tests.dim() {
                    return Err(DataError::ShapeMismatch {
                        what: "appended tests",
                        expected: tests.dim(),
                        found: new_tests.dim(),
                    });
                }
                Ok(Self::Tracked {
                    tests: tests + new_tests,
                    positives: positives + new_positives,
                })
            }
            (
                Self::Untracked {
                    tests,
                    positives,
                    sourcing,
                },
                Self::Untracked {
                    tests: new_tests,
                    positives: new_positives,
                    ..
                },
            ) => {
                if tests.len() != new_tests.len() {
                    return Err(DataError::ShapeMismatch {
                        what: "appended tests",
                        expected: (tests.len(), 1),
                        found: (new_tests.len(), 1),
                    });
                }
                Ok(Self::Untracked {
                    tests: tests + new_tests,
                    positives: positives + new_positives,
                    sourcing: sourcing.clone(),
                })
            }
            _ => Err(DataError::KindMismatch),
        }
    }
}

fn check_counts(pairs: impl Iterator<Item = (f64, f64)>) -> Result<(), DataError> {
    for (n, y) in pairs {
        if !n.is_finite() || !y.is_finite() || n < 0.0 || y < 0.0 {
            return Err(DataError::InvalidCounts(format!(
                "counts must be finite and nonnegative, got tests={n}, positives={y}"
            )));
        }
        if y > n + 1e-9 {
            return Err(DataError::InvalidCounts(format!(
                "positives ({y}) exceed tests ({n})"
            )));
        }
    }
    Ok(())
}

/// Checks that `sourcing` is row-stochastic.
pub fn validate_sourcing(sourcing: ArrayView2<f64>) -> Result<(), DataError> {
    for (t, row) in sourcing.axis_iter(Axis(0)).enumerate() {
        if row.iter().any(|&q| !q.is_finite() || q < 0.0) {
            return Err(DataError::InvalidSourcing(format!(
                "row {t} has negative or non-finite entries"
            )));
        }
        let total = row.sum();
        if (total - 1.0).abs() > SIMPLEX_TOLERANCE {
            return Err(DataError::InvalidSourcing(format!(
                "row {t} sums to {total}, expected 1"
            )));
        }
    }
    Ok(())
}

/// Estimates the sourcing matrix from trace-level test counts by normalizing
/// each row. Test nodes without any tests get a uniform row.
pub fn estimate_sourcing(tests: ArrayView2<f64>) -> Array2<f64> {
    let mut sourcing = tests.to_owned();
    let num_supply = tests.ncols().max(1) as f64;
    for mut row in sourcing.axis_iter_mut(Axis(0)) {
        let total = row.sum();
        if total > 0.0 {
            row /= total;
        } else {
            row.fill(1.0 / num_supply);
        }
    }
    sourcing
}

/// Empirical posterior over SFP rates: one rate vector per row.
#[derive(Debug, Clone, PartialEq)]
pub struct PosteriorDraws {
    draws: Array2<f64>,
    chain: SupplyChain,
}

impl PosteriorDraws {
    /// Wraps rate-space draws. Every entry must lie in `[0, 1]`.
    pub fn new(draws: Array2<f64>, chain: SupplyChain) -> Result<Self, DataError> {
        if draws.ncols() != chain.num_nodes() {
            return Err(DataError::ShapeMismatch {
                what: "posterior draws",
                expected: (draws.nrows(), chain.num_nodes()),
                found: draws.dim(),
            });
        }
        if draws.nrows() == 0 {
            return Err(DataError::InvalidDraws("the draw set is empty".to_string()));
        }
        if let Some(bad) = draws
            .iter()
            .find(|&&v| !v.is_finite() || !(0.0..=1.0).contains(&v))
        {
            return Err(DataError::InvalidDraws(format!(
                "rate {bad} lies outside [0, 1]; use `from_logit` for logit-scale draws"
            )));
        }
        Ok(Self { draws, chain })
    }

    /// Wraps draws produced on the logit scale.
    pub fn from_logit(logit_draws: Array2<f64>, chain: SupplyChain) -> Result<Self, DataError> {
        let rates = logit_draws.mapv(|v| 1.0 / (1.0 + f64::exp(-v.clamp(-700.0, 700.0))));
        Self::new(rates, chain)
    }

    pub fn len(&self) -> usize {
        self.draws.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.draws.nrows() == 0
    }

    pub fn chain(&self) -> SupplyChain {
        self.chain
    }

    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.draws.view()
    }

    pub fn draw(&self, index: usize) -> ArrayView1<'_, f64> {
        self.draws.row(index)
    }

    pub fn supply_rates(&self) -> ArrayView2<'_, f64> {
        self.draws.slice(s![.., ..self.chain.num_supply_nodes])
    }

    pub fn test_rates(&self) -> ArrayView2<'_, f64> {
        self.draws.slice(s![.., self.chain.num_supply_nodes..])
    }

    pub fn into_inner(self) -> Array2<f64> {
        self.draws
    }

    /// Rows at `indices`, in order.
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            draws: self.draws.select(Axis(0), indices),
            chain: self.chain,
        }
    }

    /// Random subset of `n` draws, without replacement. Returns a clone when
    /// `n` covers the whole set.
    pub fn subsample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Self {
        if n >= self.len() {
            return self.clone();
        }
        let indices = index::sample(rng, self.len(), n).into_vec();
        self.select(&indices)
    }
}

impl Deref for PosteriorDraws {
    type Target = Array2<f64>;

    fn deref(&self) -> &Self::Target {
        &self.draws
    }
}

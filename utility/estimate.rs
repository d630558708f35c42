// utility/estimate.rs

//! Design-utility estimation: the expected posterior loss after a design's
//! worth of new tests, without collecting them.
//!
//! Every method averages the loss of a Bayes estimate over hypothetical
//! outcomes of the design. They differ in how the post-test posterior is
//! obtained:
//!
//! * [`EstimationMethod::Mcmc`] and [`EstimationMethod::McmcExpect`] re-run the
//!   external sampler on the augmented data, with simulated or expected
//!   positives respectively.
//! * The importance methods reweight the existing draws by the likelihood of
//!   each hypothetical outcome. `ImportanceEnumerate` walks every outcome
//!   exactly, `ImportanceSample` draws outcomes at random, and
//!   `ImportanceLossMatrix` additionally restricts the estimate to a candidate
//!   draw and reads its loss from a precomputed matrix.
//!
//! Scenario seeds are drawn up front from a generator seeded with
//! [`UtilityOptions::seed`], so results do not depend on the number of worker
//! threads. Every design evaluated by the same estimator sees the same
//! scenario seeds.

use crate::bayes::{
    BayesError, bayes_estimate, bayes_estimate_weighted, bayes_estimate_weighted_batch,
};
use crate::config::ConfigError;
use crate::design::{Allocation, Design, DesignError, RoundingPolicy, SamplingType};
use crate::enumerate::{
    MAX_ENUMERATED_OUTCOMES, compositions, enumerate_outcomes, multinomial_ln_pmf, outcome_count,
};
use crate::likelihood::{
    LikelihoodError, effective_sample_size, importance_weights, log_likelihood_batch, log_mean_exp,
};
use crate::loss::{DrawLoss, LossSpec, build_loss_matrix};
use crate::marginal::AllocationError;
use crate::sampler::{PosteriorSampler, SamplerError, sample_checked};
use crate::simulate::{OutcomeModel, simulate_data_expectation, simulate_data_stochastic};
use crate::types::{
    DataError, Diagnostic, PosteriorDraws, SupplyChain, TestingData, estimate_sourcing,
    validate_sourcing,
};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Two-sided 95% normal quantile used for Monte Carlo half-widths.
const Z_95: f64 = 1.959_963_984_540_054;

/// Effective sample size, as a fraction of the draw count, below which the
/// importance weights of a scenario are reported as collapsed.
const LOW_ESS_FRACTION: f64 = 0.01;

/// Mixed into the seed of the Bayes-candidate subset so it is drawn
/// independently of the truth subset and the scenario seeds.
const CANDIDATE_STREAM: u64 = 0x9E37_79B9_7F4A_7C15;

#[derive(Error, Debug)]
pub enum EstimationError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Design(#[from] DesignError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Likelihood(#[from] LikelihoodError),
    #[error(transparent)]
    Bayes(#[from] BayesError),
    #[error(transparent)]
    Sampler(#[from] SamplerError),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error("Method '{method}' re-runs inference and needs a posterior sampler.")]
    MissingSampler { method: EstimationMethod },
    #[error("Requested {requested} {what}, but only {available} posterior draws are available.")]
    SubsetTooLarge {
        what: &'static str,
        requested: usize,
        available: usize,
    },
    #[error("Loss matrix covers {found} truth draws, but the belief state holds {expected}.")]
    LossMatrixMismatch { found: usize, expected: usize },
}

// =============================================================================
// Methods and Options
// =============================================================================

/// Strategy used to approximate the post-test posterior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EstimationMethod {
    #[serde(rename = "MCMC")]
    Mcmc,
    #[serde(rename = "MCMCexpect")]
    McmcExpect,
    #[serde(rename = "importance_enumerate")]
    ImportanceEnumerate,
    #[serde(rename = "importance_sample")]
    ImportanceSample,
    #[default]
    #[serde(rename = "importance_loss_matrix")]
    ImportanceLossMatrix,
}

impl EstimationMethod {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Mcmc => "MCMC",
            Self::McmcExpect => "MCMCexpect",
            Self::ImportanceEnumerate => "importance_enumerate",
            Self::ImportanceSample => "importance_sample",
            Self::ImportanceLossMatrix => "importance_loss_matrix",
        }
    }

    /// Whether the method calls the external sampler once per scenario.
    pub fn needs_sampler(&self) -> bool {
        matches!(self, Self::Mcmc | Self::McmcExpect)
    }
}

impl fmt::Display for EstimationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EstimationMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MCMC" => Ok(Self::Mcmc),
            "MCMCexpect" => Ok(Self::McmcExpect),
            "importance_enumerate" => Ok(Self::ImportanceEnumerate),
            "importance_sample" => Ok(Self::ImportanceSample),
            "importance_loss_matrix" => Ok(Self::ImportanceLossMatrix),
            other => Err(ConfigError::UnknownName {
                kind: "estimation method",
                name: other.to_string(),
            }),
        }
    }
}

/// Knobs shared by every estimation method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UtilityOptions {
    /// Hypothetical outcomes averaged per design (ignored by exact enumeration).
    pub num_scenarios: usize,
    /// Kind of single-node designs generated for marginal-utility sweeps.
    pub sampling: SamplingType,
    pub rounding: RoundingPolicy,
    pub method: EstimationMethod,
    /// Draws used as candidate truths when generating outcomes; all when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_truth_draws: Option<usize>,
    /// Estimate candidates (loss-matrix rows); all draws when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_bayes_draws: Option<usize>,
    /// Draws requested from the sampler by the re-inference methods.
    pub num_posterior_draws: usize,
    pub seed: u64,
}

impl Default for UtilityOptions {
    fn default() -> Self {
        Self {
            num_scenarios: 100,
            sampling: SamplingType::Node,
            rounding: RoundingPolicy::Low,
            method: EstimationMethod::ImportanceLossMatrix,
            num_truth_draws: None,
            num_bayes_draws: None,
            num_posterior_draws: 1000,
            seed: 0,
        }
    }
}

impl UtilityOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |parameter: &'static str, value: usize| {
            if value == 0 {
                Err(ConfigError::InvalidParameter {
                    parameter,
                    value: 0.0,
                    requirement: "must be positive",
                })
            } else {
                Ok(())
            }
        };
        positive("num_scenarios", self.num_scenarios)?;
        positive("num_posterior_draws", self.num_posterior_draws)?;
        if let Some(n) = self.num_truth_draws {
            positive("num_truth_draws", n)?;
        }
        if let Some(n) = self.num_bayes_draws {
            positive("num_bayes_draws", n)?;
        }
        Ok(())
    }
}

// =============================================================================
// Belief State and Loss Estimates
// =============================================================================

/// Current beliefs: posterior draws, the data they condition on, the assay,
/// and the sourcing matrix used to attribute node-level tests.
#[derive(Debug, Clone)]
pub struct BeliefState {
    pub draws: PosteriorDraws,
    pub data: TestingData,
    pub diagnostic: Diagnostic,
    sourcing: Array2<f64>,
}

impl BeliefState {
    /// Tracked data derive their sourcing matrix from the trace counts.
    pub fn new(
        draws: PosteriorDraws,
        data: TestingData,
        diagnostic: Diagnostic,
    ) -> Result<Self, EstimationError> {
        let chain = data.supply_chain();
        if draws.chain() != chain {
            return Err(DataError::ShapeMismatch {
                what: "posterior draws",
                expected: (draws.len(), chain.num_nodes()),
                found: draws.dim(),
            }
            .into());
        }
        let sourcing = match &data {
            TestingData::Tracked { tests, .. } => estimate_sourcing(tests.view()),
            TestingData::Untracked { sourcing, .. } => sourcing.clone(),
        };
        Ok(Self {
            draws,
            data,
            diagnostic,
            sourcing,
        })
    }

    /// Replaces the estimated sourcing matrix of tracked data with a known one.
    pub fn with_sourcing(mut self, sourcing: Array2<f64>) -> Result<Self, EstimationError> {
        if !self.data.is_tracked() {
            return Err(DataError::InvalidSourcing(
                "untracked data carry their own sourcing matrix".to_string(),
            )
            .into());
        }
        let chain = self.chain();
        if sourcing.dim() != chain.trace_shape() {
            return Err(DataError::ShapeMismatch {
                what: "sourcing matrix",
                expected: chain.trace_shape(),
                found: sourcing.dim(),
            }
            .into());
        }
        validate_sourcing(sourcing.view())?;
        self.sourcing = sourcing;
        Ok(self)
    }

    pub fn chain(&self) -> SupplyChain {
        self.draws.chain()
    }

    pub fn sourcing(&self) -> ArrayView2<'_, f64> {
        self.sourcing.view()
    }

    pub fn outcome_model(&self) -> Result<OutcomeModel<'_>, DesignError> {
        OutcomeModel::new(
            self.chain(),
            self.diagnostic,
            self.sourcing.view(),
            self.data.is_tracked(),
        )
    }
}

/// Expected loss of a design with its Monte Carlo uncertainty.
#[derive(Debug, Clone, PartialEq)]
pub struct LossEstimate {
    pub mean: f64,
    /// Half-width of the 95% normal interval; zero for exact enumeration.
    pub half_width: f64,
    /// Loss of every scenario, or of every enumerated outcome.
    pub scenario_losses: Array1<f64>,
}

impl LossEstimate {
    pub fn from_scenarios(scenario_losses: Array1<f64>) -> Self {
        let n = scenario_losses.len();
        let mean = scenario_losses.mean().unwrap_or(f64::NAN);
        let half_width = if n > 1 {
            Z_95 * scenario_losses.std(1.0) / (n as f64).sqrt()
        } else {
            0.0
        };
        Self {
            mean,
            half_width,
            scenario_losses,
        }
    }

    pub fn exact(mean: f64, scenario_losses: Array1<f64>) -> Self {
        Self {
            mean,
            half_width: 0.0,
            scenario_losses,
        }
    }

    pub fn interval(&self) -> (f64, f64) {
        (self.mean - self.half_width, self.mean + self.half_width)
    }
}

/// Loss of estimate-candidate draws (rows) against every draw (columns).
#[derive(Debug, Clone)]
pub struct LossMatrix {
    matrix: Array2<f64>,
    estimate_indices: Vec<usize>,
}

impl LossMatrix {
    pub fn build(
        draws: &PosteriorDraws,
        loss: &LossSpec,
        estimate_indices: Vec<usize>,
    ) -> Result<Self, ConfigError> {
        let matrix = build_loss_matrix(draws.view(), loss, Some(&estimate_indices))?;
        Ok(Self {
            matrix,
            estimate_indices,
        })
    }

    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.matrix.view()
    }

    pub fn estimate_indices(&self) -> &[usize] {
        &self.estimate_indices
    }

    pub fn num_truth_draws(&self) -> usize {
        self.matrix.ncols()
    }

    /// For each weight column, the smallest weighted mean loss over the
    /// candidate rows: `min_i (L W)[i, m] / sum(W[:, m])`.
    pub fn min_weighted_losses(&self, weights: ArrayView2<f64>) -> Array1<f64> {
        let totals = weights.sum_axis(Axis(0));
        let products = self.matrix.dot(&weights);
        Array1::from_shape_fn(weights.ncols(), |m| {
            let best = products
                .column(m)
                .iter()
                .copied()
                .fold(f64::INFINITY, f64::min);
            best / totals[m]
        })
    }
}

// =============================================================================
// Design-Utility Estimator
// =============================================================================

/// Evaluates designs against one belief state, loss and option set.
pub struct UtilityEstimator<'a> {
    state: &'a BeliefState,
    loss: &'a LossSpec,
    options: &'a UtilityOptions,
    sampler: Option<&'a dyn PosteriorSampler>,
    loss_matrix: Option<LossMatrix>,
}

impl<'a> UtilityEstimator<'a> {
    /// Validates the inputs. The loss-matrix method builds its matrix here.
    pub fn new(
        state: &'a BeliefState,
        loss: &'a LossSpec,
        options: &'a UtilityOptions,
    ) -> Result<Self, EstimationError> {
        let mut estimator = Self::unprepared(state, loss, options)?;
        if options.method == EstimationMethod::ImportanceLossMatrix {
            estimator.loss_matrix = Some(estimator.build_loss_matrix()?);
        }
        Ok(estimator)
    }

    /// Reuses a loss matrix built earlier for the same draws and loss.
    pub fn with_loss_matrix(
        state: &'a BeliefState,
        loss: &'a LossSpec,
        options: &'a UtilityOptions,
        loss_matrix: LossMatrix,
    ) -> Result<Self, EstimationError> {
        if loss_matrix.num_truth_draws() != state.draws.len() {
            return Err(EstimationError::LossMatrixMismatch {
                found: loss_matrix.num_truth_draws(),
                expected: state.draws.len(),
            });
        }
        let mut estimator = Self::unprepared(state, loss, options)?;
        estimator.loss_matrix = Some(loss_matrix);
        Ok(estimator)
    }

    fn unprepared(
        state: &'a BeliefState,
        loss: &'a LossSpec,
        options: &'a UtilityOptions,
    ) -> Result<Self, EstimationError> {
        loss.validate()?;
        loss.market_weights(state.chain().num_nodes())?;
        options.validate()?;
        let available = state.draws.len();
        for (what, requested) in [
            ("truth draws", options.num_truth_draws),
            ("Bayes-candidate draws", options.num_bayes_draws),
        ] {
            if let Some(requested) = requested.filter(|&n| n > available) {
                return Err(EstimationError::SubsetTooLarge {
                    what,
                    requested,
                    available,
                });
            }
        }
        Ok(Self {
            state,
            loss,
            options,
            sampler: None,
            loss_matrix: None,
        })
    }

    pub fn with_sampler(mut self, sampler: &'a dyn PosteriorSampler) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn state(&self) -> &BeliefState {
        self.state
    }

    pub fn options(&self) -> &UtilityOptions {
        self.options
    }

    pub fn loss_matrix(&self) -> Option<&LossMatrix> {
        self.loss_matrix.as_ref()
    }

    fn build_loss_matrix(&self) -> Result<LossMatrix, EstimationError> {
        let k = self.state.draws.len();
        let indices = match self.options.num_bayes_draws {
            Some(n) if n < k => {
                let mut rng = StdRng::seed_from_u64(self.options.seed ^ CANDIDATE_STREAM);
                let mut indices = index::sample(&mut rng, k, n).into_vec();
                indices.sort_unstable();
                indices
            }
            _ => (0..k).collect(),
        };
        Ok(LossMatrix::build(&self.state.draws, self.loss, indices)?)
    }

    /// Expected loss with no additional tests, using the same estimate rule as
    /// the configured method.
    pub fn baseline(&self) -> Result<LossEstimate, EstimationError> {
        let draws = self.state.draws.view();
        let mean = match self.options.method {
            EstimationMethod::Mcmc | EstimationMethod::McmcExpect => {
                let est = bayes_estimate(draws, &self.loss.score)?;
                DrawLoss::new(self.loss, draws)?.expected(est.view(), None)
            }
            EstimationMethod::ImportanceEnumerate | EstimationMethod::ImportanceSample => {
                let weights = Array1::ones(draws.nrows());
                let est = bayes_estimate_weighted(draws, weights.view(), &self.loss.score)?;
                DrawLoss::new(self.loss, draws)?.expected(est.view(), None)
            }
            EstimationMethod::ImportanceLossMatrix => {
                let weights = Array2::ones((draws.nrows(), 1));
                self.matrix()?.min_weighted_losses(weights.view())[0]
            }
        };
        Ok(LossEstimate::exact(mean, Array1::from_elem(1, mean)))
    }

    /// Expected loss after allocating `budget` tests according to `design`.
    pub fn estimate(&self, design: &Design, budget: usize) -> Result<LossEstimate, EstimationError> {
        design.check_chain(self.state.chain())?;
        let allocation = design.allocate(budget, self.options.rounding);
        log::debug!(
            "Rounded {} design for budget {budget}: {:?}",
            design.sampling_type(),
            allocation
        );
        if allocation.total() == 0.0 {
            return self.baseline();
        }

        let method = self.options.method;
        log::info!(
            "Estimating design loss with {method}: {} sampling, budget {budget}, {} scenarios.",
            design.sampling_type(),
            self.options.num_scenarios
        );
        let mut rng = StdRng::seed_from_u64(self.options.seed);
        let estimate = match method {
            EstimationMethod::Mcmc => self.estimate_reinference(&allocation, false, &mut rng)?,
            EstimationMethod::McmcExpect => self.estimate_reinference(&allocation, true, &mut rng)?,
            EstimationMethod::ImportanceEnumerate => self.estimate_enumerated(design, &allocation)?,
            EstimationMethod::ImportanceSample => self.estimate_sampled(&allocation, &mut rng)?,
            EstimationMethod::ImportanceLossMatrix => {
                let weights = self.sampled_weights(&allocation, &mut rng)?;
                LossEstimate::from_scenarios(self.matrix()?.min_weighted_losses(weights.view()))
            }
        };
        log::info!(
            "{method} loss at budget {budget}: {:.6} ± {:.6}",
            estimate.mean,
            estimate.half_width
        );
        Ok(estimate)
    }

    pub fn estimate_designs(
        &self,
        designs: &[Design],
        budget: usize,
    ) -> Result<Vec<LossEstimate>, EstimationError> {
        designs
            .iter()
            .map(|design| self.estimate(design, budget))
            .collect()
    }

    fn matrix(&self) -> Result<&LossMatrix, EstimationError> {
        match &self.loss_matrix {
            Some(matrix) => Ok(matrix),
            None => Err(EstimationError::LossMatrixMismatch {
                found: 0,
                expected: self.state.draws.len(),
            }),
        }
    }

    fn truth_indices(&self, rng: &mut StdRng) -> Vec<usize> {
        let k = self.state.draws.len();
        match self.options.num_truth_draws {
            Some(n) if n < k => index::sample(rng, k, n).into_vec(),
            _ => (0..k).collect(),
        }
    }

    fn scenario_seeds(&self, rng: &mut StdRng) -> Vec<u64> {
        (0..self.options.num_scenarios).map(|_| rng.r#gen()).collect()
    }

    /// Simulate, re-run the sampler on the augmented data, score the new
    /// posterior's Bayes estimate against the new posterior.
    fn estimate_reinference(
        &self,
        allocation: &Allocation,
        expectation: bool,
        rng: &mut StdRng,
    ) -> Result<LossEstimate, EstimationError> {
        let method = self.options.method;
        let sampler = self
            .sampler
            .ok_or(EstimationError::MissingSampler { method })?;
        let truths = self.truth_indices(rng);
        let seeds = self.scenario_seeds(rng);
        let model = self.state.outcome_model()?;

        let losses: Vec<f64> = seeds
            .par_iter()
            .map(|&seed| -> Result<f64, EstimationError> {
                let mut rng = StdRng::seed_from_u64(seed);
                let truth = self.state.draws.draw(truths[rng.gen_range(0..truths.len())]);
                let new_data = if expectation {
                    simulate_data_expectation(allocation, truth, &model)?
                } else {
                    simulate_data_stochastic(allocation, truth, &model, &mut rng)?
                };
                let combined = self.state.data.combined(&new_data)?;
                let posterior = sample_checked(
                    sampler,
                    &combined,
                    self.options.num_posterior_draws,
                    &mut rng,
                )?;
                let est = bayes_estimate(posterior.view(), &self.loss.score)?;
                Ok(DrawLoss::new(self.loss, posterior.view())?.expected(est.view(), None))
            })
            .collect::<Result<_, _>>()?;
        Ok(LossEstimate::from_scenarios(Array1::from_vec(losses)))
    }

    fn outcome_weights(&self, new_data: &TestingData) -> Result<Array1<f64>, EstimationError> {
        let ll = log_likelihood_batch(new_data, self.state.draws.view(), &self.state.diagnostic)?;
        Ok(importance_weights(ll.view())?)
    }

    /// Importance weights of every draw under one simulated outcome per
    /// scenario, `(draws, scenarios)`.
    fn sampled_weights(
        &self,
        allocation: &Allocation,
        rng: &mut StdRng,
    ) -> Result<Array2<f64>, EstimationError> {
        let truths = self.truth_indices(rng);
        let seeds = self.scenario_seeds(rng);
        let model = self.state.outcome_model()?;

        let columns: Vec<Array1<f64>> = seeds
            .par_iter()
            .map(|&seed| -> Result<Array1<f64>, EstimationError> {
                let mut rng = StdRng::seed_from_u64(seed);
                let truth = self.state.draws.draw(truths[rng.gen_range(0..truths.len())]);
                let new_data = simulate_data_stochastic(allocation, truth, &model, &mut rng)?;
                self.outcome_weights(&new_data)
            })
            .collect::<Result<_, _>>()?;

        let mut weights = Array2::zeros((self.state.draws.len(), columns.len()));
        for (mut column, w) in weights.axis_iter_mut(Axis(1)).zip(columns) {
            column.assign(&w);
        }
        report_effective_sample_sizes(weights.view());
        Ok(weights)
    }

    fn estimate_sampled(
        &self,
        allocation: &Allocation,
        rng: &mut StdRng,
    ) -> Result<LossEstimate, EstimationError> {
        let draws = self.state.draws.view();
        let weights = self.sampled_weights(allocation, rng)?;
        let estimates = bayes_estimate_weighted_batch(draws, weights.view(), &self.loss.score)?;
        let evaluator = DrawLoss::new(self.loss, draws)?;
        let losses: Vec<f64> = (0..weights.ncols())
            .into_par_iter()
            .map(|m| evaluator.expected(estimates.row(m), Some(weights.column(m))))
            .collect();
        Ok(LossEstimate::from_scenarios(Array1::from_vec(losses)))
    }

    /// Exact expectation over every outcome of the allocation.
    fn estimate_enumerated(
        &self,
        design: &Design,
        allocation: &Allocation,
    ) -> Result<LossEstimate, EstimationError> {
        if let Design::Node(_) = design {
            let nodes = design.active_test_nodes();
            if nodes.len() > 1 {
                return Err(DesignError::MultipleTestNodes { nodes }.into());
            }
        }
        let (log_probs, weights) = self.enumerated_weights(allocation)?;
        let draws = self.state.draws.view();
        let estimates = bayes_estimate_weighted_batch(draws, weights.view(), &self.loss.score)?;
        let evaluator = DrawLoss::new(self.loss, draws)?;
        let losses: Array1<f64> = (0..weights.ncols())
            .into_par_iter()
            .map(|m| evaluator.expected(estimates.row(m), Some(weights.column(m))))
            .collect::<Vec<f64>>()
            .into();

        let probs = log_probs.mapv(f64::exp);
        let total = probs.sum();
        log::debug!(
            "Enumerated {} outcomes with total probability {total:.12}.",
            probs.len()
        );
        Ok(LossEstimate::exact(probs.dot(&losses) / total, losses))
    }

    /// Log-probability and importance weights of every possible outcome.
    /// Outcomes that no draw can produce are dropped.
    fn enumerated_weights(
        &self,
        allocation: &Allocation,
    ) -> Result<(Array1<f64>, Array2<f64>), EstimationError> {
        let outcomes = self.enumerate_new_data(allocation)?;
        let draws = self.state.draws.view();
        let diagnostic = self.state.diagnostic;

        let evaluated: Vec<(f64, Array1<f64>)> = outcomes
            .par_iter()
            .map(|(ln_assignment, data)| -> Result<(f64, Array1<f64>), EstimationError> {
                let ll = log_likelihood_batch(data, draws, &diagnostic)?;
                Ok((ln_assignment + log_mean_exp(ll.view()), ll))
            })
            .collect::<Result<_, _>>()?;

        let kept: Vec<(f64, Array1<f64>)> = evaluated
            .into_iter()
            .filter(|(ln_prob, _)| ln_prob.is_finite())
            .collect();
        let mut log_probs = Array1::zeros(kept.len());
        let mut weights = Array2::zeros((draws.nrows(), kept.len()));
        for (m, (ln_prob, ll)) in kept.into_iter().enumerate() {
            log_probs[m] = ln_prob;
            weights.column_mut(m).assign(&importance_weights(ll.view())?);
        }
        Ok((log_probs, weights))
    }

    /// Every possible new record, paired with the log-probability of its
    /// supply-node assignment (zero when the assignment is fixed).
    fn enumerate_new_data(
        &self,
        allocation: &Allocation,
    ) -> Result<Vec<(f64, TestingData)>, EstimationError> {
        match (allocation, &self.state.data) {
            (Allocation::Path(counts), TestingData::Tracked { .. }) => {
                Ok(enumerate_outcomes(counts)?
                    .into_iter()
                    .map(|positives| {
                        let data = TestingData::Tracked {
                            tests: counts.clone(),
                            positives,
                        };
                        (0.0, data)
                    })
                    .collect())
            }
            (Allocation::Path(_), TestingData::Untracked { .. }) => Err(DesignError::InvalidDesign(
                "path sampling needs trace-level (tracked) testing data".to_string(),
            )
            .into()),
            (Allocation::Node(counts), TestingData::Untracked { sourcing, .. }) => {
                Ok(enumerate_outcomes(counts)?
                    .into_iter()
                    .map(|positives| {
                        let data = TestingData::Untracked {
                            tests: counts.clone(),
                            positives,
                            sourcing: sourcing.clone(),
                        };
                        (0.0, data)
                    })
                    .collect())
            }
            (Allocation::Node(counts), TestingData::Tracked { .. }) => {
                self.enumerate_sourced_data(counts)
            }
        }
    }

    /// Node tests on tracked data: every split of the tests across supply
    /// nodes, weighted by its multinomial probability under the sourcing row,
    /// crossed with every outcome of that split.
    fn enumerate_sourced_data(
        &self,
        counts: &Array1<f64>,
    ) -> Result<Vec<(f64, TestingData)>, EstimationError> {
        let chain = self.state.chain();
        let Some(test_node) = counts.iter().position(|&n| n > 0.0) else {
            return Ok(Vec::new());
        };
        let n = counts[test_node].round() as usize;
        let sourcing_row = self.sourcing_row(test_node);
        let splits = compositions(chain.num_supply_nodes, n)?;

        let total: u128 = splits
            .iter()
            .map(|split| {
                let row = Array1::from_iter(split.iter().map(|&c| c as f64));
                outcome_count(&row)
            })
            .fold(0u128, |acc, k| acc.saturating_add(k));
        if total > MAX_ENUMERATED_OUTCOMES {
            return Err(DesignError::EnumerationTooLarge {
                count: total,
                limit: MAX_ENUMERATED_OUTCOMES,
            }
            .into());
        }

        let mut out = Vec::new();
        for split in splits {
            let ln_split = multinomial_ln_pmf(&split, sourcing_row.view());
            if !ln_split.is_finite() {
                continue;
            }
            let row = Array1::from_iter(split.iter().map(|&c| c as f64));
            let mut tests = Array2::zeros(chain.trace_shape());
            tests.row_mut(test_node).assign(&row);
            for outcome in enumerate_outcomes(&row)? {
                let mut positives = Array2::zeros(chain.trace_shape());
                positives.row_mut(test_node).assign(&outcome);
                out.push((
                    ln_split,
                    TestingData::Tracked {
                        tests: tests.clone(),
                        positives,
                    },
                ));
            }
        }
        Ok(out)
    }

    fn sourcing_row(&self, test_node: usize) -> Array1<f64> {
        self.state.sourcing.row(test_node).to_owned()
    }
}

// =============================================================================
// Diagnostics and Entry Points
// =============================================================================

fn report_effective_sample_sizes(weights: ArrayView2<f64>) {
    let k = weights.nrows() as f64;
    let sizes: Vec<f64> = weights
        .axis_iter(Axis(1))
        .map(effective_sample_size)
        .collect();
    if sizes.is_empty() {
        return;
    }
    let mean = sizes.iter().sum::<f64>() / sizes.len() as f64;
    log::debug!("Mean importance-weight effective sample size: {mean:.1} of {k} draws.");
    let collapsed = sizes.iter().filter(|&&s| s < LOW_ESS_FRACTION * k).count();
    if collapsed > 0 {
        log::warn!(
            "{collapsed} of {} scenarios have an effective sample size below {:.0}% of the draws; the loss estimate may be unreliable. Consider more draws or a smaller budget.",
            sizes.len(),
            LOW_ESS_FRACTION * 100.0
        );
    }
}

/// Expected loss of each design after `budget` additional tests.
pub fn estimate_design_utility(
    state: &BeliefState,
    loss: &LossSpec,
    designs: &[Design],
    budget: usize,
    options: &UtilityOptions,
    sampler: Option<&dyn PosteriorSampler>,
) -> Result<Vec<LossEstimate>, EstimationError> {
    let mut estimator = UtilityEstimator::new(state, loss, options)?;
    if let Some(sampler) = sampler {
        estimator = estimator.with_sampler(sampler);
    }
    estimator.estimate_designs(designs, budget)
}

/// Expected loss with no additional tests.
pub fn baseline_loss(
    state: &BeliefState,
    loss: &LossSpec,
    options: &UtilityOptions,
) -> Result<LossEstimate, EstimationError> {
    UtilityEstimator::new(state, loss, options)?.baseline()
}

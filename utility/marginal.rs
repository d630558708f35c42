// utility/marginal.rs

//! Marginal utility curves and the allocation of a fixed test budget across
//! designs.
//!
//! A [`UtilityGrid`] stores, for each design, the estimated loss reduction
//! relative to the zero-test baseline at evenly spaced budgets. The grid is a
//! noisy sample of a presumed-monotone curve; it is stored as estimated and
//! never smoothed or clamped.
//!
//! [`optimal_allocation`] maximizes the sum of the per-design piecewise-linear
//! interpolants subject to the budget. The greedy solution seeds a BFGS
//! refinement of a smoothed, penalized version of the problem; whichever of
//! the two scores better on the exact interpolant is returned.

use crate::config::ConfigError;
use crate::design::{Design, DesignError, SamplingType};
use crate::estimate::{BeliefState, EstimationError, UtilityEstimator, UtilityOptions};
use crate::loss::LossSpec;
use crate::progress::{UtilityProgressObserver, UtilityProgressStage};
use crate::sampler::PosteriorSampler;
use crate::types::SupplyChain;
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use wolfe_bfgs::{Bfgs, BfgsSolution};

/// Allocations within this distance of an integer count as integral.
const INTEGRALITY_TOLERANCE: f64 = 1e-3;

/// Decimal places kept in a returned allocation.
const ALLOCATION_DECIMALS: i32 = 3;

#[derive(Error, Debug)]
pub enum AllocationError {
    #[error("The utility grid has no designs or no budget levels.")]
    EmptyGrid,
    #[error("Utility grid has {columns} budget columns but {budgets} budget levels.")]
    ShapeMismatch { budgets: usize, columns: usize },
    #[error("Grid budgets must start at zero and increase strictly.")]
    NonIncreasingBudgets,
    #[error("Utility grid contains non-finite values.")]
    NonFiniteUtility,
    #[error("Total budget must be finite and nonnegative, got {0}.")]
    InvalidBudget(f64),
}

// =============================================================================
// Utility Grid
// =============================================================================

/// Estimated utility gain per design and budget level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtilityGrid {
    pub budgets: Vec<usize>,
    /// `(designs, budgets)` loss reduction relative to the zero-test baseline.
    pub utility: Array2<f64>,
}

impl UtilityGrid {
    pub fn new(budgets: Vec<usize>, utility: Array2<f64>) -> Result<Self, AllocationError> {
        if budgets.is_empty() || utility.nrows() == 0 {
            return Err(AllocationError::EmptyGrid);
        }
        if utility.ncols() != budgets.len() {
            return Err(AllocationError::ShapeMismatch {
                budgets: budgets.len(),
                columns: utility.ncols(),
            });
        }
        if budgets[0] != 0 || budgets.windows(2).any(|w| w[1] <= w[0]) {
            return Err(AllocationError::NonIncreasingBudgets);
        }
        if utility.iter().any(|v| !v.is_finite()) {
            return Err(AllocationError::NonFiniteUtility);
        }
        Ok(Self { budgets, utility })
    }

    pub fn num_designs(&self) -> usize {
        self.utility.nrows()
    }

    /// Largest budget on the grid; allocations never exceed it.
    pub fn test_max(&self) -> f64 {
        self.budgets.last().map_or(0.0, |&b| b as f64)
    }

    /// Piecewise-linear utility of `design` at budget `x`, clamped to the grid.
    pub fn interpolate(&self, design: usize, x: f64) -> f64 {
        let row = self.utility.row(design);
        let x = x.clamp(0.0, self.test_max());
        let upper = self
            .budgets
            .iter()
            .position(|&b| b as f64 >= x)
            .unwrap_or(self.budgets.len() - 1);
        if upper == 0 {
            return row[0];
        }
        let (b0, b1) = (self.budgets[upper - 1] as f64, self.budgets[upper] as f64);
        let frac = (x - b0) / (b1 - b0);
        row[upper - 1] + frac * (row[upper] - row[upper - 1])
    }

    /// Sum of the interpolated utilities of an allocation.
    pub fn total_utility(&self, allocation: ArrayView1<f64>) -> f64 {
        allocation
            .iter()
            .enumerate()
            .map(|(i, &x)| self.interpolate(i, x))
            .sum()
    }

    /// Segment slopes of `design`, one per grid interval.
    fn slopes(&self, design: usize) -> Vec<f64> {
        let row = self.utility.row(design);
        self.budgets
            .windows(2)
            .enumerate()
            .map(|(k, w)| (row[k + 1] - row[k]) / (w[1] - w[0]) as f64)
            .collect()
    }
}

/// Chosen budget split and its interpolated utility.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationResult {
    pub allocation: Array1<f64>,
    pub utility: f64,
    /// False when the allocation is not near-integral or had to be repaired to
    /// respect the budget.
    pub precise: bool,
}

// =============================================================================
// Marginal Utility Sweep
// =============================================================================

/// One design per test node (node sampling) or per trace (path sampling),
/// each placing every test in one place.
pub fn single_node_designs(
    chain: SupplyChain,
    sampling: SamplingType,
) -> Result<Vec<Design>, DesignError> {
    match sampling {
        SamplingType::Node => (0..chain.num_test_nodes)
            .map(|t| Design::single_test_node(chain.num_test_nodes, t))
            .collect(),
        SamplingType::Path => (0..chain.num_test_nodes)
            .flat_map(|t| (0..chain.num_supply_nodes).map(move |s| (t, s)))
            .map(|(t, s)| Design::single_trace(chain, t, s))
            .collect(),
    }
}

/// Utility grid of `designs` at budgets `0, test_interval, ..., test_max`.
pub fn marginal_utility_for_designs(
    estimator: &UtilityEstimator<'_>,
    designs: &[Design],
    test_max: usize,
    test_interval: usize,
    observer: &mut dyn UtilityProgressObserver,
) -> Result<UtilityGrid, EstimationError> {
    if test_interval == 0 {
        return Err(ConfigError::InvalidParameter {
            parameter: "test_interval",
            value: 0.0,
            requirement: "must be positive",
        }
        .into());
    }
    let budgets: Vec<usize> = (0..=test_max).step_by(test_interval).collect();
    log::info!(
        "Marginal utility sweep: {} designs, budgets 0..={test_max} every {test_interval}, method {}.",
        designs.len(),
        estimator.options().method
    );

    observer.on_stage_start(UtilityProgressStage::Baseline, 1);
    let baseline = estimator.baseline()?.mean;
    observer.on_stage_advance(UtilityProgressStage::Baseline, 1);
    observer.on_stage_finish(UtilityProgressStage::Baseline);
    log::info!("Baseline loss: {baseline:.6}");

    let total = designs.len() * budgets.len();
    observer.on_stage_start(UtilityProgressStage::BudgetSweep, total);
    let mut utility = Array2::zeros((designs.len(), budgets.len()));
    let mut completed = 0;
    for (d, design) in designs.iter().enumerate() {
        for (b, &budget) in budgets.iter().enumerate() {
            if budget > 0 {
                utility[[d, b]] = baseline - estimator.estimate(design, budget)?.mean;
            }
            completed += 1;
            observer.on_stage_advance(UtilityProgressStage::BudgetSweep, completed);
        }
        log::debug!("Design {d} utility curve: {:?}", utility.row(d).to_vec());
    }
    observer.on_stage_finish(UtilityProgressStage::BudgetSweep);

    Ok(UtilityGrid::new(budgets, utility)?)
}

/// Utility grid of the single-node designs implied by `options.sampling`.
pub fn marginal_utility(
    state: &BeliefState,
    loss: &LossSpec,
    options: &UtilityOptions,
    test_max: usize,
    test_interval: usize,
    sampler: Option<&dyn PosteriorSampler>,
    observer: &mut dyn UtilityProgressObserver,
) -> Result<UtilityGrid, EstimationError> {
    let designs = single_node_designs(state.chain(), options.sampling)?;
    let mut estimator = UtilityEstimator::new(state, loss, options)?;
    if let Some(sampler) = sampler {
        estimator = estimator.with_sampler(sampler);
    }
    marginal_utility_for_designs(&estimator, &designs, test_max, test_interval, observer)
}

// =============================================================================
// Budget Allocation
// =============================================================================

fn check_budget(budget: f64) -> Result<(), AllocationError> {
    if !budget.is_finite() || budget < 0.0 {
        return Err(AllocationError::InvalidBudget(budget));
    }
    Ok(())
}

/// Spends the budget one grid interval at a time on the design with the
/// largest interpolated gain. Any remainder smaller than an interval goes to
/// the design that gains most from it.
pub fn greedy_allocation(
    grid: &UtilityGrid,
    budget: f64,
) -> Result<AllocationResult, AllocationError> {
    check_budget(budget)?;
    let n = grid.num_designs();
    let test_max = grid.test_max();
    let mut allocation = Array1::zeros(n);
    if grid.budgets.len() < 2 {
        return Ok(AllocationResult {
            utility: grid.total_utility(allocation.view()),
            allocation,
            precise: true,
        });
    }
    let step = (grid.budgets[1] - grid.budgets[0]) as f64;
    let mut remaining = budget;

    loop {
        let amount = step.min(remaining);
        if amount <= 0.0 {
            break;
        }
        let best = (0..n)
            .filter(|&i| allocation[i] + amount <= test_max + 1e-12)
            .map(|i| {
                let gain =
                    grid.interpolate(i, allocation[i] + amount) - grid.interpolate(i, allocation[i]);
                (i, gain)
            })
            .fold(None, |best: Option<(usize, f64)>, (i, gain)| match best {
                Some((_, g)) if g >= gain => best,
                _ => Some((i, gain)),
            });
        let Some((i, _)) = best else {
            break;
        };
        allocation[i] += amount;
        remaining -= amount;
    }

    Ok(AllocationResult {
        utility: grid.total_utility(allocation.view()),
        allocation,
        precise: true,
    })
}

/// Smooth stand-in for the piecewise-linear interpolant: every kink is
/// replaced by a softplus of width `width`.
struct SmoothedCurve {
    intercept: f64,
    first_slope: f64,
    kinks: Vec<(f64, f64)>,
    width: f64,
}

impl SmoothedCurve {
    fn new(grid: &UtilityGrid, design: usize, width: f64) -> Self {
        let slopes = grid.slopes(design);
        let kinks = slopes
            .windows(2)
            .enumerate()
            .map(|(k, w)| (grid.budgets[k + 1] as f64, w[1] - w[0]))
            .collect();
        Self {
            intercept: grid.utility[[design, 0]],
            first_slope: slopes.first().copied().unwrap_or(0.0),
            kinks,
            width,
        }
    }

    /// Value and derivative at `x`.
    fn eval(&self, x: f64) -> (f64, f64) {
        let mut value = self.intercept + self.first_slope * x;
        let mut slope = self.first_slope;
        for &(at, jump) in &self.kinks {
            let z = (x - at) / self.width;
            let softplus = if z > 30.0 { z } else { z.exp().ln_1p() };
            value += jump * self.width * softplus;
            slope += jump * sigmoid(z);
        }
        (value, slope)
    }
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

/// Refines a starting allocation with BFGS. Allocations are parametrized as
/// `x_i = test_max * sigmoid(u_i)` so the box constraints hold exactly; the
/// budget constraint is a quadratic penalty.
fn refine_allocation(
    grid: &UtilityGrid,
    budget: f64,
    start: ArrayView1<f64>,
) -> Result<Array1<f64>, String> {
    let test_max = grid.test_max();
    let step = (grid.budgets[1] - grid.budgets[0]) as f64;
    let curves: Vec<SmoothedCurve> = (0..grid.num_designs())
        .map(|i| SmoothedCurve::new(grid, i, 0.01 * step))
        .collect();
    let max_slope = (0..grid.num_designs())
        .flat_map(|i| grid.slopes(i))
        .fold(0.0f64, |acc, s| acc.max(s.abs()));
    let penalty = 1e3 * (1.0 + max_slope);

    let objective = move |u: &Array1<f64>| -> (f64, Array1<f64>) {
        let s = u.mapv(sigmoid);
        let x = &s * test_max;
        let overshoot = (x.sum() - budget).max(0.0);
        let mut cost = 0.5 * penalty * overshoot * overshoot;
        let mut grad = Array1::zeros(u.len());
        for (i, curve) in curves.iter().enumerate() {
            let (value, slope) = curve.eval(x[i]);
            cost -= value;
            let dx_du = test_max * s[i] * (1.0 - s[i]);
            grad[i] = (-slope + penalty * overshoot) * dx_du;
        }
        (cost, grad)
    };

    let initial = start.mapv(|x| logit((x / test_max).clamp(1e-6, 1.0 - 1e-6)));
    let BfgsSolution {
        final_point,
        final_value,
        iterations,
        ..
    } = Bfgs::new(initial, objective)
        .with_tolerance(1e-10)
        .with_max_iterations(500)
        .run()
        .map_err(|e| format!("{e:?}"))?;
    log::debug!("Allocation BFGS finished in {iterations} iterations at {final_value:.6}.");
    Ok(final_point.mapv(|u| test_max * sigmoid(u)))
}

fn round_to_decimals(x: f64) -> f64 {
    let scale = 10f64.powi(ALLOCATION_DECIMALS);
    (x * scale).round() / scale
}

/// Budget split maximizing the summed interpolated utility subject to
/// `sum(x) <= budget` and `0 <= x_i <= test_max`.
///
/// The result is rounded to three decimals. When it is not near-integral, or
/// had to be scaled back into the budget, it is still returned but flagged
/// with `precise = false` and a warning is logged.
pub fn optimal_allocation(
    grid: &UtilityGrid,
    budget: f64,
) -> Result<AllocationResult, AllocationError> {
    check_budget(budget)?;
    let n = grid.num_designs();
    let test_max = grid.test_max();
    // Also covers single-column grids, where test_max is zero.
    if budget >= n as f64 * test_max {
        let allocation = Array1::from_elem(n, test_max);
        return Ok(AllocationResult {
            utility: grid.total_utility(allocation.view()),
            allocation,
            precise: true,
        });
    }

    let greedy = greedy_allocation(grid, budget)?;
    let candidate = match refine_allocation(grid, budget, greedy.allocation.view()) {
        Ok(refined) if refined.sum() <= budget + INTEGRALITY_TOLERANCE => {
            let refined_utility = grid.total_utility(refined.view());
            if refined_utility > greedy.utility + 1e-9 {
                refined
            } else {
                greedy.allocation.clone()
            }
        }
        Ok(_) => greedy.allocation.clone(),
        Err(reason) => {
            log::warn!("Allocation optimizer failed ({reason}); using the greedy allocation.");
            greedy.allocation.clone()
        }
    };

    let mut allocation = candidate.mapv(|x| round_to_decimals(x.clamp(0.0, test_max)));
    let mut repaired = false;
    let total = allocation.sum();
    if total > budget {
        let scale = budget / total;
        let factor = 10f64.powi(ALLOCATION_DECIMALS);
        allocation.mapv_inplace(|x| (x * scale * factor).floor() / factor);
        repaired = true;
    }
    let integral = allocation
        .iter()
        .all(|&x| (x - x.round()).abs() <= INTEGRALITY_TOLERANCE);
    let precise = integral && !repaired;
    if !precise {
        log::warn!(
            "Allocation {:?} is {}; treat it as approximate.",
            allocation.to_vec(),
            if repaired {
                "scaled back into the budget"
            } else {
                "not near-integral"
            }
        );
    }
    let utility = grid.total_utility(allocation.view());
    log::info!(
        "Allocation of {budget} tests: {:?} with utility {utility:.6}.",
        allocation.to_vec()
    );
    Ok(AllocationResult {
        allocation,
        utility,
        precise,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn concave_grid() -> UtilityGrid {
        UtilityGrid::new(
            vec![0, 5, 10, 15, 20],
            array![
                [0.0, 0.10, 0.15, 0.18, 0.20],
                [0.0, 0.06, 0.11, 0.15, 0.18],
                [0.0, 0.02, 0.03, 0.035, 0.04],
            ],
        )
        .unwrap()
    }

    #[test]
    fn interpolation_is_piecewise_linear() {
        let grid = concave_grid();
        assert_abs_diff_eq!(grid.interpolate(0, 0.0), 0.0);
        assert_abs_diff_eq!(grid.interpolate(0, 2.5), 0.05, epsilon = 1e-12);
        assert_abs_diff_eq!(grid.interpolate(1, 12.0), 0.11 + 0.4 * 0.04, epsilon = 1e-12);
        assert_abs_diff_eq!(grid.interpolate(2, 20.0), 0.04, epsilon = 1e-12);
        assert_abs_diff_eq!(grid.interpolate(2, 35.0), 0.04, epsilon = 1e-12);
    }

    #[test]
    fn greedy_follows_the_steepest_segments() {
        let grid = concave_grid();
        let result = greedy_allocation(&grid, 20.0).unwrap();
        // Segment gains: 0.10, 0.06, 0.05, 0.05, 0.04, 0.03 ...
        assert_eq!(result.allocation, array![10.0, 10.0, 0.0]);
        assert_abs_diff_eq!(result.utility, 0.26, epsilon = 1e-12);
    }

    #[test]
    fn optimal_allocation_matches_concave_optimum() {
        let grid = concave_grid();
        let result = optimal_allocation(&grid, 20.0).unwrap();
        assert_abs_diff_eq!(result.allocation.sum(), 20.0, epsilon = 1e-3);
        assert!(result.utility >= 0.26 - 1e-9);
        assert!(result.precise);
    }

    #[test]
    fn allocations_are_always_feasible() {
        let mut rng = StdRng::seed_from_u64(51);
        for trial in 0..25 {
            let designs = 2 + trial % 5;
            let mut utility = Array2::zeros((designs, 6));
            for mut row in utility.rows_mut() {
                let mut level = 0.0;
                for b in 1..6 {
                    level += rng.gen_range(-0.005..0.05);
                    row[b] = level;
                }
            }
            let grid = UtilityGrid::new(vec![0, 4, 8, 12, 16, 20], utility).unwrap();
            let budget = rng.gen_range(0.0..(designs as f64 * 25.0));
            let result = optimal_allocation(&grid, budget).unwrap();
            assert!(result.allocation.sum() <= budget + 1e-6);
            for &x in result.allocation.iter() {
                assert!((0.0..=20.0).contains(&x));
            }
            let greedy = greedy_allocation(&grid, budget).unwrap();
            assert!(result.utility >= greedy.utility - 1e-2);
        }
    }

    #[test]
    fn smoothed_curve_tracks_the_interpolant() {
        let grid = concave_grid();
        let curve = SmoothedCurve::new(&grid, 1, 0.05);
        for x in [0.0, 3.0, 7.5, 12.0, 19.0] {
            let (value, _) = curve.eval(x);
            assert_abs_diff_eq!(value, grid.interpolate(1, x), epsilon = 1e-3);
        }
        let (_, slope) = curve.eval(2.0);
        assert_abs_diff_eq!(slope, 0.012, epsilon = 1e-6);
    }

    #[test]
    fn invalid_grids_and_budgets_are_rejected() {
        assert!(matches!(
            UtilityGrid::new(vec![0, 5], Array2::zeros((0, 2))),
            Err(AllocationError::EmptyGrid)
        ));
        assert!(matches!(
            UtilityGrid::new(vec![0, 5, 5], Array2::zeros((2, 3))),
            Err(AllocationError::NonIncreasingBudgets)
        ));
        assert!(matches!(
            UtilityGrid::new(vec![0, 5], Array2::zeros((2, 3))),
            Err(AllocationError::ShapeMismatch { .. })
        ));
        let grid = concave_grid();
        assert!(matches!(
            optimal_allocation(&grid, -1.0),
            Err(AllocationError::InvalidBudget(_))
        ));
    }

    #[test]
    fn generous_budgets_fill_every_design() {
        let grid = concave_grid();
        let result = optimal_allocation(&grid, 100.0).unwrap();
        assert_eq!(result.allocation, array![20.0, 20.0, 20.0]);
        assert!(result.precise);
    }

    #[test]
    fn single_node_designs_cover_the_chain() {
        let chain = SupplyChain::new(3, 2);
        assert_eq!(single_node_designs(chain, SamplingType::Node).unwrap().len(), 3);
        let traces = single_node_designs(chain, SamplingType::Path).unwrap();
        assert_eq!(traces.len(), 6);
        assert_eq!(traces[3], Design::single_trace(chain, 1, 1).unwrap());
    }
}

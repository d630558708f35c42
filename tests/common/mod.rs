#![allow(dead_code)]

use ndarray::{Array1, Array2, array};
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::StandardNormal;
use sfpdesign::estimate::BeliefState;
use sfpdesign::likelihood::log_likelihood;
use sfpdesign::loss::LossSpec;
use sfpdesign::sampler::{PosteriorSampler, SamplerError};
use sfpdesign::score::{RiskSpec, ScoreSpec};
use sfpdesign::types::{Diagnostic, PosteriorDraws, TestingData};

/// Random-walk Metropolis on the logit scale with a standard-normal prior,
/// standing in for the external MCMC sampler. The proposal scale adapts
/// during burn-in towards a 30% acceptance rate and is then frozen.
pub struct MetropolisSampler {
    pub burn_in: usize,
    pub thin: usize,
    pub diagnostic: Diagnostic,
}

impl MetropolisSampler {
    pub fn new(thin: usize) -> Self {
        Self {
            burn_in: 2000,
            thin,
            diagnostic: Diagnostic::perfect(),
        }
    }

    fn log_posterior(&self, data: &TestingData, logit: &Array1<f64>) -> f64 {
        let rates = logit.mapv(|v| 1.0 / (1.0 + (-v).exp()));
        log_likelihood(data, rates.view(), &self.diagnostic) - 0.5 * logit.dot(logit)
    }
}

impl PosteriorSampler for MetropolisSampler {
    fn sample(
        &self,
        data: &TestingData,
        num_draws: usize,
        rng: &mut StdRng,
    ) -> Result<PosteriorDraws, SamplerError> {
        let chain = data.supply_chain();
        let dim = chain.num_nodes();
        let mut current = Array1::zeros(dim);
        let mut current_lp = self.log_posterior(data, &current);
        let mut step = 2.4 / (dim as f64).sqrt();
        let mut accepted_in_window = 0usize;
        let mut logits = Array2::zeros((num_draws, dim));

        let total = self.burn_in + num_draws * self.thin;
        for iteration in 0..total {
            let noise = Array1::from_shape_fn(dim, |_| step * rng.sample::<f64, _>(StandardNormal));
            let proposal = &current + &noise;
            let proposal_lp = self.log_posterior(data, &proposal);
            if rng.r#gen::<f64>().ln() < proposal_lp - current_lp {
                current = proposal;
                current_lp = proposal_lp;
                accepted_in_window += 1;
            }
            if iteration < self.burn_in {
                if (iteration + 1) % 100 == 0 {
                    let rate = accepted_in_window as f64 / 100.0;
                    step *= (rate - 0.3).exp();
                    accepted_in_window = 0;
                }
            } else if (iteration - self.burn_in) % self.thin == 0 {
                logits
                    .row_mut((iteration - self.burn_in) / self.thin)
                    .assign(&current);
            }
        }
        Ok(PosteriorDraws::from_logit(logits, chain)?)
    }
}

/// Three test nodes, two supply nodes, trace-level counts.
pub fn example_data() -> TestingData {
    TestingData::tracked(
        array![[6.0, 11.0], [12.0, 6.0], [2.0, 13.0]],
        array![[3.0, 0.0], [6.0, 0.0], [0.0, 0.0]],
    )
    .unwrap()
}

pub fn example_loss() -> LossSpec {
    LossSpec::new(
        ScoreSpec::AbsDiff { under_est_wt: 1.0 },
        RiskSpec::Parabolic { threshold: 0.1 },
    )
    .unwrap()
}

/// Posterior of the example data drawn with the Metropolis sampler.
pub fn example_state(seed: u64, num_draws: usize) -> BeliefState {
    let data = example_data();
    let sampler = MetropolisSampler::new(10);
    let mut rng = StdRng::seed_from_u64(seed);
    let draws = sampler.sample(&data, num_draws, &mut rng).unwrap();
    BeliefState::new(draws, data, Diagnostic::perfect()).unwrap()
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

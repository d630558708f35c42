//! Interface to the external posterior sampler.
//!
//! The exact estimation methods re-run inference once per scenario. The
//! sampler itself (MCMC, NUTS, or anything else producing draws over node
//! rates) lives outside this crate; it only needs to turn testing counts into
//! rate-space draws.

use crate::types::{DataError, PosteriorDraws, TestingData};
use rand::rngs::StdRng;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("Posterior sampler failed: {0}")]
    Failed(String),

    #[error("Posterior sampler returned unusable draws: {0}")]
    InvalidDraws(#[from] DataError),
}

/// Produces posterior draws over node SFP rates given testing data.
///
/// Implementations must be deterministic given `rng`, and must return draws
/// whose supply chain matches `data`.
pub trait PosteriorSampler: Send + Sync {
    fn sample(
        &self,
        data: &TestingData,
        num_draws: usize,
        rng: &mut StdRng,
    ) -> Result<PosteriorDraws, SamplerError>;
}

impl<F> PosteriorSampler for F
where
    F: Fn(&TestingData, usize, &mut StdRng) -> Result<PosteriorDraws, SamplerError> + Send + Sync,
{
    fn sample(
        &self,
        data: &TestingData,
        num_draws: usize,
        rng: &mut StdRng,
    ) -> Result<PosteriorDraws, SamplerError> {
        self(data, num_draws, rng)
    }
}

/// Calls `sampler` and checks that the draws fit the supply chain of `data`.
pub(crate) fn sample_checked(
    sampler: &dyn PosteriorSampler,
    data: &TestingData,
    num_draws: usize,
    rng: &mut StdRng,
) -> Result<PosteriorDraws, SamplerError> {
    let draws = sampler.sample(data, num_draws, rng)?;
    let chain = data.supply_chain();
    if draws.chain() != chain {
        return Err(DataError::ShapeMismatch {
            what: "sampler draws",
            expected: (draws.len(), chain.num_nodes()),
            found: draws.dim(),
        }
        .into());
    }
    if draws.is_empty() {
        return Err(SamplerError::Failed("sampler returned no draws".to_string()));
    }
    Ok(draws)
}

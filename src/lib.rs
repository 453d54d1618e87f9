//! Adaptive gradient-based Markov chain samplers.
//!
//! The crate provides Hamiltonian Monte Carlo with a fixed number of
//! leapfrog steps, the No-U-Turn sampler, and stochastic gradient Langevin
//! dynamics. HMC and NUTS adapt their step size with dual averaging and can
//! estimate a diagonal mass matrix during the first draws.
//!
//! The density is provided by the caller through [`GradientOracle`] (or
//! [`StochasticGradientOracle`] for SGLD). Positions are stored according
//! to a [`Layout`] with named variables and one or more chains, which HMC
//! and SGLD simulate as independent lanes of the same computation.
//!
//! ## Usage
//!
//! ```
//! use hmc_sampler::{
//!     sample_sequentially, GradientOracle, HmcSampler, HmcSettings, Layout, LogpError,
//!     MassSpec, Position,
//! };
//! use rand::SeedableRng;
//! use thiserror::Error;
//!
//! // A standard normal in every value
//! struct PosteriorDensity {}
//!
//! #[derive(Debug, Error)]
//! enum PosteriorLogpError {}
//!
//! impl LogpError for PosteriorLogpError {
//!     fn is_recoverable(&self) -> bool {
//!         false
//!     }
//! }
//!
//! impl GradientOracle for PosteriorDensity {
//!     type LogpError = PosteriorLogpError;
//!
//!     fn logp(
//!         &mut self,
//!         position: &Position,
//!         logp: &mut [f64],
//!         gradient: &mut Position,
//!     ) -> Result<(), Self::LogpError> {
//!         let n_chains = logp.len();
//!         let values = position.as_slice();
//!         let per_chain = values.len() / n_chains;
//!         for (chain, out) in logp.iter_mut().enumerate() {
//!             *out = 0.;
//!             for i in chain * per_chain..(chain + 1) * per_chain {
//!                 *out -= values[i] * values[i] / 2.;
//!                 gradient.as_mut_slice()[i] = -values[i];
//!             }
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let layout = Layout::new(4, [("x", vec![3])])?;
//! let init = Position::zeros(&layout);
//! let settings = HmcSettings {
//!     step_size: 0.5,
//!     num_adapt: 100,
//!     ..Default::default()
//! };
//! let rng = rand::rngs::StdRng::seed_from_u64(42);
//! let mut sampler = HmcSampler::new(PosteriorDensity {}, init, MassSpec::identity(), settings, rng)?;
//!
//! for result in sample_sequentially(&mut sampler, 200) {
//!     let (position, info) = result?;
//!     // The values of `x` for all four chains
//!     let _x = position.variable("x").unwrap();
//!     assert_eq!(info.acceptance_rate.len(), 4);
//! }
//! # Ok::<(), hmc_sampler::SamplerError>(())
//! ```
//!
//! Recoverable errors from the density ([`LogpError::is_recoverable`]) reject
//! the proposal (NUTS records a divergence), other errors stop sampling with
//! [`SamplerError::LogpFailure`].

pub(crate) mod adapt_strategy;
pub(crate) mod error;
pub(crate) mod hamiltonian;
pub(crate) mod hmc;
pub(crate) mod integrator;
pub(crate) mod layout;
pub(crate) mod mass_matrix;
pub(crate) mod mass_matrix_adapt;
pub(crate) mod math;
pub mod model;
pub(crate) mod nuts;
pub(crate) mod sampler;
pub(crate) mod sgld;
pub(crate) mod stepsize;

pub use error::{LogpError, Result, SamplerError};
pub use hamiltonian::Point;
pub use hmc::{HmcDiagnostics, HmcSampler, HmcSettings};
pub use layout::{Layout, Position, VariableSpec};
pub use mass_matrix::{DiagMassMatrix, Mass, MassSpec};
pub use mass_matrix_adapt::{MassAdaptSettings, VarianceEstimator};
pub use model::{GradientOracle, StochasticGradientOracle};
pub use nuts::{NutsDiagnostics, NutsSampler, NutsSettings};
pub use sampler::{sample_sequentially, Sampler};
pub use sgld::{SgldDiagnostics, SgldSampler, SgldSettings};
pub use stepsize::{DualAverageSettings, StepSizeTuner};

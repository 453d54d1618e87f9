//! The interface to the log density that is sampled.
//!
//! Samplers only ever see the log density through these traits. Building
//! the density (and differentiating it) is the job of the caller.

use crate::error::LogpError;
use crate::layout::Position;

/// A differentiable log density, evaluated for all chains at once.
pub trait GradientOracle {
    type LogpError: LogpError + 'static;

    /// Compute the log density of each chain and its gradient.
    ///
    /// `logp` has one entry per chain, `gradient` has the same layout as
    /// `position`. Both are fully overwritten.
    fn logp(
        &mut self,
        position: &Position,
        logp: &mut [f64],
        gradient: &mut Position,
    ) -> Result<(), Self::LogpError>;
}

/// A log density split into a prior and a likelihood over a dataset, where
/// the likelihood is only evaluated on a minibatch.
///
/// The oracle owns the minibatch selection, so it may return a different
/// minibatch on every call. The shape of the result never changes.
pub trait StochasticGradientOracle {
    type LogpError: LogpError + 'static;

    /// Number of observations in the full dataset.
    fn data_size(&self) -> usize;

    /// Number of observations in one minibatch.
    fn minibatch_size(&self) -> usize;

    /// Log prior density and its gradient.
    fn log_prior(
        &mut self,
        position: &Position,
        logp: &mut [f64],
        gradient: &mut Position,
    ) -> Result<(), Self::LogpError>;

    /// Log likelihood of the current minibatch and its gradient.
    fn minibatch_log_likelihood(
        &mut self,
        position: &Position,
        logp: &mut [f64],
        gradient: &mut Position,
    ) -> Result<(), Self::LogpError>;
}

/// Simple densities for tests and benchmarks.
pub mod test_logps {
    use std::sync::Arc;

    use rand::Rng;
    use thiserror::Error;

    use super::{GradientOracle, StochasticGradientOracle};
    use crate::error::LogpError;
    use crate::layout::{Layout, Position};

    #[derive(Error, Debug)]
    pub enum NormalLogpError {}

    impl LogpError for NormalLogpError {
        fn is_recoverable(&self) -> bool {
            false
        }
    }

    /// Independent normal distributions for every value of every variable.
    #[derive(Clone, Debug)]
    pub struct NormalLogp {
        pub mu: f64,
        pub sigma: f64,
        pub evaluations: u64,
    }

    impl NormalLogp {
        pub fn new(mu: f64, sigma: f64) -> NormalLogp {
            NormalLogp {
                mu,
                sigma,
                evaluations: 0,
            }
        }

        pub fn standard() -> NormalLogp {
            NormalLogp::new(0., 1.)
        }
    }

    impl GradientOracle for NormalLogp {
        type LogpError = NormalLogpError;

        fn logp(
            &mut self,
            position: &Position,
            logp: &mut [f64],
            gradient: &mut Position,
        ) -> Result<(), NormalLogpError> {
            self.evaluations += 1;
            let layout = position.layout().clone();
            let precision = self.sigma.powi(2).recip();
            for (chain, out) in logp.iter_mut().enumerate() {
                *out = 0.;
                for var in 0..layout.variables().len() {
                    let range = layout.chain_range(var, chain);
                    let values = &position.as_slice()[range.clone()];
                    let grad = &mut gradient.as_mut_slice()[range];
                    for (&x, g) in values.iter().zip(grad.iter_mut()) {
                        let diff = x - self.mu;
                        *out -= 0.5 * diff * diff * precision;
                        *g = -diff * precision;
                    }
                }
            }
            Ok(())
        }
    }

    #[derive(Error, Debug)]
    #[error("density is not defined here")]
    pub struct OutOfSupport;

    impl LogpError for OutOfSupport {
        fn is_recoverable(&self) -> bool {
            true
        }
    }

    /// A standard normal that reports a recoverable error when any value
    /// is above `bound`.
    pub struct BoundedNormalLogp {
        pub bound: f64,
    }

    impl GradientOracle for BoundedNormalLogp {
        type LogpError = OutOfSupport;

        fn logp(
            &mut self,
            position: &Position,
            logp: &mut [f64],
            gradient: &mut Position,
        ) -> Result<(), OutOfSupport> {
            if position.as_slice().iter().any(|&x| x > self.bound) {
                return Err(OutOfSupport);
            }
            NormalLogp::standard()
                .logp(position, logp, gradient)
                .map_err(|err| match err {})
        }
    }

    /// A standard normal whose log density is NaN in every chain with a
    /// value above `bound`. The gradient stays finite.
    pub struct NanAboveLogp {
        pub bound: f64,
    }

    impl GradientOracle for NanAboveLogp {
        type LogpError = NormalLogpError;

        fn logp(
            &mut self,
            position: &Position,
            logp: &mut [f64],
            gradient: &mut Position,
        ) -> Result<(), NormalLogpError> {
            NormalLogp::standard().logp(position, logp, gradient)?;
            let layout = position.layout().clone();
            for (chain, out) in logp.iter_mut().enumerate() {
                let above = (0..layout.variables().len()).any(|var| {
                    position.as_slice()[layout.chain_range(var, chain)]
                        .iter()
                        .any(|&x| x > self.bound)
                });
                if above {
                    *out = f64::NAN;
                }
            }
            Ok(())
        }
    }

    /// Bayesian estimate of the mean of normal observations with known
    /// unit variance and a normal prior, sampled with minibatches.
    ///
    /// The layout must contain a single scalar variable.
    pub struct NormalMeanMinibatch<R: Rng> {
        pub data: Vec<f64>,
        pub batch: Vec<usize>,
        pub prior_sigma: f64,
        rng: R,
    }

    impl<R: Rng> NormalMeanMinibatch<R> {
        pub fn new(data: Vec<f64>, batch_size: usize, prior_sigma: f64, rng: R) -> Self {
            assert!(batch_size > 0 && batch_size <= data.len());
            NormalMeanMinibatch {
                batch: (0..batch_size).collect(),
                data,
                prior_sigma,
                rng,
            }
        }

        /// Exact posterior mean and variance of the model.
        pub fn posterior(&self) -> (f64, f64) {
            let n = self.data.len() as f64;
            let precision = n + self.prior_sigma.powi(-2);
            let sum: f64 = self.data.iter().sum();
            (sum / precision, precision.recip())
        }

        pub fn layout(n_chains: usize) -> Arc<Layout> {
            Layout::new(n_chains, [("mu", vec![])]).expect("static layout is valid")
        }
    }

    impl<R: Rng> StochasticGradientOracle for NormalMeanMinibatch<R> {
        type LogpError = NormalLogpError;

        fn data_size(&self) -> usize {
            self.data.len()
        }

        fn minibatch_size(&self) -> usize {
            self.batch.len()
        }

        fn log_prior(
            &mut self,
            position: &Position,
            logp: &mut [f64],
            gradient: &mut Position,
        ) -> Result<(), NormalLogpError> {
            let precision = self.prior_sigma.powi(-2);
            let grad = gradient.as_mut_slice();
            for ((&mu, out), g) in position.as_slice().iter().zip(logp).zip(grad) {
                *out = -0.5 * mu * mu * precision;
                *g = -mu * precision;
            }
            Ok(())
        }

        fn minibatch_log_likelihood(
            &mut self,
            position: &Position,
            logp: &mut [f64],
            gradient: &mut Position,
        ) -> Result<(), NormalLogpError> {
            let n = self.data.len();
            for idx in self.batch.iter_mut() {
                *idx = self.rng.random_range(0..n);
            }
            let grad = gradient.as_mut_slice();
            for ((&mu, out), g) in position.as_slice().iter().zip(logp).zip(grad) {
                *out = 0.;
                *g = 0.;
                for &idx in self.batch.iter() {
                    let diff = self.data[idx] - mu;
                    *out -= 0.5 * diff * diff;
                    *g += diff;
                }
            }
            Ok(())
        }
    }
}

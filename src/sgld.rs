//! Stochastic gradient Langevin dynamics.
//!
//! Every draw moves each chain by half the effective learning rate times a
//! minibatch estimate of the gradient of the log posterior, plus Gaussian
//! noise with variance equal to the effective learning rate. There is no
//! accept/reject step. With `preconditioned` the learning rate is scaled per
//! value by `1 / (regularizer + sqrt(r))`, where `r` is a decayed moving
//! average of the squared gradient.

use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{check_logp, Result, SamplerError};
use crate::layout::Position;
use crate::model::StochasticGradientOracle;
use crate::sampler::Sampler;

/// Settings for SGLD
///
/// The learning rate of draw `t` is `max(a * (b + t)^(-gamma), min_learning_rate)`.
#[derive(Debug, Clone, Copy)]
pub struct SgldSettings {
    pub a: f64,
    pub b: f64,
    pub gamma: f64,
    /// Lower bound of the learning rate.
    pub min_learning_rate: f64,
    /// Decay of the moving average of squared gradients.
    pub rms_decay: f64,
    pub preconditioned: bool,
    /// Added to the root mean square gradient before inverting it.
    pub regularizer: f64,
}

impl Default for SgldSettings {
    fn default() -> Self {
        Self {
            a: 1e-2,
            b: 1.,
            gamma: 0.55,
            min_learning_rate: 1e-5,
            rms_decay: 0.8,
            preconditioned: true,
            regularizer: 1e-5,
        }
    }
}

impl SgldSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.a.is_finite() && self.a > 0.) {
            return Err(SamplerError::invalid("learning rate scale a must be positive"));
        }
        if !(self.b.is_finite() && self.b > 0.) {
            return Err(SamplerError::invalid("learning rate offset b must be positive"));
        }
        if !(self.gamma.is_finite() && self.gamma >= 0.) {
            return Err(SamplerError::invalid("learning rate decay gamma must not be negative"));
        }
        if !(self.min_learning_rate.is_finite() && self.min_learning_rate >= 0.) {
            return Err(SamplerError::invalid("min_learning_rate must not be negative"));
        }
        if !(0f64..1.).contains(&self.rms_decay) {
            return Err(SamplerError::invalid("rms_decay must be in [0, 1)"));
        }
        if self.preconditioned && !(self.regularizer.is_finite() && self.regularizer > 0.) {
            return Err(SamplerError::invalid("regularizer must be positive"));
        }
        Ok(())
    }

    pub fn learning_rate(&self, draw: u64) -> f64 {
        let rate = self.a * (self.b + draw as f64).powf(-self.gamma);
        rate.max(self.min_learning_rate)
    }
}

/// Information about one SGLD draw
#[derive(Debug, Clone)]
pub struct SgldDiagnostics {
    pub draw: u64,
    pub learning_rate: f64,
    /// Minibatch estimate of the log posterior of each chain at the position
    /// before the update.
    pub log_density: Box<[f64]>,
    /// Chains that kept their old position because the update was not finite.
    pub rejected: Box<[bool]>,
    pub non_finite: usize,
}

pub struct SgldSampler<F: StochasticGradientOracle, R: Rng> {
    oracle: F,
    rng: R,
    settings: SgldSettings,
    position: Position,
    proposal: Box<[f64]>,
    prior_logp: Box<[f64]>,
    prior_gradient: Position,
    likelihood_logp: Box<[f64]>,
    likelihood_gradient: Position,
    gradient: Box<[f64]>,
    square_gradient: Box<[f64]>,
    new_square_gradient: Box<[f64]>,
    draw_count: u64,
}

impl<F: StochasticGradientOracle, R: Rng> SgldSampler<F, R> {
    pub fn new(oracle: F, init: Position, settings: SgldSettings, rng: R) -> Result<Self> {
        settings.validate()?;
        if oracle.minibatch_size() == 0 || oracle.minibatch_size() > oracle.data_size() {
            return Err(SamplerError::invalid(format!(
                "minibatch size {} does not fit a dataset of size {}",
                oracle.minibatch_size(),
                oracle.data_size()
            )));
        }
        let layout = init.layout().clone();
        let n_chains = layout.n_chains();
        let mut sampler = SgldSampler {
            oracle,
            rng,
            settings,
            proposal: vec![0f64; layout.len()].into(),
            prior_logp: vec![0f64; n_chains].into(),
            prior_gradient: Position::zeros(&layout),
            likelihood_logp: vec![0f64; n_chains].into(),
            likelihood_gradient: Position::zeros(&layout),
            gradient: vec![0f64; layout.len()].into(),
            square_gradient: vec![0f64; layout.len()].into(),
            new_square_gradient: vec![0f64; layout.len()].into(),
            position: init,
            draw_count: 0,
        };
        sampler.check_start()?;
        Ok(sampler)
    }

    pub fn settings(&self) -> &SgldSettings {
        &self.settings
    }

    /// Moving average of the squared gradient, with the layout of the position.
    pub fn square_gradient(&self) -> &[f64] {
        &self.square_gradient
    }

    fn data_ratio(&self) -> f64 {
        self.oracle.data_size() as f64 / self.oracle.minibatch_size() as f64
    }

    /// Evaluate the minibatch gradient estimate at the current position.
    /// Returns false after a recoverable error.
    fn evaluate(&mut self) -> Result<bool> {
        let valid = check_logp(self.oracle.log_prior(
            &self.position,
            &mut self.prior_logp,
            &mut self.prior_gradient,
        ))?;
        if !valid {
            return Ok(false);
        }
        let valid = check_logp(self.oracle.minibatch_log_likelihood(
            &self.position,
            &mut self.likelihood_logp,
            &mut self.likelihood_gradient,
        ))?;
        if !valid {
            return Ok(false);
        }
        let ratio = self.data_ratio();
        self.gradient
            .iter_mut()
            .zip(self.prior_gradient.as_slice())
            .zip(self.likelihood_gradient.as_slice())
            .for_each(|((g, &prior), &likelihood)| *g = ratio.mul_add(likelihood, prior));
        Ok(true)
    }

    fn log_density(&self) -> Box<[f64]> {
        let ratio = self.data_ratio();
        self.prior_logp
            .iter()
            .zip(self.likelihood_logp.iter())
            .map(|(&prior, &likelihood)| ratio.mul_add(likelihood, prior))
            .collect()
    }

    fn check_start(&mut self) -> Result<()> {
        let layout = self.position.layout().clone();
        let finite = (0..layout.n_chains()).all(|chain| self.position.is_chain_finite(chain));
        if !finite || !self.evaluate()? {
            return Err(SamplerError::NonFiniteInitialPoint);
        }
        if self.log_density().iter().any(|logp| !logp.is_finite())
            || self.gradient.iter().any(|g| !g.is_finite())
        {
            return Err(SamplerError::NonFiniteInitialPoint);
        }
        Ok(())
    }
}

impl<F: StochasticGradientOracle, R: Rng> Sampler for SgldSampler<F, R> {
    type Diagnostics = SgldDiagnostics;

    fn position(&self) -> &Position {
        &self.position
    }

    fn set_position(&mut self, position: Position) -> Result<()> {
        if !position.same_layout(self.position.layout()) {
            return Err(SamplerError::LayoutMismatch(
                "position layout differs from the sampler layout".into(),
            ));
        }
        let old = std::mem::replace(&mut self.position, position);
        if let Err(err) = self.check_start() {
            self.position = old;
            return Err(err);
        }
        Ok(())
    }

    fn draw(&mut self) -> Result<(Position, SgldDiagnostics)> {
        let draw = self.draw_count;
        let learning_rate = self.settings.learning_rate(draw);
        let layout = self.position.layout().clone();
        let n_chains = layout.n_chains();
        let mut rejected = vec![false; n_chains];

        let valid = self.evaluate()?;
        let log_density = if valid {
            self.log_density()
        } else {
            vec![f64::NAN; n_chains].into()
        };

        let decay = self.settings.rms_decay;
        let regularizer = self.settings.regularizer;
        for (chain, rejected) in rejected.iter_mut().enumerate() {
            let mut finite = valid && log_density[chain].is_finite();
            for (data, _) in layout.chain_blocks(chain) {
                let values = self.position.as_slice()[data.clone()].iter();
                let grads = self.gradient[data.clone()].iter();
                let squares = self.square_gradient[data.clone()].iter();
                let new_squares = self.new_square_gradient[data.clone()].iter_mut();
                let proposal = self.proposal[data].iter_mut();
                for ((((&x, &g), &r), new_r), out) in
                    values.zip(grads).zip(squares).zip(new_squares).zip(proposal)
                {
                    let epsilon = if self.settings.preconditioned {
                        *new_r = decay.mul_add(r, (1. - decay) * g * g);
                        learning_rate / (regularizer + new_r.sqrt())
                    } else {
                        *new_r = r;
                        learning_rate
                    };
                    let noise: f64 = self.rng.sample(StandardNormal);
                    *out = x + 0.5 * epsilon * g + epsilon.sqrt() * noise;
                    finite &= out.is_finite() & new_r.is_finite();
                }
            }

            if finite {
                for (data, _) in layout.chain_blocks(chain) {
                    self.position.as_mut_slice()[data.clone()]
                        .copy_from_slice(&self.proposal[data.clone()]);
                    self.square_gradient[data.clone()]
                        .copy_from_slice(&self.new_square_gradient[data]);
                }
            } else {
                log::trace!("chain {} rejected non-finite update in draw {}", chain, draw);
                *rejected = true;
            }
        }

        self.draw_count += 1;
        let non_finite = rejected.iter().filter(|&&r| r).count();
        let diagnostics = SgldDiagnostics {
            draw,
            learning_rate,
            log_density,
            rejected: rejected.into(),
            non_finite,
        };
        Ok((self.position.clone(), diagnostics))
    }

    fn draw_count(&self) -> u64 {
        self.draw_count
    }
}

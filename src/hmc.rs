use rand::Rng;

use crate::adapt_strategy::{AdaptOptions, AdaptStrategy};
use crate::error::{check_logp, Result, SamplerError};
use crate::hamiltonian::{initial_point, Point};
use crate::integrator::{one_step_acceptance, trajectory, Direction};
use crate::layout::Position;
use crate::mass_matrix::{DiagMassMatrix, MassSpec};
use crate::mass_matrix_adapt::MassAdaptSettings;
use crate::model::GradientOracle;
use crate::sampler::Sampler;
use crate::stepsize::{search_step_size, DualAverageSettings};

/// Settings for Hamiltonian Monte Carlo with a fixed number of leapfrog steps
#[derive(Debug, Clone, Copy)]
pub struct HmcSettings {
    /// Step size of the first draw, and of all draws if it is not adapted.
    pub step_size: f64,
    pub n_leapfrogs: u64,
    /// Number of draws at the start where step size and mass are adapted.
    pub num_adapt: u64,
    pub adapt_step_size: bool,
    /// Search for a step size with a one-step trajectory whenever step size
    /// adaptation (re)starts.
    pub init_step_size: bool,
    pub dual_average: DualAverageSettings,
    pub mass_adapt: MassAdaptSettings,
}

impl Default for HmcSettings {
    fn default() -> Self {
        Self {
            step_size: 1.,
            n_leapfrogs: 10,
            num_adapt: 50,
            adapt_step_size: true,
            init_step_size: false,
            dual_average: DualAverageSettings::default(),
            mass_adapt: MassAdaptSettings::default(),
        }
    }
}

impl HmcSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.step_size.is_finite() && self.step_size > 0.) {
            return Err(SamplerError::invalid(format!(
                "step size must be positive, got {}",
                self.step_size
            )));
        }
        if self.n_leapfrogs == 0 {
            return Err(SamplerError::invalid("n_leapfrogs must be at least one"));
        }
        self.dual_average.validate()?;
        self.mass_adapt.validate()
    }

    fn adapt_options(&self) -> AdaptOptions {
        AdaptOptions {
            step_size: self.step_size,
            num_adapt: self.num_adapt,
            adapt_step_size: self.adapt_step_size,
            search_step_size: self.init_step_size,
            dual_average: self.dual_average,
            mass_adapt: self.mass_adapt,
        }
    }
}

/// Information about one HMC draw. Per-chain values are indexed by chain.
#[derive(Debug, Clone)]
pub struct HmcDiagnostics {
    pub draw: u64,
    /// The draw was part of the adaptation window.
    pub tuning: bool,
    pub step_size: f64,
    pub old_hamiltonian: Box<[f64]>,
    /// Hamiltonian at the end of the trajectory, infinite if the log density
    /// could not be evaluated.
    pub new_hamiltonian: Box<[f64]>,
    pub acceptance_rate: Box<[f64]>,
    pub mean_acceptance_rate: f64,
    pub accepted: Box<[bool]>,
    /// Number of chains rejected because the proposal was not finite.
    pub non_finite: usize,
}

/// Hamiltonian Monte Carlo over all chains of a layout.
///
/// All chains share step size and mass, but every chain makes its own
/// accept/reject decision.
pub struct HmcSampler<F: GradientOracle, R: Rng> {
    oracle: F,
    rng: R,
    settings: HmcSettings,
    mass: DiagMassMatrix,
    current: Point,
    proposal: Point,
    adapt: AdaptStrategy,
    draw_count: u64,
}

impl<F: GradientOracle, R: Rng> HmcSampler<F, R> {
    pub fn new(
        mut oracle: F,
        init: Position,
        mass: MassSpec,
        settings: HmcSettings,
        rng: R,
    ) -> Result<Self> {
        settings.validate()?;
        let layout = init.layout().clone();
        let mass = DiagMassMatrix::new(&layout, &mass)?;
        let current = initial_point(&mut oracle, init)?;
        Ok(HmcSampler {
            oracle,
            rng,
            adapt: AdaptStrategy::new(settings.adapt_options(), layout.chain_dim()),
            settings,
            mass,
            proposal: current.clone(),
            current,
            draw_count: 0,
        })
    }

    pub fn settings(&self) -> &HmcSettings {
        &self.settings
    }

    pub fn mass(&self) -> &DiagMassMatrix {
        &self.mass
    }

    /// The step size of the next draw.
    pub fn step_size(&self) -> f64 {
        self.adapt.step_size()
    }

    pub fn oracle(&self) -> &F {
        &self.oracle
    }
}

impl<F: GradientOracle, R: Rng> Sampler for HmcSampler<F, R> {
    type Diagnostics = HmcDiagnostics;

    fn position(&self) -> &Position {
        &self.current.position
    }

    fn set_position(&mut self, position: Position) -> Result<()> {
        if !position.same_layout(self.current.layout()) {
            return Err(SamplerError::LayoutMismatch(
                "position layout differs from the sampler layout".into(),
            ));
        }
        self.current = initial_point(&mut self.oracle, position)?;
        Ok(())
    }

    fn draw(&mut self) -> Result<(Position, HmcDiagnostics)> {
        let draw = self.draw_count;
        let search = self
            .adapt
            .begin_draw(draw, &self.current.position, &mut self.mass);
        self.current.randomize_momentum(&self.mass, &mut self.rng);

        if search {
            let oracle = &mut self.oracle;
            let mass = &self.mass;
            let current = &self.current;
            let proposal = &mut self.proposal;
            let step_size = search_step_size(
                self.adapt.step_size(),
                self.adapt.target_accept(),
                |step_size| one_step_acceptance(oracle, mass, current, proposal, step_size),
            )?;
            self.adapt.set_step_size(step_size);
        }

        let step_size = self.adapt.step_size();
        self.proposal.clone_from(&self.current);
        let valid = check_logp(trajectory(
            &mut self.oracle,
            &self.mass,
            &mut self.proposal,
            step_size,
            self.settings.n_leapfrogs,
            Direction::Forward,
        ))?;

        let n_chains = self.current.n_chains();
        let mut old_hamiltonian = Vec::with_capacity(n_chains);
        let mut new_hamiltonian = Vec::with_capacity(n_chains);
        let mut acceptance_rate = Vec::with_capacity(n_chains);
        let mut accepted = Vec::with_capacity(n_chains);
        let mut non_finite = 0;
        for chain in 0..n_chains {
            old_hamiltonian.push(self.current.energy(chain));
            let finite = valid && self.proposal.is_finite(chain);
            let rate = if finite {
                new_hamiltonian.push(self.proposal.energy(chain));
                self.proposal.acceptance_from(&self.current, chain)
            } else {
                new_hamiltonian.push(f64::INFINITY);
                non_finite += 1;
                log::trace!("chain {} rejected non-finite proposal in draw {}", chain, draw);
                0.
            };
            let u01: f64 = self.rng.random();
            let accept = finite && (u01 < rate);
            if accept {
                self.current.accept_chain(&self.proposal, chain);
            }
            acceptance_rate.push(rate);
            accepted.push(accept);
        }

        let mean_acceptance_rate = acceptance_rate.iter().sum::<f64>() / n_chains as f64;
        self.adapt.end_draw(draw, mean_acceptance_rate);
        self.draw_count += 1;

        let diagnostics = HmcDiagnostics {
            draw,
            tuning: draw < self.settings.num_adapt,
            step_size,
            old_hamiltonian: old_hamiltonian.into(),
            new_hamiltonian: new_hamiltonian.into(),
            acceptance_rate: acceptance_rate.into(),
            mean_acceptance_rate,
            accepted: accepted.into(),
            non_finite,
        };
        Ok((self.current.position.clone(), diagnostics))
    }

    fn draw_count(&self) -> u64 {
        self.draw_count
    }
}

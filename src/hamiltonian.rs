use std::sync::Arc;

use rand::Rng;

use crate::error::{check_logp, Result, SamplerError};
use crate::layout::{Layout, Position};
use crate::mass_matrix::DiagMassMatrix;
use crate::model::GradientOracle;

/// A point in phase space for all chains.
///
/// The gradient and log density always belong to the current position,
/// the velocity and kinetic energy to the current momentum.
#[derive(Debug, Clone)]
pub struct Point {
    pub position: Position,
    pub gradient: Position,
    pub momentum: Box<[f64]>,
    pub velocity: Box<[f64]>,
    /// Log density of each chain
    pub logp: Box<[f64]>,
    pub kinetic_energy: Box<[f64]>,
    /// Number of leapfrog steps from the start of the trajectory,
    /// negative for steps backward in time.
    pub index_in_trajectory: i64,
}

impl Point {
    /// A point at `position`. Call `update_gradient` before using it.
    pub fn new(position: Position) -> Point {
        let layout = position.layout().clone();
        Point {
            gradient: Position::zeros(&layout),
            momentum: vec![0f64; layout.len()].into(),
            velocity: vec![0f64; layout.len()].into(),
            logp: vec![0f64; layout.n_chains()].into(),
            kinetic_energy: vec![0f64; layout.n_chains()].into(),
            index_in_trajectory: 0,
            position,
        }
    }

    pub fn layout(&self) -> &Arc<Layout> {
        self.position.layout()
    }

    pub fn n_chains(&self) -> usize {
        self.logp.len()
    }

    pub fn update_gradient<F: GradientOracle>(
        &mut self,
        oracle: &mut F,
    ) -> std::result::Result<(), F::LogpError> {
        oracle.logp(&self.position, &mut self.logp, &mut self.gradient)
    }

    /// Resample the momentum from `N(0, mass)` for all chains.
    pub fn randomize_momentum<R: Rng + ?Sized>(&mut self, mass: &DiagMassMatrix, rng: &mut R) {
        let layout = self.layout().clone();
        mass.randomize_momentum(&layout, &mut self.momentum, rng);
        self.update_velocity(mass);
        self.index_in_trajectory = 0;
    }

    /// Recompute velocity and kinetic energy after a change of momentum.
    pub fn update_velocity(&mut self, mass: &DiagMassMatrix) {
        let layout = self.layout().clone();
        mass.update_velocity(&layout, &self.momentum, &mut self.velocity);
        for chain in 0..layout.n_chains() {
            self.kinetic_energy[chain] =
                mass.kinetic_energy(&layout, &self.momentum, &self.velocity, chain);
        }
    }

    pub fn potential_energy(&self, chain: usize) -> f64 {
        -self.logp[chain]
    }

    /// The hamiltonian (potential + kinetic energy) of one chain.
    pub fn energy(&self, chain: usize) -> f64 {
        self.potential_energy(chain) + self.kinetic_energy[chain]
    }

    /// Numeric health check for one chain: energies, position and
    /// gradient must all be finite.
    pub fn is_finite(&self, chain: usize) -> bool {
        self.logp[chain].is_finite()
            && self.kinetic_energy[chain].is_finite()
            && self.position.is_chain_finite(chain)
            && self.gradient.is_chain_finite(chain)
    }

    /// Metropolis acceptance probability `min(1, exp(H_start - H))` of this
    /// point as a proposal from `start`. Zero if this point is not finite.
    pub fn acceptance_from(&self, start: &Point, chain: usize) -> f64 {
        if !self.is_finite(chain) {
            return 0.;
        }
        let delta = start.energy(chain) - self.energy(chain);
        if delta.is_nan() {
            0.
        } else {
            delta.min(0.).exp()
        }
    }

    /// Copy position, gradient and log density of one chain from `other`.
    pub(crate) fn accept_chain(&mut self, other: &Point, chain: usize) {
        self.position.copy_chain_from(&other.position, chain);
        self.gradient.copy_chain_from(&other.gradient, chain);
        self.logp[chain] = other.logp[chain];
    }
}

/// Evaluate the density at a starting position, which must be finite
/// for every chain.
pub(crate) fn initial_point<F: GradientOracle>(oracle: &mut F, position: Position) -> Result<Point> {
    let mut point = Point::new(position);
    if !check_logp(point.update_gradient(oracle))? {
        return Err(SamplerError::NonFiniteInitialPoint);
    }
    if (0..point.n_chains()).any(|chain| !point.is_finite(chain)) {
        return Err(SamplerError::NonFiniteInitialPoint);
    }
    Ok(point)
}

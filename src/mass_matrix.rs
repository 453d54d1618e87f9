use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{Result, SamplerError};
use crate::layout::Layout;
use crate::math::{multiply, vector_dot};

/// Mass lower and upper limits for estimated masses.
const LOWER_LIMIT: f64 = 1e-20f64;
const UPPER_LIMIT: f64 = 1e20f64;

/// The mass of one variable.
#[derive(Debug, Clone, PartialEq)]
pub enum Mass {
    /// The same mass for every value of the variable.
    Scalar(f64),
    /// One mass per value, with the shape of the variable.
    Diagonal(Box<[f64]>),
}

/// Masses for the sampled variables. Variables without an entry get unit mass.
#[derive(Debug, Clone, Default)]
pub struct MassSpec {
    entries: Vec<(String, Mass)>,
}

impl MassSpec {
    pub fn identity() -> MassSpec {
        MassSpec::default()
    }

    pub fn with(mut self, name: impl Into<String>, mass: Mass) -> MassSpec {
        self.entries.push((name.into(), mass));
        self
    }
}

/// A diagonal mass matrix, shared by all chains.
///
/// Momentum is distributed as `N(0, mass)`, the velocity is `momentum / mass`.
#[derive(Debug, Clone)]
pub struct DiagMassMatrix {
    mass: Box<[f64]>,
    inv_mass: Box<[f64]>,
    sqrt_mass: Box<[f64]>,
}

impl DiagMassMatrix {
    pub(crate) fn new(layout: &Layout, spec: &MassSpec) -> Result<DiagMassMatrix> {
        let mut mass = vec![1f64; layout.chain_dim()];
        let mut seen = vec![false; layout.variables().len()];
        for (name, value) in spec.entries.iter() {
            let idx = layout.variable_index(name).ok_or_else(|| {
                SamplerError::invalid(format!("mass given for unknown variable '{}'", name))
            })?;
            if seen[idx] {
                return Err(SamplerError::invalid(format!(
                    "mass for variable '{}' given twice",
                    name
                )));
            }
            seen[idx] = true;
            let var = &layout.variables()[idx];
            let out = &mut mass[var.chain_offset()..var.chain_offset() + var.size()];
            match value {
                Mass::Scalar(val) => out.fill(*val),
                Mass::Diagonal(vals) => {
                    if vals.len() != var.size() {
                        return Err(SamplerError::invalid(format!(
                            "mass for variable '{}' needs {} values, got {}",
                            name,
                            var.size(),
                            vals.len()
                        )));
                    }
                    out.copy_from_slice(vals);
                }
            }
        }
        if let Some(bad) = mass.iter().find(|&&m| !(m.is_finite() && m > 0.)) {
            return Err(SamplerError::invalid(format!(
                "mass must be positive and finite, got {}",
                bad
            )));
        }
        let mut out = DiagMassMatrix {
            inv_mass: vec![0f64; mass.len()].into(),
            sqrt_mass: vec![0f64; mass.len()].into(),
            mass: mass.into(),
        };
        out.update_derived();
        Ok(out)
    }

    fn update_derived(&mut self) {
        self.mass
            .iter()
            .zip(self.inv_mass.iter_mut())
            .zip(self.sqrt_mass.iter_mut())
            .for_each(|((&m, inv), sqrt)| {
                *inv = m.recip();
                *sqrt = m.sqrt();
            });
    }

    /// Replace the mass by an estimate. Invalid values keep the old mass,
    /// the rest is clamped to a safe range.
    pub(crate) fn update_diag(&mut self, new_mass: impl Iterator<Item = f64>) {
        self.mass.iter_mut().zip(new_mass).for_each(|(m, x)| {
            if x.is_finite() && x > 0. {
                *m = x.clamp(LOWER_LIMIT, UPPER_LIMIT);
            }
        });
        self.update_derived();
    }

    /// The mass of each value of one chain, in layout order.
    pub fn values(&self) -> &[f64] {
        &self.mass
    }

    /// Draw a standard normal for every value and scale it by `sqrt(mass)`.
    pub(crate) fn randomize_momentum<R: Rng + ?Sized>(
        &self,
        layout: &Layout,
        momentum: &mut [f64],
        rng: &mut R,
    ) {
        for chain in 0..layout.n_chains() {
            for (data, mass) in layout.chain_blocks(chain) {
                momentum[data]
                    .iter_mut()
                    .zip(self.sqrt_mass[mass].iter())
                    .for_each(|(p, &s)| {
                        let norm: f64 = rng.sample(StandardNormal);
                        *p = s * norm;
                    });
            }
        }
    }

    pub(crate) fn update_velocity(&self, layout: &Layout, momentum: &[f64], velocity: &mut [f64]) {
        for chain in 0..layout.n_chains() {
            for (data, mass) in layout.chain_blocks(chain) {
                multiply(
                    &momentum[data.clone()],
                    &self.inv_mass[mass],
                    &mut velocity[data],
                );
            }
        }
    }

    /// `0.5 * sum(momentum^2 / mass)` over the values of one chain.
    pub(crate) fn kinetic_energy(
        &self,
        layout: &Layout,
        momentum: &[f64],
        velocity: &[f64],
        chain: usize,
    ) -> f64 {
        0.5 * layout
            .chain_blocks(chain)
            .map(|(data, _)| vector_dot(&momentum[data.clone()], &velocity[data]))
            .sum::<f64>()
    }
}

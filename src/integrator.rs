use rand::Rng;
use rand_distr::{Distribution, StandardUniform};

use crate::error::{check_logp, Result};
use crate::hamiltonian::Point;
use crate::mass_matrix::DiagMassMatrix;
use crate::math::axpy;
use crate::model::GradientOracle;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn sign(self) -> f64 {
        match self {
            Direction::Forward => 1.,
            Direction::Backward => -1.,
        }
    }
}

impl Distribution<Direction> for StandardUniform {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Direction {
        if rng.random::<bool>() {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }
}

/// Move the position by `epsilon1` times the velocity, then the momentum
/// by `epsilon2` times the gradient at the new position.
///
/// With `epsilon1 == 0` the position does not change and the stored
/// gradient is reused, so the oracle is not called.
pub fn leapfrog<F: GradientOracle>(
    oracle: &mut F,
    mass: &DiagMassMatrix,
    point: &mut Point,
    epsilon1: f64,
    epsilon2: f64,
) -> std::result::Result<(), F::LogpError> {
    if epsilon1 != 0. {
        axpy(&point.velocity, point.position.as_mut_slice(), epsilon1);
        point.update_gradient(oracle)?;
    }
    axpy(point.gradient.as_slice(), &mut point.momentum, epsilon2);
    point.update_velocity(mass);
    Ok(())
}

/// Integrate `n_leapfrogs` steps of size `step_size` in `direction`.
///
/// The steps are composed as `n_leapfrogs + 1` calls of [`leapfrog`], with
/// half momentum steps at both ends of the trajectory.
pub fn trajectory<F: GradientOracle>(
    oracle: &mut F,
    mass: &DiagMassMatrix,
    point: &mut Point,
    step_size: f64,
    n_leapfrogs: u64,
    direction: Direction,
) -> std::result::Result<(), F::LogpError> {
    let epsilon = direction.sign() * step_size;
    for i in 0..=n_leapfrogs {
        let epsilon1 = if i > 0 { epsilon } else { 0. };
        let epsilon2 = if (i > 0) & (i < n_leapfrogs) {
            epsilon
        } else {
            epsilon / 2.
        };
        leapfrog(oracle, mass, point, epsilon1, epsilon2)?;
    }
    let steps = n_leapfrogs as i64;
    point.index_in_trajectory += match direction {
        Direction::Forward => steps,
        Direction::Backward => -steps,
    };
    Ok(())
}

/// Mean acceptance rate over chains of a single leapfrog step from `current`.
pub(crate) fn one_step_acceptance<F: GradientOracle>(
    oracle: &mut F,
    mass: &DiagMassMatrix,
    current: &Point,
    proposal: &mut Point,
    step_size: f64,
) -> Result<f64> {
    proposal.clone_from(current);
    if !check_logp(trajectory(oracle, mass, proposal, step_size, 1, Direction::Forward))? {
        return Ok(0.);
    }
    let n_chains = current.n_chains();
    let total: f64 = (0..n_chains)
        .map(|chain| proposal.acceptance_from(current, chain))
        .sum();
    Ok(total / n_chains as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{Layout, Position};
    use crate::mass_matrix::{Mass, MassSpec};
    use crate::model::test_logps::NormalLogp;
    use proptest::prelude::*;

    fn start_point(q: &[f64], p: &[f64], mass: &DiagMassMatrix) -> Point {
        let layout = Layout::new(1, [("x", vec![q.len()])]).unwrap();
        let position = Position::from_variables(&layout, [("x", q.to_vec())]).unwrap();
        let mut point = Point::new(position);
        point.update_gradient(&mut NormalLogp::new(0.5, 2.)).unwrap();
        point.momentum.copy_from_slice(p);
        point.update_velocity(mass);
        point
    }

    proptest! {
        #[test]
        fn reversible(
            q in prop::collection::vec(-5f64..5f64, 3),
            p in prop::collection::vec(-5f64..5f64, 3),
            step_size in 0.01f64..0.5,
            n_leapfrogs in 1u64..20,
        ) {
            let layout = Layout::new(1, [("x", vec![3])]).unwrap();
            let spec = MassSpec::identity().with("x", Mass::Diagonal(vec![0.5, 1., 3.].into()));
            let mass = DiagMassMatrix::new(&layout, &spec).unwrap();
            let mut oracle = NormalLogp::new(0.5, 2.);

            let mut point = start_point(&q, &p, &mass);
            trajectory(&mut oracle, &mass, &mut point, step_size, n_leapfrogs, Direction::Forward).unwrap();
            prop_assert_eq!(point.index_in_trajectory, n_leapfrogs as i64);
            trajectory(&mut oracle, &mass, &mut point, step_size, n_leapfrogs, Direction::Backward).unwrap();
            prop_assert_eq!(point.index_in_trajectory, 0);

            for (a, b) in point.position.as_slice().iter().zip(q.iter()) {
                prop_assert!((a - b).abs() < 1e-9);
            }
            for (a, b) in point.momentum.iter().zip(p.iter()) {
                prop_assert!((a - b).abs() < 1e-9);
            }
        }

        #[test]
        fn momentum_flip_returns_to_start(
            q in prop::collection::vec(-5f64..5f64, 3),
            p in prop::collection::vec(-5f64..5f64, 3),
            n_leapfrogs in 1u64..20,
        ) {
            let layout = Layout::new(1, [("x", vec![3])]).unwrap();
            let mass = DiagMassMatrix::new(&layout, &MassSpec::identity()).unwrap();
            let mut oracle = NormalLogp::new(0.5, 2.);

            let mut point = start_point(&q, &p, &mass);
            trajectory(&mut oracle, &mass, &mut point, 0.2, n_leapfrogs, Direction::Forward).unwrap();
            point.momentum.iter_mut().for_each(|x| *x = -*x);
            point.update_velocity(&mass);
            trajectory(&mut oracle, &mass, &mut point, 0.2, n_leapfrogs, Direction::Forward).unwrap();

            for (a, b) in point.position.as_slice().iter().zip(q.iter()) {
                prop_assert!((a - b).abs() < 1e-9);
            }
            for (a, b) in point.momentum.iter().zip(p.iter()) {
                prop_assert!((a + b).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn small_steps_conserve_energy() {
        let layout = Layout::new(1, [("x", vec![3])]).unwrap();
        let mass = DiagMassMatrix::new(&layout, &MassSpec::identity()).unwrap();
        let mut oracle = NormalLogp::new(0.5, 2.);
        let mut point = start_point(&[1., -2., 0.3], &[0.5, 1., -1.], &mass);
        let initial = point.energy(0);
        trajectory(&mut oracle, &mass, &mut point, 1e-3, 100, Direction::Forward).unwrap();
        assert!((point.energy(0) - initial).abs() < 1e-6);
    }

    #[test]
    fn oracle_calls_per_trajectory() {
        let layout = Layout::new(1, [("x", vec![1])]).unwrap();
        let mass = DiagMassMatrix::new(&layout, &MassSpec::identity()).unwrap();
        let mut oracle = NormalLogp::standard();
        let mut point = start_point(&[1.], &[1.], &mass);
        trajectory(&mut oracle, &mass, &mut point, 0.1, 7, Direction::Forward).unwrap();
        assert_eq!(oracle.evaluations, 7);
    }
}

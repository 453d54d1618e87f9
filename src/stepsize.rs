use crate::error::{Result, SamplerError};

/// Settings for step size adaptation
#[derive(Debug, Clone, Copy)]
pub struct DualAverageSettings {
    /// The acceptance rate the step size is tuned towards.
    pub target_accept: f64,
    pub gamma: f64,
    pub t0: f64,
    pub kappa: f64,
}

impl Default for DualAverageSettings {
    fn default() -> DualAverageSettings {
        DualAverageSettings {
            target_accept: 0.8,
            gamma: 0.05,
            t0: 10.,
            kappa: 0.75,
        }
    }
}

impl DualAverageSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.target_accept > 0. && self.target_accept < 1.) {
            return Err(SamplerError::invalid(format!(
                "target acceptance rate must be in (0, 1), got {}",
                self.target_accept
            )));
        }
        if !(self.gamma.is_finite() && self.gamma > 0.) {
            return Err(SamplerError::invalid("gamma must be positive"));
        }
        if !(self.t0.is_finite() && self.t0 >= 0.) {
            return Err(SamplerError::invalid("t0 must not be negative"));
        }
        if !(self.kappa.is_finite() && self.kappa > 0.) {
            return Err(SamplerError::invalid("kappa must be positive"));
        }
        Ok(())
    }
}

/// Dual averaging of the log step size towards a target acceptance rate.
///
/// The tuner adapts during the first `m_adapt` calls to [`tune`] counted
/// over its whole life, and returns the averaged step size afterwards.
/// [`restart`] starts a new averaging phase but does not extend the window.
///
/// [`tune`]: StepSizeTuner::tune
/// [`restart`]: StepSizeTuner::restart
#[derive(Debug, Clone)]
pub struct StepSizeTuner {
    settings: DualAverageSettings,
    m_adapt: u64,
    step_count: u64,
    total_step_count: u64,
    log_step_size_bar: f64,
    h_bar: f64,
    mu: f64,
    adapted: bool,
}

impl StepSizeTuner {
    pub fn new(settings: DualAverageSettings, m_adapt: u64, initial_step_size: f64) -> Self {
        let mut tuner = StepSizeTuner {
            settings,
            m_adapt,
            step_count: 0,
            total_step_count: 0,
            log_step_size_bar: 0.,
            h_bar: 0.,
            mu: 0.,
            adapted: false,
        };
        tuner.restart(initial_step_size);
        tuner
    }

    pub fn restart(&mut self, step_size: f64) {
        self.mu = (10. * step_size).ln();
        self.step_count = 0;
        self.log_step_size_bar = 0.;
        self.h_bar = 0.;
        self.adapted = false;
    }

    /// Record the acceptance rate of one draw and return the step size
    /// for the next one.
    pub fn tune(&mut self, acceptance_rate: f64) -> f64 {
        self.step_count += 1;
        self.total_step_count += 1;
        if self.total_step_count >= self.m_adapt {
            return self.final_step_size();
        }

        let settings = &self.settings;
        let step = self.step_count as f64;
        let w1 = (step + settings.t0).recip();
        self.h_bar = (1. - w1) * self.h_bar + w1 * (settings.target_accept - acceptance_rate);
        let log_step_size = self.mu - step.sqrt() / settings.gamma * self.h_bar;
        let w2 = step.powf(-settings.kappa);
        self.log_step_size_bar = w2 * log_step_size + (1. - w2) * self.log_step_size_bar;
        self.adapted = true;
        log_step_size.exp()
    }

    pub fn restart_and_tune(&mut self, step_size: f64, acceptance_rate: f64) -> f64 {
        self.restart(step_size);
        self.tune(acceptance_rate)
    }

    /// The averaged step size. Before the first adaptive update this is the
    /// step size of the last restart.
    pub fn final_step_size(&self) -> f64 {
        if self.adapted {
            self.log_step_size_bar.exp()
        } else {
            self.mu.exp() / 10.
        }
    }

    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    pub fn total_step_count(&self) -> u64 {
        self.total_step_count
    }

    pub fn h_bar(&self) -> f64 {
        self.h_bar
    }

    pub fn is_adapting(&self) -> bool {
        self.total_step_count + 1 < self.m_adapt
    }
}

const SEARCH_FACTOR: f64 = 1.1;
const SEARCH_MAX_ITER: usize = 100;
const MIN_STEP_SIZE: f64 = 1e-10;
const MAX_STEP_SIZE: f64 = 1e5;

/// Find a step size where the acceptance rate of a short trajectory
/// crosses `target`.
///
/// Starting from `initial`, the step size is multiplied or divided by 1.1
/// until `acceptance_rate(step_size)` lands on the other side of `target`.
/// The result is the last step size with an acceptance rate of at least
/// `target`, or the smallest tried one if none reached it.
pub(crate) fn search_step_size<E>(
    initial: f64,
    target: f64,
    mut acceptance_rate: impl FnMut(f64) -> std::result::Result<f64, E>,
) -> std::result::Result<f64, E> {
    let mut step_size = initial.clamp(MIN_STEP_SIZE, MAX_STEP_SIZE);
    let increase = acceptance_rate(step_size)? >= target;

    for _ in 0..SEARCH_MAX_ITER {
        let next = if increase {
            step_size * SEARCH_FACTOR
        } else {
            step_size / SEARCH_FACTOR
        };
        if !(MIN_STEP_SIZE..=MAX_STEP_SIZE).contains(&next) {
            log::warn!("step size search stopped at bound {}", step_size);
            return Ok(step_size);
        }
        let accepted = acceptance_rate(next)? >= target;
        if accepted != increase {
            let found = if increase { step_size } else { next };
            log::debug!("initial step size search found {}", found);
            return Ok(found);
        }
        step_size = next;
    }
    log::warn!(
        "step size search did not reach the target acceptance rate after {} iterations",
        SEARCH_MAX_ITER
    );
    Ok(step_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;

    #[test]
    fn low_acceptance_shrinks_step() {
        let mut tuner = StepSizeTuner::new(DualAverageSettings::default(), 20, 1.);
        let mut last = f64::INFINITY;
        for _ in 0..19 {
            assert!(tuner.is_adapting());
            let step = tuner.tune(0.2);
            assert!(step < last);
            last = step;
        }
        assert_eq!(tuner.total_step_count(), 19);

        let frozen = tuner.tune(0.2);
        assert_relative_eq!(frozen, tuner.final_step_size());
        assert!(frozen != last);
        for acc in [0., 0.5, 1.] {
            assert_eq!(tuner.tune(acc), frozen);
        }
        assert!(!tuner.is_adapting());
    }

    #[test]
    fn high_acceptance_grows_step() {
        let mut tuner = StepSizeTuner::new(DualAverageSettings::default(), 100, 0.1);
        let first = tuner.tune(1.);
        let mut last = first;
        for _ in 0..10 {
            let step = tuner.tune(1.);
            assert!(step > last);
            last = step;
        }
    }

    #[test]
    fn first_update() {
        let settings = DualAverageSettings::default();
        let mut tuner = StepSizeTuner::new(settings, 50, 0.5);
        let step = tuner.tune(0.3);
        // h_bar = (0.8 - 0.3) / 11
        let h_bar = 0.5 / 11.;
        assert_relative_eq!(tuner.h_bar(), h_bar);
        assert_relative_eq!(step, (5f64.ln() - h_bar / 0.05).exp(), max_relative = 1e-12);
        // The first averaging weight is one
        assert_relative_eq!(tuner.final_step_size(), step, max_relative = 1e-12);
    }

    #[test]
    fn restart_keeps_total_count() {
        let mut tuner = StepSizeTuner::new(DualAverageSettings::default(), 10, 1.);
        for _ in 0..5 {
            tuner.tune(0.5);
        }
        let step = tuner.restart_and_tune(0.3, 0.8);
        assert_eq!(tuner.step_count(), 1);
        assert_eq!(tuner.total_step_count(), 6);
        // Acceptance equal to the target keeps h_bar at zero
        assert_relative_eq!(tuner.h_bar(), 0.);
        assert_relative_eq!(step, 3., max_relative = 1e-12);
    }

    #[test]
    fn frozen_without_updates() {
        let mut tuner = StepSizeTuner::new(DualAverageSettings::default(), 1, 0.25);
        assert_relative_eq!(tuner.tune(0.), 0.25, max_relative = 1e-12);
        assert_relative_eq!(tuner.tune(1.), 0.25, max_relative = 1e-12);
    }

    #[test]
    fn invalid_settings() {
        let bad_target = DualAverageSettings {
            target_accept: 1.,
            ..Default::default()
        };
        assert!(bad_target.validate().is_err());
        let bad_gamma = DualAverageSettings {
            gamma: 0.,
            ..Default::default()
        };
        assert!(bad_gamma.validate().is_err());
        assert!(DualAverageSettings::default().validate().is_ok());
    }

    fn decaying_acceptance(step_size: f64) -> std::result::Result<f64, ()> {
        Ok((-step_size).exp())
    }

    #[test]
    fn search_from_large_step() {
        let crossing = -(0.8f64.ln());
        let found = search_step_size(1., 0.8, decaying_acceptance).unwrap();
        assert!(found <= crossing);
        assert!(found * SEARCH_FACTOR > crossing);
    }

    #[test]
    fn search_from_small_step() {
        let crossing = -(0.8f64.ln());
        let found = search_step_size(0.1, 0.8, decaying_acceptance).unwrap();
        assert!(found <= crossing);
        assert!(found * SEARCH_FACTOR > crossing);
    }

    #[test]
    fn search_is_bounded() {
        let mut calls = 0;
        let found = search_step_size(1., 0.8, |_| {
            calls += 1;
            Ok::<_, ()>(1.)
        })
        .unwrap();
        assert!(found <= MAX_STEP_SIZE);
        assert!(calls <= SEARCH_MAX_ITER + 1);

        assert!(search_step_size(1., 0.8, |_| Err::<f64, _>("failed")).is_err());
    }
}

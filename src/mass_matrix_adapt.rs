use itertools::izip;

use crate::error::{Result, SamplerError};

/// Settings for mass matrix adaptation
#[derive(Debug, Clone, Copy)]
pub struct MassAdaptSettings {
    /// Estimate a diagonal mass from the draws of the adaptation window.
    pub enabled: bool,
    /// Variance that precision estimates from few draws are shrunk towards.
    pub prior_variance: f64,
    /// Fraction of the adaptation window at the start where draws are not
    /// used for the estimate.
    pub init_buffer_fraction: f64,
    /// Fraction of the adaptation window at the end that is left for step
    /// size adaptation with the final mass.
    pub term_buffer_fraction: f64,
}

impl Default for MassAdaptSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            prior_variance: 1e-3,
            init_buffer_fraction: 0.2,
            term_buffer_fraction: 0.5,
        }
    }
}

impl MassAdaptSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.prior_variance.is_finite() && self.prior_variance > 0.) {
            return Err(SamplerError::invalid("prior_variance must be positive"));
        }
        let buffers = [self.init_buffer_fraction, self.term_buffer_fraction];
        if buffers.iter().any(|f| !(0f64..=1.).contains(f))
            || self.init_buffer_fraction + self.term_buffer_fraction > 1.
        {
            return Err(SamplerError::invalid(
                "mass adaptation buffers must be fractions summing to at most one",
            ));
        }
        Ok(())
    }
}

/// Online mean and variance of vectors (Welford's algorithm).
#[derive(Debug, Clone)]
pub struct VarianceEstimator {
    mean: Box<[f64]>,
    s: Box<[f64]>,
    count: u64,
}

impl VarianceEstimator {
    pub fn new(dim: usize) -> Self {
        VarianceEstimator {
            mean: vec![0f64; dim].into(),
            s: vec![0f64; dim].into(),
            count: 0,
        }
    }

    /// Add one draw. Fails if `value` does not have the dimension of the
    /// estimator.
    pub fn add(&mut self, value: &[f64]) -> Result<()> {
        if value.len() != self.mean.len() {
            return Err(SamplerError::LayoutMismatch(format!(
                "expected {} values, got {}",
                self.mean.len(),
                value.len()
            )));
        }
        self.update(value);
        Ok(())
    }

    fn update(&mut self, value: &[f64]) {
        self.count += 1;
        let count = self.count as f64;
        izip!(value, self.mean.iter_mut(), self.s.iter_mut()).for_each(|(&x, mean, s)| {
            let delta = x - *mean;
            *mean += delta / count;
            *s += delta * (x - *mean);
        });
    }

    pub fn reset(&mut self) {
        self.mean.fill(0.);
        self.s.fill(0.);
        self.count = 0;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    /// Sample variance `s / (count - 1)`.
    ///
    /// A single draw has zero variance. Returns `None` before the first draw.
    pub fn variance(&self) -> Option<Box<[f64]>> {
        match self.count {
            0 => None,
            1 => Some(vec![0f64; self.s.len()].into()),
            count => {
                let scale = ((count - 1) as f64).recip();
                Some(self.s.iter().map(|s| s * scale).collect())
            }
        }
    }

    /// Inverse of the variance, shrunk towards `1 / prior_variance` with
    /// weight `5 / (count + 5)`.
    pub fn precision(&self, prior_variance: f64) -> Box<[f64]> {
        let rate = self.count as f64 / (self.count as f64 + 5.);
        match self.variance() {
            None => vec![prior_variance.recip(); self.s.len()].into(),
            Some(variance) => variance
                .iter()
                .map(|var| (rate * var + (1. - rate) * prior_variance).recip())
                .collect(),
        }
    }
}

/// What happens to the mass at the start of a draw.
#[derive(Debug, PartialEq)]
pub(crate) enum WindowEvent {
    None,
    /// The first draw of the run.
    Start,
    /// The estimation window closed, with the new mass.
    Closed(Box<[f64]>),
}

/// Collects draws inside the estimation window and produces a mass when
/// the window closes.
///
/// With `num_adapt` adaptation draws the window is
/// `[init_buffer, num_adapt - term_buffer)`, and the mass is replaced once
/// at draw `num_adapt - term_buffer`.
#[derive(Debug)]
pub(crate) struct MassWindow {
    estimator: VarianceEstimator,
    settings: MassAdaptSettings,
    init_buffer: u64,
    end: u64,
    chain_values: Box<[f64]>,
}

impl MassWindow {
    pub(crate) fn new(settings: MassAdaptSettings, num_adapt: u64, dim: usize) -> Self {
        let init_buffer = (num_adapt as f64 * settings.init_buffer_fraction) as u64;
        let term_buffer = (num_adapt as f64 * settings.term_buffer_fraction) as u64;
        MassWindow {
            estimator: VarianceEstimator::new(dim),
            settings,
            init_buffer,
            end: num_adapt.saturating_sub(term_buffer),
            chain_values: vec![0f64; dim].into(),
        }
    }

    /// Call once at the start of each draw with the current position of
    /// every chain.
    pub(crate) fn begin_draw(
        &mut self,
        draw: u64,
        position: &crate::layout::Position,
    ) -> WindowEvent {
        let event = if draw == 0 {
            WindowEvent::Start
        } else {
            WindowEvent::None
        };
        if !self.settings.enabled {
            return event;
        }
        if (draw >= self.init_buffer) & (draw < self.end) {
            for chain in 0..position.layout().n_chains() {
                position.write_chain(chain, &mut self.chain_values);
                self.estimator.update(&self.chain_values);
            }
        }
        if (draw == self.end) & (self.estimator.count() > 0) {
            let precision = self.estimator.precision(self.settings.prior_variance);
            log::debug!(
                "mass window closed at draw {} after {} samples",
                draw,
                self.estimator.count()
            );
            self.estimator.reset();
            return WindowEvent::Closed(precision);
        }
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{Layout, Position};
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, Normal};

    fn two_pass_variance(values: &[f64]) -> f64 {
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.)
    }

    proptest! {
        #[test]
        fn matches_two_pass(values in prop::collection::vec(-100f64..100f64, 2..50)) {
            let mut estimator = VarianceEstimator::new(1);
            for &x in values.iter() {
                estimator.add(&[x]).unwrap();
            }
            let expected = two_pass_variance(&values);
            let variance = estimator.variance().unwrap()[0];
            prop_assert!((variance - expected).abs() <= 1e-9 * expected.max(1.));
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            prop_assert!((estimator.mean()[0] - mean).abs() < 1e-9);
        }
    }

    #[test]
    fn converges_to_true_variance() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let normal = Normal::new(1., 2.).unwrap();
        let mut estimator = VarianceEstimator::new(1);
        let mut errors = vec![];
        for n in [100, 1000, 10000, 100000] {
            while estimator.count() < n {
                estimator.add(&[normal.sample(&mut rng)]).unwrap();
            }
            let error = (estimator.variance().unwrap()[0] - 4.).abs();
            // The standard error of the sample variance is sigma^2 sqrt(2 / (n - 1))
            assert!(error < 5. * 4. * (2. / (n as f64 - 1.)).sqrt());
            errors.push(error);
        }
        assert!(errors[3] < 0.1);
    }

    #[test]
    fn small_counts() {
        let mut estimator = VarianceEstimator::new(2);
        assert!(estimator.variance().is_none());
        assert_eq!(&*estimator.precision(1e-3), &[1e3, 1e3]);
        estimator.add(&[1., 2.]).unwrap();
        assert_eq!(&*estimator.variance().unwrap(), &[0., 0.]);
        estimator.add(&[3., 2.]).unwrap();
        assert_eq!(&*estimator.variance().unwrap(), &[2., 0.]);

        // rate = 2 / 7
        let precision = estimator.precision(1e-3);
        assert_relative_eq!(precision[0], 1. / (2. / 7. * 2. + 5. / 7. * 1e-3));

        assert!(matches!(
            estimator.add(&[1.]),
            Err(SamplerError::LayoutMismatch(_))
        ));
        assert_eq!(estimator.count(), 2);

        estimator.reset();
        assert_eq!(estimator.count(), 0);
        assert_eq!(estimator.mean(), &[0., 0.]);
        assert!(estimator.variance().is_none());
    }

    #[test]
    fn window_schedule() {
        let layout = Layout::new(2, [("x", vec![])]).unwrap();
        let settings = MassAdaptSettings {
            enabled: true,
            ..Default::default()
        };
        // init_buffer = 20, window end = 50
        let mut window = MassWindow::new(settings, 100, 1);
        let mut events = vec![];
        for draw in 0..100 {
            let value = if draw % 2 == 0 { 1. } else { -1. };
            let position = Position::from_variables(&layout, [("x", vec![value, value])]).unwrap();
            match window.begin_draw(draw, &position) {
                WindowEvent::None => (),
                event => events.push((draw, event)),
            }
        }
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], (0, WindowEvent::Start));
        let (draw, WindowEvent::Closed(mass)) = &events[1] else {
            panic!("Mass window did not close");
        };
        assert_eq!(*draw, 50);
        // 30 draws of two chains with variance 60 / 59
        let rate = 60. / 65.;
        assert_relative_eq!(mass[0], 1. / (rate * 60. / 59. + (1. - rate) * 1e-3));
    }

    #[test]
    fn disabled_window_never_closes() {
        let layout = Layout::new(1, [("x", vec![])]).unwrap();
        let mut window = MassWindow::new(MassAdaptSettings::default(), 100, 1);
        let position = Position::zeros(&layout);
        assert_eq!(window.begin_draw(0, &position), WindowEvent::Start);
        for draw in 1..100 {
            assert_eq!(window.begin_draw(draw, &position), WindowEvent::None);
        }
    }

    #[test]
    fn window_without_init_buffer_uses_first_draw() {
        let layout = Layout::new(1, [("x", vec![])]).unwrap();
        let settings = MassAdaptSettings {
            enabled: true,
            init_buffer_fraction: 0.,
            term_buffer_fraction: 0.5,
            ..Default::default()
        };
        // The window is [0, 2) and closes at draw 2
        let mut window = MassWindow::new(settings, 4, 1);
        let first = Position::from_variables(&layout, [("x", vec![3.])]).unwrap();
        let second = Position::from_variables(&layout, [("x", vec![1.])]).unwrap();
        assert_eq!(window.begin_draw(0, &first), WindowEvent::Start);
        assert_eq!(window.begin_draw(1, &second), WindowEvent::None);
        let WindowEvent::Closed(mass) = window.begin_draw(2, &second) else {
            panic!("Mass window did not close");
        };
        // Two samples 3 and 1 with variance 2
        let rate = 2. / 7.;
        assert_relative_eq!(mass[0], 1. / (rate * 2. + (1. - rate) * 1e-3));
    }
}

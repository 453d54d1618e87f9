use crate::layout::Position;
use crate::mass_matrix::DiagMassMatrix;
use crate::mass_matrix_adapt::{MassAdaptSettings, MassWindow, WindowEvent};
use crate::stepsize::{DualAverageSettings, StepSizeTuner};

/// The adaptation part of the HMC and NUTS settings.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AdaptOptions {
    pub(crate) step_size: f64,
    pub(crate) num_adapt: u64,
    pub(crate) adapt_step_size: bool,
    pub(crate) search_step_size: bool,
    pub(crate) dual_average: DualAverageSettings,
    pub(crate) mass_adapt: MassAdaptSettings,
}

/// Step size and mass adaptation during the first `num_adapt` draws.
///
/// At the start of a draw the mass window may replace the mass. The tuner
/// restarts on the first draw and after each mass update, where the
/// sampler may also search for a new initial step size. At the end of a
/// draw inside the adaptation window the acceptance rate is passed to the
/// tuner, which sets the step size for the next draw.
#[derive(Debug)]
pub(crate) struct AdaptStrategy {
    options: AdaptOptions,
    tuner: StepSizeTuner,
    mass_window: MassWindow,
    step_size: f64,
    restart: bool,
}

impl AdaptStrategy {
    pub(crate) fn new(options: AdaptOptions, dim: usize) -> Self {
        AdaptStrategy {
            tuner: StepSizeTuner::new(options.dual_average, options.num_adapt, options.step_size),
            mass_window: MassWindow::new(options.mass_adapt, options.num_adapt, dim),
            step_size: options.step_size,
            restart: false,
            options,
        }
    }

    /// Update the mass for the draw with index `draw`. Returns true if the
    /// caller should search for a new initial step size.
    pub(crate) fn begin_draw(
        &mut self,
        draw: u64,
        position: &Position,
        mass: &mut DiagMassMatrix,
    ) -> bool {
        self.restart = match self.mass_window.begin_draw(draw, position) {
            WindowEvent::None => false,
            WindowEvent::Start => true,
            WindowEvent::Closed(precision) => {
                mass.update_diag(precision.iter().copied());
                true
            }
        };
        self.restart && self.options.search_step_size && self.options.adapt_step_size
    }

    pub(crate) fn step_size(&self) -> f64 {
        self.step_size
    }

    pub(crate) fn set_step_size(&mut self, step_size: f64) {
        self.step_size = step_size;
    }

    pub(crate) fn target_accept(&self) -> f64 {
        self.options.dual_average.target_accept
    }

    pub(crate) fn end_draw(&mut self, draw: u64, acceptance_rate: f64) {
        if !self.options.adapt_step_size || draw >= self.options.num_adapt {
            return;
        }
        self.step_size = if self.restart {
            log::debug!(
                "restart step size adaptation at draw {} from {}",
                draw,
                self.step_size
            );
            self.tuner.restart_and_tune(self.step_size, acceptance_rate)
        } else {
            self.tuner.tune(acceptance_rate)
        };
        if draw + 1 == self.options.num_adapt {
            log::debug!("final step size {}", self.step_size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Layout;
    use crate::mass_matrix::MassSpec;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;

    fn options(num_adapt: u64) -> AdaptOptions {
        AdaptOptions {
            step_size: 1.,
            num_adapt,
            adapt_step_size: true,
            search_step_size: true,
            dual_average: DualAverageSettings::default(),
            mass_adapt: MassAdaptSettings {
                enabled: true,
                ..Default::default()
            },
        }
    }

    #[test]
    fn step_size_freezes_after_window() {
        let layout = Layout::new(1, [("x", vec![])]).unwrap();
        let mut mass = DiagMassMatrix::new(&layout, &MassSpec::identity()).unwrap();
        let position = Position::zeros(&layout);
        let mut adapt = AdaptStrategy::new(options(10), 1);

        let mut steps = vec![];
        for draw in 0..15 {
            adapt.begin_draw(draw, &position, &mut mass);
            steps.push(adapt.step_size());
            adapt.end_draw(draw, 0.3);
        }
        assert_eq!(steps[0], 1.);
        assert!(steps[1] != 1.);
        // The tuner returns the averaged step size on its last call
        for step in steps[10..].iter() {
            assert_eq!(*step, steps[10]);
        }
    }

    #[test]
    fn restart_events() {
        let layout = Layout::new(1, [("x", vec![])]).unwrap();
        let mut mass = DiagMassMatrix::new(&layout, &MassSpec::identity()).unwrap();
        let mut adapt = AdaptStrategy::new(options(100), 1);

        let mut searches = vec![];
        for draw in 0..100 {
            let value = if draw % 2 == 0 { 2. } else { -2. };
            let position = Position::from_variables(&layout, [("x", vec![value])]).unwrap();
            if adapt.begin_draw(draw, &position, &mut mass) {
                searches.push(draw);
            }
            adapt.end_draw(draw, 0.8);
        }
        assert_eq!(searches, vec![0, 50]);
        // 30 draws with variance 4 * 30 / 29
        let rate = 30. / 35.;
        assert_relative_eq!(
            mass.values()[0],
            1. / (rate * 4. * 30. / 29. + (1. - rate) * 1e-3)
        );
    }

    #[test]
    fn fixed_step_size() {
        let layout = Layout::new(1, [("x", vec![])]).unwrap();
        let mut mass = DiagMassMatrix::new(&layout, &MassSpec::identity()).unwrap();
        let position = Position::zeros(&layout);
        let mut adapt = AdaptStrategy::new(
            AdaptOptions {
                adapt_step_size: false,
                ..options(10)
            },
            1,
        );
        for draw in 0..20 {
            assert!(!adapt.begin_draw(draw, &position, &mut mass));
            adapt.end_draw(draw, 0.);
            assert_eq!(adapt.step_size(), 1.);
        }
    }
}

use rand::Rng;

use crate::adapt_strategy::{AdaptOptions, AdaptStrategy};
use crate::error::{check_logp, Result, SamplerError};
use crate::hamiltonian::{initial_point, Point};
use crate::integrator::{one_step_acceptance, trajectory, Direction};
use crate::layout::Position;
use crate::mass_matrix::{DiagMassMatrix, MassSpec};
use crate::mass_matrix_adapt::MassAdaptSettings;
use crate::math::{dot_of_diff, logaddexp};
use crate::model::GradientOracle;
use crate::sampler::Sampler;
use crate::stepsize::{search_step_size, DualAverageSettings};

/// Settings for the No-U-Turn sampler
#[derive(Debug, Clone, Copy)]
pub struct NutsSettings {
    pub step_size: f64,
    /// The maximum tree depth during sampling. The number of leapfrog steps
    /// is smaller than 2 ^ max_depth.
    pub max_depth: u64,
    /// If the energy error is larger than this threshold we treat the leapfrog
    /// step as a divergence.
    pub max_energy_error: f64,
    pub num_adapt: u64,
    pub adapt_step_size: bool,
    pub init_step_size: bool,
    pub dual_average: DualAverageSettings,
    pub mass_adapt: MassAdaptSettings,
}

impl Default for NutsSettings {
    fn default() -> Self {
        Self {
            step_size: 1.,
            max_depth: 10,
            max_energy_error: 1000.,
            num_adapt: 50,
            adapt_step_size: true,
            init_step_size: false,
            dual_average: DualAverageSettings::default(),
            mass_adapt: MassAdaptSettings::default(),
        }
    }
}

impl NutsSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.step_size.is_finite() && self.step_size > 0.) {
            return Err(SamplerError::invalid(format!(
                "step size must be positive, got {}",
                self.step_size
            )));
        }
        if self.max_depth == 0 {
            return Err(SamplerError::invalid("max_depth must be at least one"));
        }
        if !(self.max_energy_error > 0.) {
            return Err(SamplerError::invalid("max_energy_error must be positive"));
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

/// Information about a NUTS draw
#[derive(Debug, Clone)]
pub struct NutsDiagnostics {
    pub draw: u64,
    pub tuning: bool,
    pub step_size: f64,
    pub old_hamiltonian: f64,
    /// The hamiltonian of the selected point.
    pub new_hamiltonian: f64,
    /// Mean acceptance probability over all leapfrog steps of the
    /// trajectory, which is what the step size is tuned with.
    pub acceptance_rate: f64,
    pub divergence: bool,
    /// The depth of the trajectory that this point was sampled from
    pub tree_depth_reached: u64,
    /// Whether the trajectory was terminated because it reached
    /// the maximum tree depth.
    pub maxdepth_reached: bool,
    pub n_leapfrogs: u64,
    pub index_in_trajectory: i64,
}

/// A part of the trajectory tree during NUTS sampling.
#[derive(Debug)]
struct NutsTree {
    /// The left position of the tree.
    ///
    /// The left side always has the smaller index_in_trajectory.
    /// Leapfrogs in backward direction will replace the left.
    left: Point,
    right: Point,

    /// A draw from the trajectory between left and right using
    /// multinomial sampling.
    draw: Point,
    log_size: f64,
    depth: u64,

    /// A tree is the main tree if it contains the initial point
    /// of the trajectory.
    is_main: bool,
}

enum ExtendResult {
    /// The tree extension succeeded properly, and the termination
    /// criterion was not reached.
    Ok(NutsTree),
    /// Tree extension succeeded and the termination criterion
    /// was reached.
    Turning(NutsTree),
    /// A divergence happend during tree extension.
    Diverging(NutsTree),
}

/// The trajectory between `a` and `b` turns back on itself: the distance
/// between the ends shrinks when moving along the velocity of either end.
fn is_turning(a: &Point, b: &Point) -> bool {
    let (left, right) = if a.index_in_trajectory <= b.index_in_trajectory {
        (a, b)
    } else {
        (b, a)
    };
    let left_q = left.position.as_slice();
    let right_q = right.position.as_slice();
    (dot_of_diff(right_q, left_q, &left.velocity) < 0.)
        | (dot_of_diff(right_q, left_q, &right.velocity) < 0.)
}

impl NutsTree {
    fn new(point: Point) -> NutsTree {
        NutsTree {
            right: point.clone(),
            left: point.clone(),
            draw: point,
            depth: 0,
            log_size: 0.,
            is_main: true,
        }
    }

    fn leaf(point: Point, log_size: f64) -> NutsTree {
        NutsTree {
            is_main: false,
            log_size,
            ..NutsTree::new(point)
        }
    }

    /// The end of the tree where the next leapfrog step in `direction` starts.
    fn edge(&self, direction: Direction) -> &Point {
        match direction {
            Direction::Forward => &self.right,
            Direction::Backward => &self.left,
        }
    }

    /// Check for a U-turn in the tree that results from merging `other`
    /// into `self`, including the spans that cross the boundary between
    /// the two.
    fn is_turning_with(&self, other: &NutsTree, direction: Direction) -> bool {
        let (first, last) = match direction {
            Direction::Forward => (&self.left, &other.right),
            Direction::Backward => (&other.left, &self.right),
        };
        if is_turning(first, last) {
            return true;
        }
        if self.depth > 0 {
            return is_turning(&self.right, &other.right) || is_turning(&self.left, &other.left);
        }
        false
    }

    fn merge_into<R: Rng + ?Sized>(&mut self, other: NutsTree, rng: &mut R, direction: Direction) {
        assert!(self.depth == other.depth);
        assert!(self.left.index_in_trajectory <= self.right.index_in_trajectory);
        match direction {
            Direction::Forward => {
                self.right = other.right;
            }
            Direction::Backward => {
                self.left = other.left;
            }
        }
        let log_size = logaddexp(self.log_size, other.log_size);

        let self_log_size = if self.is_main {
            assert!(self.left.index_in_trajectory <= 0);
            assert!(self.right.index_in_trajectory >= 0);
            self.log_size
        } else {
            log_size
        };

        if (other.log_size >= self_log_size)
            || rng.random_bool((other.log_size - self_log_size).exp())
        {
            self.draw = other.draw;
        }

        self.depth += 1;
        self.log_size = log_size;
    }
}

/// Running sums of the per-draw tree statistics.
#[derive(Debug, Default)]
struct TreeStats {
    n_leapfrogs: u64,
    sum_accept: f64,
}

/// Builds the trajectory of one draw.
struct TreeBuilder<'a, F: GradientOracle, R: Rng> {
    oracle: &'a mut F,
    mass: &'a DiagMassMatrix,
    rng: &'a mut R,
    step_size: f64,
    initial_energy: f64,
    max_energy_error: f64,
    stats: TreeStats,
}

impl<'a, F: GradientOracle, R: Rng> TreeBuilder<'a, F, R> {
    /// One leapfrog step from `start`. Returns `None` for a divergence.
    fn single_step(&mut self, start: &Point, direction: Direction) -> Result<Option<NutsTree>> {
        let mut end = start.clone();
        let valid = check_logp(trajectory(
            self.oracle,
            self.mass,
            &mut end,
            self.step_size,
            1,
            direction,
        ))?;
        self.stats.n_leapfrogs += 1;

        let energy_error = end.energy(0) - self.initial_energy;
        if !valid || !end.is_finite(0) || !(energy_error.abs() <= self.max_energy_error) {
            log::trace!(
                "divergence at index {} with energy error {}",
                end.index_in_trajectory,
                energy_error
            );
            return Ok(None);
        }

        self.stats.sum_accept += (-energy_error).min(0.).exp();
        Ok(Some(NutsTree::leaf(end, -energy_error)))
    }

    /// Double the main tree by building a subtree of the same depth in
    /// `direction`.
    ///
    /// The subtree is built leaf by leaf. Completed subtrees of equal depth
    /// on the stack are merged right away, so the stack holds at most one
    /// tree per depth.
    fn extend(&mut self, mut main: NutsTree, direction: Direction) -> Result<ExtendResult> {
        let mut stack: Vec<NutsTree> = Vec::with_capacity(main.depth as usize + 1);
        let other = loop {
            let leaf = {
                let start = stack.last().unwrap_or(&main).edge(direction);
                self.single_step(start, direction)?
            };
            let Some(leaf) = leaf else {
                return Ok(ExtendResult::Diverging(main));
            };
            stack.push(leaf);

            while let [.., older, newer] = stack.as_slice() {
                if older.depth != newer.depth {
                    break;
                }
                let turning = older.is_turning_with(newer, direction);
                let newer = stack.pop().expect("stack holds two trees");
                let older = stack.last_mut().expect("stack holds two trees");
                older.merge_into(newer, self.rng, direction);
                if turning {
                    return Ok(ExtendResult::Turning(main));
                }
            }

            if let [tree] = stack.as_slice() {
                if tree.depth == main.depth {
                    break stack.pop().expect("stack holds one tree");
                }
            }
        };

        let turning = main.is_turning_with(&other, direction);
        main.merge_into(other, self.rng, direction);
        if turning {
            Ok(ExtendResult::Turning(main))
        } else {
            Ok(ExtendResult::Ok(main))
        }
    }
}

/// The No-U-Turn sampler for a single chain.
///
/// The trajectory is doubled in a random direction until it makes a
/// U-turn, diverges, or reaches the maximum depth. The draw is selected
/// from all points of the trajectory with multinomial sampling.
pub struct NutsSampler<F: GradientOracle, R: Rng> {
    oracle: F,
    rng: R,
    settings: NutsSettings,
    mass: DiagMassMatrix,
    current: Point,
    scratch: Point,
    adapt: AdaptStrategy,
    draw_count: u64,
    divergences: u64,
    maxdepth_hits: u64,
}

impl<F: GradientOracle, R: Rng> NutsSampler<F, R> {
    pub fn new(
        mut oracle: F,
        init: Position,
        mass: MassSpec,
        settings: NutsSettings,
        rng: R,
    ) -> Result<Self> {
        settings.validate()?;
        let layout = init.layout().clone();
        if layout.n_chains() != 1 {
            return Err(SamplerError::invalid(format!(
                "NUTS samples a single chain, but the layout has {} chains",
                layout.n_chains()
            )));
        }
        let mass = DiagMassMatrix::new(&layout, &mass)?;
        let current = initial_point(&mut oracle, init)?;
        Ok(NutsSampler {
            oracle,
            rng,
            adapt: AdaptStrategy::new(settings.adapt_options(), layout.chain_dim()),
            settings,
            mass,
            scratch: current.clone(),
            current,
            draw_count: 0,
            divergences: 0,
            maxdepth_hits: 0,
        })
    }

    pub fn settings(&self) -> &NutsSettings {
        &self.settings
    }

    pub fn mass(&self) -> &DiagMassMatrix {
        &self.mass
    }

    pub fn step_size(&self) -> f64 {
        self.adapt.step_size()
    }

    /// Number of draws with a divergent trajectory so far.
    pub fn divergence_count(&self) -> u64 {
        self.divergences
    }

    /// Number of draws that stopped at the maximum tree depth so far.
    pub fn maxdepth_count(&self) -> u64 {
        self.maxdepth_hits
    }
}

impl<F: GradientOracle, R: Rng> Sampler for NutsSampler<F, R> {
    type Diagnostics = NutsDiagnostics;

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

    fn draw(&mut self) -> Result<(Position, NutsDiagnostics)> {
        let draw = self.draw_count;
        let search = self
            .adapt
            .begin_draw(draw, &self.current.position, &mut self.mass);
        self.current.randomize_momentum(&self.mass, &mut self.rng);

        if search {
            let oracle = &mut self.oracle;
            let mass = &self.mass;
            let current = &self.current;
            let scratch = &mut self.scratch;
            let step_size = search_step_size(
                self.adapt.step_size(),
                self.adapt.target_accept(),
                |step_size| one_step_acceptance(oracle, mass, current, scratch, step_size),
            )?;
            self.adapt.set_step_size(step_size);
        }

        let step_size = self.adapt.step_size();
        let initial_energy = self.current.energy(0);
        let mut builder = TreeBuilder {
            oracle: &mut self.oracle,
            mass: &self.mass,
            rng: &mut self.rng,
            step_size,
            initial_energy,
            max_energy_error: self.settings.max_energy_error,
            stats: TreeStats::default(),
        };

        let mut tree = NutsTree::new(self.current.clone());
        let (tree, divergence, maxdepth_reached) = loop {
            if tree.depth >= self.settings.max_depth {
                break (tree, false, true);
            }
            let direction: Direction = builder.rng.random();
            tree = match builder.extend(tree, direction)? {
                ExtendResult::Ok(tree) => tree,
                ExtendResult::Turning(tree) => break (tree, false, false),
                ExtendResult::Diverging(tree) => break (tree, true, false),
            };
        };
        let stats = builder.stats;

        // Divergent steps count with an acceptance of zero
        let acceptance_rate = stats.sum_accept / stats.n_leapfrogs as f64;
        self.adapt.end_draw(draw, acceptance_rate);
        self.draw_count += 1;
        if divergence {
            self.divergences += 1;
        }
        if maxdepth_reached {
            self.maxdepth_hits += 1;
        }

        let diagnostics = NutsDiagnostics {
            draw,
            tuning: draw < self.settings.num_adapt,
            step_size,
            old_hamiltonian: initial_energy,
            new_hamiltonian: tree.draw.energy(0),
            acceptance_rate,
            divergence,
            tree_depth_reached: tree.depth,
            maxdepth_reached,
            n_leapfrogs: stats.n_leapfrogs,
            index_in_trajectory: tree.draw.index_in_trajectory,
        };
        self.current = tree.draw;
        Ok((self.current.position.clone(), diagnostics))
    }

    fn draw_count(&self) -> u64 {
        self.draw_count
    }
}

use std::fmt::Debug;

use crate::error::Result;
use crate::layout::Position;

/// A Markov chain sampler that owns its position, adaptation state and
/// random number generator.
pub trait Sampler {
    /// Information about a single draw.
    type Diagnostics: Debug + Clone;

    /// The current position of all chains.
    fn position(&self) -> &Position;

    /// Move all chains to a new position.
    ///
    /// The position must have the layout the sampler was created with, and
    /// the log density must be finite there. Adaptation state is kept.
    fn set_position(&mut self, position: Position) -> Result<()>;

    /// Advance the chains by one iteration and return the new position.
    fn draw(&mut self) -> Result<(Position, Self::Diagnostics)>;

    /// Number of finished draws.
    fn draw_count(&self) -> u64;
}

/// Run `draws` iterations of a sampler.
///
/// Iteration stops early at the first error, which is returned as the
/// last item.
pub fn sample_sequentially<S: Sampler>(
    sampler: &mut S,
    draws: u64,
) -> impl Iterator<Item = Result<(Position, S::Diagnostics)>> + '_ {
    let mut failed = false;
    (0..draws).map_while(move |_| {
        if failed {
            return None;
        }
        let result = sampler.draw();
        failed = result.is_err();
        Some(result)
    })
}

//! The fixed mapping from variable names to array shapes, and the
//! chain state stored according to it.
//!
//! All values of a variable are stored contiguously, with the chain axis
//! first. For a layout with `n_chains` chains and variables `a` (shape
//! `[2]`) and `b` (shape `[]`) the flat buffer looks like
//!
//! ```text
//! [a(chain 0), a(chain 0), a(chain 1), a(chain 1), b(chain 0), b(chain 1)]
//! ```
//!
//! Per-variable quantities without a chain axis (the mass) use the same
//! order with the chain axis removed.

use std::ops::Range;
use std::sync::Arc;

use crate::error::{Result, SamplerError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableSpec {
    name: String,
    shape: Box<[usize]>,
    size: usize,
    offset: usize,
    chain_offset: usize,
}

impl VariableSpec {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of values of this variable in one chain.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Offset of this variable inside one chain's values, which is
    /// also its offset in the mass.
    pub fn chain_offset(&self) -> usize {
        self.chain_offset
    }
}

/// Names and shapes of the sampled variables, and the number of chains
/// that are simulated as parallel lanes.
#[derive(Debug, PartialEq, Eq)]
pub struct Layout {
    n_chains: usize,
    variables: Vec<VariableSpec>,
    chain_dim: usize,
}

impl Layout {
    /// Validate and build a layout.
    ///
    /// Variable names must be unique and every variable must hold at least
    /// one value. A shape of `[]` is a scalar.
    pub fn new<S: Into<String>>(
        n_chains: usize,
        variables: impl IntoIterator<Item = (S, Vec<usize>)>,
    ) -> Result<Arc<Layout>> {
        if n_chains == 0 {
            return Err(SamplerError::invalid("layout needs at least one chain"));
        }
        let mut specs: Vec<VariableSpec> = Vec::new();
        let mut chain_dim = 0;
        for (name, shape) in variables {
            let name = name.into();
            if specs.iter().any(|spec| spec.name == name) {
                return Err(SamplerError::invalid(format!(
                    "variable '{}' appears twice",
                    name
                )));
            }
            let size: usize = shape.iter().product();
            if size == 0 {
                return Err(SamplerError::invalid(format!(
                    "variable '{}' has no elements",
                    name
                )));
            }
            specs.push(VariableSpec {
                name,
                shape: shape.into(),
                size,
                offset: chain_dim * n_chains,
                chain_offset: chain_dim,
            });
            chain_dim += size;
        }
        if specs.is_empty() {
            return Err(SamplerError::invalid("layout needs at least one variable"));
        }
        Ok(Arc::new(Layout {
            n_chains,
            variables: specs,
            chain_dim,
        }))
    }

    pub fn n_chains(&self) -> usize {
        self.n_chains
    }

    pub fn variables(&self) -> &[VariableSpec] {
        &self.variables
    }

    pub fn variable_index(&self, name: &str) -> Option<usize> {
        self.variables.iter().position(|spec| spec.name == name)
    }

    /// Number of values per chain.
    pub fn chain_dim(&self) -> usize {
        self.chain_dim
    }

    /// Total number of values over all chains.
    pub fn len(&self) -> usize {
        self.chain_dim * self.n_chains
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Range of all values of a variable in the flat buffer.
    pub fn variable_range(&self, var: usize) -> Range<usize> {
        let spec = &self.variables[var];
        spec.offset..spec.offset + spec.size * self.n_chains
    }

    /// Range of the values of one variable in one chain.
    pub fn chain_range(&self, var: usize, chain: usize) -> Range<usize> {
        let spec = &self.variables[var];
        let start = spec.offset + chain * spec.size;
        start..start + spec.size
    }

    /// Pairs of (range in the flat buffer, range in the per-chain mass)
    /// covering all values of one chain.
    pub(crate) fn chain_blocks(
        &self,
        chain: usize,
    ) -> impl Iterator<Item = (Range<usize>, Range<usize>)> + '_ {
        self.variables.iter().enumerate().map(move |(i, spec)| {
            (
                self.chain_range(i, chain),
                spec.chain_offset..spec.chain_offset + spec.size,
            )
        })
    }
}

/// Values for every variable of a layout, for all chains.
///
/// This is used both for the chain position and for gradients.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    layout: Arc<Layout>,
    data: Box<[f64]>,
}

impl Position {
    pub fn zeros(layout: &Arc<Layout>) -> Position {
        Position {
            layout: layout.clone(),
            data: vec![0f64; layout.len()].into(),
        }
    }

    /// Build a position from named values.
    ///
    /// Every variable of the layout must be given exactly once, with
    /// `n_chains * size` values in chain-major order.
    pub fn from_variables<'a>(
        layout: &Arc<Layout>,
        values: impl IntoIterator<Item = (&'a str, Vec<f64>)>,
    ) -> Result<Position> {
        let mut position = Position::zeros(layout);
        let mut seen = vec![false; layout.variables().len()];
        for (name, vals) in values {
            let idx = layout.variable_index(name).ok_or_else(|| {
                SamplerError::LayoutMismatch(format!("unknown variable '{}'", name))
            })?;
            if seen[idx] {
                return Err(SamplerError::LayoutMismatch(format!(
                    "variable '{}' given twice",
                    name
                )));
            }
            let range = layout.variable_range(idx);
            if vals.len() != range.len() {
                return Err(SamplerError::LayoutMismatch(format!(
                    "variable '{}' needs {} values, got {}",
                    name,
                    range.len(),
                    vals.len()
                )));
            }
            position.data[range].copy_from_slice(&vals);
            seen[idx] = true;
        }
        if let Some(missing) = seen.iter().position(|&s| !s) {
            return Err(SamplerError::LayoutMismatch(format!(
                "variable '{}' is missing",
                layout.variables()[missing].name()
            )));
        }
        Ok(position)
    }

    pub fn layout(&self) -> &Arc<Layout> {
        &self.layout
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// All values of a variable, chain axis first.
    pub fn variable(&self, name: &str) -> Option<&[f64]> {
        let idx = self.layout.variable_index(name)?;
        Some(&self.data[self.layout.variable_range(idx)])
    }

    pub fn variable_mut(&mut self, name: &str) -> Option<&mut [f64]> {
        let idx = self.layout.variable_index(name)?;
        let range = self.layout.variable_range(idx);
        Some(&mut self.data[range])
    }

    /// Values of one variable in one chain.
    pub fn chain_variable(&self, name: &str, chain: usize) -> Option<&[f64]> {
        let idx = self.layout.variable_index(name)?;
        if chain >= self.layout.n_chains() {
            return None;
        }
        Some(&self.data[self.layout.chain_range(idx, chain)])
    }

    /// Write the values of one chain into `out` in mass order.
    pub(crate) fn write_chain(&self, chain: usize, out: &mut [f64]) {
        assert!(out.len() == self.layout.chain_dim());
        for (data, mass) in self.layout.chain_blocks(chain) {
            out[mass].copy_from_slice(&self.data[data]);
        }
    }

    pub(crate) fn copy_chain_from(&mut self, other: &Position, chain: usize) {
        for (data, _) in self.layout.chain_blocks(chain) {
            self.data[data.clone()].copy_from_slice(&other.data[data]);
        }
    }

    pub(crate) fn is_chain_finite(&self, chain: usize) -> bool {
        self.layout
            .chain_blocks(chain)
            .all(|(data, _)| self.data[data].iter().all(|x| x.is_finite()))
    }

    pub(crate) fn same_layout(&self, layout: &Arc<Layout>) -> bool {
        Arc::ptr_eq(&self.layout, layout) || *self.layout == **layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn flat_order() {
        let layout = Layout::new(2, [("a", vec![2]), ("b", vec![])]).unwrap();
        assert_eq!(layout.chain_dim(), 3);
        assert_eq!(layout.len(), 6);
        assert_eq!(layout.variable_range(0), 0..4);
        assert_eq!(layout.variable_range(1), 4..6);
        assert_eq!(layout.chain_range(0, 1), 2..4);
        assert_eq!(layout.chain_range(1, 1), 5..6);

        let position = Position::from_variables(
            &layout,
            [("b", vec![5., 6.]), ("a", vec![1., 2., 3., 4.])],
        )
        .unwrap();
        assert_eq!(position.as_slice(), &[1., 2., 3., 4., 5., 6.]);
        assert_eq!(position.chain_variable("a", 1).unwrap(), &[3., 4.]);

        let mut chain = vec![0.; 3];
        position.write_chain(1, &mut chain);
        assert_eq!(chain, vec![3., 4., 6.]);
    }

    #[test]
    fn invalid_layouts() {
        assert!(Layout::new(0, [("a", vec![1])]).is_err());
        assert!(Layout::new(1, [("a", vec![1]), ("a", vec![2])]).is_err());
        assert!(Layout::new(1, [("a", vec![2, 0])]).is_err());
        assert!(Layout::new::<&str>(1, []).is_err());
    }

    #[test]
    fn invalid_positions() {
        let layout = Layout::new(1, [("a", vec![2]), ("b", vec![])]).unwrap();
        assert!(Position::from_variables(&layout, [("a", vec![1., 2.])]).is_err());
        assert!(Position::from_variables(&layout, [("a", vec![1.]), ("b", vec![1.])]).is_err());
        assert!(Position::from_variables(&layout, [("c", vec![1.])]).is_err());
    }

    #[test]
    fn copy_single_chain() {
        let layout = Layout::new(2, [("a", vec![2])]).unwrap();
        let mut target = Position::zeros(&layout);
        let source = Position::from_variables(&layout, [("a", vec![1., 2., 3., 4.])]).unwrap();
        target.copy_chain_from(&source, 1);
        assert_eq!(target.as_slice(), &[0., 0., 3., 4.]);
        assert!(target.is_chain_finite(0));
        target.as_mut_slice()[0] = f64::NAN;
        assert!(!target.is_chain_finite(0));
        assert!(target.is_chain_finite(1));
    }
}

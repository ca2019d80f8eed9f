//! Afferent pathway descriptors and the window sums shared by every coder
//! and predictor.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{ensure_size, Error, Result};
use crate::geometry::{Int2, ReceptiveField};
use crate::grid::Grid;

/// Geometry and learning parameters of one visible source.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VisibleLayerDesc {
    pub size: Int2,
    pub radius: i32,
    /// Per-source learning-rate multiplier.
    pub alpha: f32,
    /// Skip the connection at offset (0, 0) (self connections).
    pub ignore_middle: bool,
    /// Allocate eligibility traces for this source's connections.
    pub use_trace: bool,
}

impl Default for VisibleLayerDesc {
    fn default() -> Self {
        Self {
            size: Int2::new(8, 8),
            radius: 2,
            alpha: 1.0,
            ignore_middle: false,
            use_trace: false,
        }
    }
}

impl VisibleLayerDesc {
    pub fn new(size: Int2, radius: i32) -> Self {
        Self {
            size,
            radius,
            ..Default::default()
        }
    }

    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_ignore_middle(mut self, ignore_middle: bool) -> Self {
        self.ignore_middle = ignore_middle;
        self
    }

    pub fn with_trace(mut self, use_trace: bool) -> Self {
        self.use_trace = use_trace;
        self
    }

    pub(crate) fn field(&self, hidden_size: Int2) -> Result<ReceptiveField> {
        ReceptiveField::new(self.size, hidden_size, self.radius, self.ignore_middle)
    }
}

/// Weighted sum over hidden cell `h`'s forward window.
#[inline]
pub(crate) fn forward_sum(field: &ReceptiveField, weights: &Grid, input: &Grid, h: usize) -> f32 {
    let col = weights.column(h);
    let inp = input.data();
    field
        .forward(h)
        .iter()
        .map(|s| col[s.slot] * inp[s.cell])
        .sum()
}

/// Weighted sum of hidden values over visible cell `v`'s reverse window
/// (tied weights: the same columns the forward pass uses).
#[inline]
pub(crate) fn reverse_sum(field: &ReceptiveField, weights: &Grid, hidden: &Grid, v: usize) -> f32 {
    let slots = weights.depth();
    let w = weights.data();
    let hid = hidden.data();
    field
        .reverse(v)
        .iter()
        .map(|s| w[s.cell * slots + s.slot] * hid[s.cell])
        .sum()
}

/// Validate the caller's visible states against the layer descriptors.
pub(crate) fn check_sources(descs: &[VisibleLayerDesc], states: &[&Grid]) -> Result<()> {
    if descs.len() != states.len() {
        return Err(Error::SourceCount {
            expected: descs.len(),
            actual: states.len(),
        });
    }
    for (d, s) in descs.iter().zip(states) {
        ensure_size("visible state", d.size, s.size())?;
    }
    Ok(())
}

pub(crate) fn check_descs(hidden_size: Int2, descs: &[VisibleLayerDesc]) -> Result<()> {
    if hidden_size.x <= 0 || hidden_size.y <= 0 {
        return Err(Error::InvalidGeometry(format!(
            "hidden size {hidden_size:?} must be positive"
        )));
    }
    if descs.is_empty() {
        return Err(Error::InvalidGeometry(
            "at least one visible layer is required".to_string(),
        ));
    }
    Ok(())
}

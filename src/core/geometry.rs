//! Receptive-field geometry between a visible grid and a hidden grid.
//!
//! Every hidden cell looks at a square window of visible cells around its
//! projected center. The inverse relation (which hidden cells see a given
//! visible cell) is needed by every backward pass: reconstruction, error
//! propagation and hidden-error projection. Both directions are enumerated
//! once in [`ReceptiveField::new`] and stored in CSR form, so kernels only
//! walk flat slices.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Integer 2D coordinate or size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Int2 {
    pub x: i32,
    pub y: i32,
}

impl Int2 {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Number of cells in a grid of this size.
    #[inline]
    pub fn area(self) -> usize {
        (self.x.max(0) as usize) * (self.y.max(0) as usize)
    }

    #[inline]
    pub fn contains(self, pos: Int2) -> bool {
        pos.x >= 0 && pos.y >= 0 && pos.x < self.x && pos.y < self.y
    }

    /// Row-major cell index of `pos` inside a grid of this size.
    #[inline]
    pub fn index_of(self, pos: Int2) -> usize {
        pos.x as usize + pos.y as usize * self.x as usize
    }

    /// Inverse of [`index_of`](Self::index_of).
    #[inline]
    pub fn position_of(self, index: usize) -> Int2 {
        let w = self.x as usize;
        Int2::new((index % w) as i32, (index / w) as i32)
    }
}

/// Project `pos` through a per-axis scale ratio and round to the nearest cell.
#[inline]
pub fn project(pos: Int2, ratio: (f32, f32)) -> Int2 {
    Int2::new(
        (pos.x as f32 * ratio.0).round() as i32,
        (pos.y as f32 * ratio.1).round() as i32,
    )
}

/// One (cell, weight slot) link.
///
/// In a forward list `cell` is a visible cell; in a reverse list it is a
/// hidden cell. `slot` always indexes the hidden cell's weight column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Synapse {
    pub cell: usize,
    pub slot: usize,
}

#[derive(Debug, Clone, Default)]
struct CsrLinks {
    offsets: Vec<usize>,
    links: Vec<Synapse>,
}

impl CsrLinks {
    #[inline]
    fn row(&self, i: usize) -> &[Synapse] {
        &self.links[self.offsets[i]..self.offsets[i + 1]]
    }
}

/// Immutable window membership for one (visible, hidden, radius) triple.
#[derive(Debug, Clone)]
pub struct ReceptiveField {
    visible_size: Int2,
    hidden_size: Int2,
    radius: i32,
    ignore_middle: bool,
    reverse_radius: Int2,
    hidden_to_visible: (f32, f32),
    forward: CsrLinks,
    reverse: CsrLinks,
}

impl ReceptiveField {
    pub fn new(
        visible_size: Int2,
        hidden_size: Int2,
        radius: i32,
        ignore_middle: bool,
    ) -> Result<Self> {
        if visible_size.x <= 0 || visible_size.y <= 0 {
            return Err(Error::InvalidGeometry(format!(
                "visible size {visible_size:?} must be positive"
            )));
        }
        if hidden_size.x <= 0 || hidden_size.y <= 0 {
            return Err(Error::InvalidGeometry(format!(
                "hidden size {hidden_size:?} must be positive"
            )));
        }
        if radius < 0 {
            return Err(Error::InvalidGeometry(format!(
                "radius {radius} must be >= 0"
            )));
        }

        let hidden_to_visible = (
            visible_size.x as f32 / hidden_size.x as f32,
            visible_size.y as f32 / hidden_size.y as f32,
        );
        let visible_to_hidden = (
            hidden_size.x as f32 / visible_size.x as f32,
            hidden_size.y as f32 / visible_size.y as f32,
        );

        // The extra half cell absorbs the rounding of the forward center.
        let reverse_radius = Int2::new(
            ((radius as f32 + 0.5) * visible_to_hidden.0).ceil() as i32,
            ((radius as f32 + 0.5) * visible_to_hidden.1).ceil() as i32,
        );

        let mut field = Self {
            visible_size,
            hidden_size,
            radius,
            ignore_middle,
            reverse_radius,
            hidden_to_visible,
            forward: CsrLinks::default(),
            reverse: CsrLinks::default(),
        };

        field.forward = field.build_forward();
        field.reverse = field.build_reverse(visible_to_hidden);

        Ok(field)
    }

    fn build_forward(&self) -> CsrLinks {
        let n = self.hidden_size.area();
        let diam = self.diameter();
        let mut csr = CsrLinks {
            offsets: Vec::with_capacity(n + 1),
            links: Vec::with_capacity(n * self.slots()),
        };
        csr.offsets.push(0);

        for h in 0..n {
            let center = self.center(self.hidden_size.position_of(h));
            for dx in -self.radius..=self.radius {
                for dy in -self.radius..=self.radius {
                    if self.ignore_middle && dx == 0 && dy == 0 {
                        continue;
                    }
                    let v = Int2::new(center.x + dx, center.y + dy);
                    if !self.visible_size.contains(v) {
                        continue;
                    }
                    csr.links.push(Synapse {
                        cell: self.visible_size.index_of(v),
                        slot: ((dx + self.radius) * diam + (dy + self.radius)) as usize,
                    });
                }
            }
            csr.offsets.push(csr.links.len());
        }

        csr
    }

    fn build_reverse(&self, visible_to_hidden: (f32, f32)) -> CsrLinks {
        let n = self.visible_size.area();
        let diam = self.diameter();
        let rr = self.reverse_radius;
        let mut csr = CsrLinks {
            offsets: Vec::with_capacity(n + 1),
            links: Vec::new(),
        };
        csr.offsets.push(0);

        for v in 0..n {
            let vpos = self.visible_size.position_of(v);
            let hidden_center = project(vpos, visible_to_hidden);

            for dx in -rr.x..=rr.x {
                for dy in -rr.y..=rr.y {
                    let hpos = Int2::new(hidden_center.x + dx, hidden_center.y + dy);
                    if !self.hidden_size.contains(hpos) {
                        continue;
                    }
                    let c = self.center(hpos);
                    let off = Int2::new(vpos.x - c.x, vpos.y - c.y);
                    if off.x.abs() > self.radius || off.y.abs() > self.radius {
                        continue;
                    }
                    if self.ignore_middle && off.x == 0 && off.y == 0 {
                        continue;
                    }
                    csr.links.push(Synapse {
                        cell: self.hidden_size.index_of(hpos),
                        slot: ((off.x + self.radius) * diam + (off.y + self.radius)) as usize,
                    });
                }
            }
            csr.offsets.push(csr.links.len());
        }

        csr
    }

    /// Visible cell a hidden cell's window is centered on.
    #[inline]
    pub fn center(&self, hidden: Int2) -> Int2 {
        project(hidden, self.hidden_to_visible)
    }

    /// Visible cells (with weight slots) feeding hidden cell `hidden`.
    #[inline]
    pub fn forward(&self, hidden: usize) -> &[Synapse] {
        self.forward.row(hidden)
    }

    /// Hidden cells (with their weight slots) that see visible cell `visible`.
    #[inline]
    pub fn reverse(&self, visible: usize) -> &[Synapse] {
        self.reverse.row(visible)
    }

    pub fn visible_size(&self) -> Int2 {
        self.visible_size
    }

    pub fn hidden_size(&self) -> Int2 {
        self.hidden_size
    }

    pub fn radius(&self) -> i32 {
        self.radius
    }

    pub fn reverse_radius(&self) -> Int2 {
        self.reverse_radius
    }

    pub fn diameter(&self) -> i32 {
        self.radius * 2 + 1
    }

    /// Depth of the weight column each hidden cell owns: `(2r+1)²`.
    pub fn slots(&self) -> usize {
        let d = self.diameter() as usize;
        d * d
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_symmetry(visible: Int2, hidden: Int2, radius: i32, ignore_middle: bool) {
        let field = ReceptiveField::new(visible, hidden, radius, ignore_middle).unwrap();
        for h in 0..hidden.area() {
            for syn in field.forward(h) {
                let back = field.reverse(syn.cell);
                assert!(
                    back.iter().any(|r| r.cell == h && r.slot == syn.slot),
                    "hidden {h} missing from reverse window of visible {} ({visible:?} -> {hidden:?}, r={radius})",
                    syn.cell
                );
            }
        }
    }

    #[test]
    fn forward_and_reverse_windows_agree() {
        check_symmetry(Int2::new(4, 4), Int2::new(4, 4), 1, false);
        check_symmetry(Int2::new(4, 4), Int2::new(8, 8), 1, false);
        check_symmetry(Int2::new(16, 16), Int2::new(8, 8), 2, false);
        check_symmetry(Int2::new(7, 5), Int2::new(3, 9), 1, false);
        check_symmetry(Int2::new(10, 10), Int2::new(10, 10), 2, true);
        check_symmetry(Int2::new(3, 3), Int2::new(11, 7), 0, false);
    }

    #[test]
    fn reverse_lists_contain_nothing_extra() {
        let field = ReceptiveField::new(Int2::new(9, 6), Int2::new(5, 5), 1, false).unwrap();
        let forward_total: usize = (0..25).map(|h| field.forward(h).len()).sum();
        let reverse_total: usize = (0..54).map(|v| field.reverse(v).len()).sum();
        assert_eq!(forward_total, reverse_total);
    }

    #[test]
    fn windows_shrink_at_edges() {
        let field = ReceptiveField::new(Int2::new(8, 8), Int2::new(8, 8), 1, false).unwrap();
        assert_eq!(field.forward(0).len(), 4);
        assert_eq!(field.forward(Int2::new(8, 8).index_of(Int2::new(3, 3))).len(), 9);
        assert_eq!(field.slots(), 9);
    }

    #[test]
    fn ignore_middle_skips_center() {
        let field = ReceptiveField::new(Int2::new(5, 5), Int2::new(5, 5), 1, true).unwrap();
        let h = Int2::new(5, 5).index_of(Int2::new(2, 2));
        assert_eq!(field.forward(h).len(), 8);
        assert!(field.forward(h).iter().all(|s| s.cell != h));
    }

    #[test]
    fn membership_is_reproducible() {
        let a = ReceptiveField::new(Int2::new(12, 7), Int2::new(6, 6), 2, false).unwrap();
        let b = ReceptiveField::new(Int2::new(12, 7), Int2::new(6, 6), 2, false).unwrap();
        for h in 0..36 {
            assert_eq!(a.forward(h), b.forward(h));
        }
    }

    #[test]
    fn rejects_degenerate_sizes() {
        assert!(ReceptiveField::new(Int2::new(0, 4), Int2::new(4, 4), 1, false).is_err());
        assert!(ReceptiveField::new(Int2::new(4, 4), Int2::new(4, 4), -1, false).is_err());
    }
}

//! Dense float grids and the ping-pong buffer that carries them between
//! passes.

use crate::geometry::Int2;
use crate::prng::RandomSource;

/// 2D (or 3D) tensor of `f32`.
///
/// Cells are row-major (`x + y * width`). A 3D grid stores the `depth`
/// values of each cell contiguously, so a cell's weight column is one slice.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    width: usize,
    height: usize,
    depth: usize,
    data: Vec<f32>,
}

impl Grid {
    pub fn new(size: Int2) -> Self {
        Self::new_3d(size, 1)
    }

    pub fn new_3d(size: Int2, depth: usize) -> Self {
        Self::filled(size, depth, 0.0)
    }

    pub fn filled(size: Int2, depth: usize, value: f32) -> Self {
        let width = size.x.max(0) as usize;
        let height = size.y.max(0) as usize;
        Self {
            width,
            height,
            depth,
            data: vec![value; width * height * depth],
        }
    }

    /// Grid with every value drawn uniformly from `range`.
    pub fn random(size: Int2, depth: usize, range: (f32, f32), rng: &mut impl RandomSource) -> Self {
        let mut grid = Self::new_3d(size, depth);
        for v in &mut grid.data {
            *v = rng.gen_range_f32(range.0, range.1);
        }
        grid
    }

    /// Build a 2D grid from row-major values.
    ///
    /// # Panics
    /// Panics if `values.len()` does not match the size.
    pub fn from_values(size: Int2, values: Vec<f32>) -> Self {
        assert_eq!(values.len(), size.area(), "value count must match grid size");
        Self {
            width: size.x as usize,
            height: size.y as usize,
            depth: 1,
            data: values,
        }
    }

    #[inline]
    pub fn size(&self) -> Int2 {
        Int2::new(self.width as i32, self.height as i32)
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Number of cells (not values).
    #[inline]
    pub fn cells(&self) -> usize {
        self.width * self.height
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[(x + y * self.width) * self.depth]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: f32) {
        self.data[(x + y * self.width) * self.depth] = value;
    }

    #[inline]
    pub fn get_3d(&self, x: usize, y: usize, z: usize) -> f32 {
        self.data[(x + y * self.width) * self.depth + z]
    }

    /// The `depth` values of one cell.
    #[inline]
    pub fn column(&self, cell: usize) -> &[f32] {
        &self.data[cell * self.depth..(cell + 1) * self.depth]
    }

    pub fn fill(&mut self, value: f32) {
        self.data.iter_mut().for_each(|v| *v = value);
    }

    /// Copy all values from a grid of identical shape.
    ///
    /// # Panics
    /// Panics if the shapes differ.
    pub fn copy_from(&mut self, other: &Grid) {
        assert_eq!(
            (self.width, self.height, self.depth),
            (other.width, other.height, other.depth),
            "grid shapes must match"
        );
        self.data.copy_from_slice(&other.data);
    }

    pub fn sum(&self) -> f32 {
        self.data.iter().sum()
    }

    pub fn sum_squares(&self) -> f32 {
        self.data.iter().map(|v| v * v).sum()
    }

    pub fn mean(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.sum() / self.data.len() as f32
    }

    /// Mean squared difference against a grid of identical shape.
    pub fn mean_squared_error(&self, other: &Grid) -> f32 {
        debug_assert_eq!(self.data.len(), other.data.len());
        if self.data.is_empty() {
            return 0.0;
        }
        let sum: f32 = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| (a - b) * (a - b))
            .sum();
        sum / self.data.len() as f32
    }
}

/// Ping-pong pair of buffers.
///
/// Passes read [`back`](Self::back) and write [`front_mut`](Self::front_mut);
/// [`swap`](Self::swap) publishes the written side as the new back. Nothing
/// swaps implicitly: the owner decides where one pass ends.
#[derive(Debug, Clone)]
pub struct DoubleBuffer<T> {
    buffers: [T; 2],
    front: usize,
}

impl<T: Clone> DoubleBuffer<T> {
    /// Both sides start as copies of `value`.
    pub fn splat(value: T) -> Self {
        Self {
            buffers: [value.clone(), value],
            front: 0,
        }
    }
}

impl<T> DoubleBuffer<T> {
    pub fn new(front: T, back: T) -> Self {
        Self {
            buffers: [front, back],
            front: 0,
        }
    }

    /// Read side.
    #[inline]
    pub fn back(&self) -> &T {
        &self.buffers[1 - self.front]
    }

    /// Write side.
    #[inline]
    pub fn front_mut(&mut self) -> &mut T {
        &mut self.buffers[self.front]
    }

    /// Inspect the write side. Right after a swap this is the previous back.
    #[inline]
    pub fn front(&self) -> &T {
        &self.buffers[self.front]
    }

    /// Write side and read side at once, for kernels that fold their own
    /// previous value into the next one.
    #[inline]
    pub fn split(&mut self) -> (&mut T, &T) {
        let (a, b) = self.buffers.split_at_mut(1);
        if self.front == 0 {
            (&mut a[0], &b[0])
        } else {
            (&mut b[0], &a[0])
        }
    }

    #[inline]
    pub fn swap(&mut self) {
        self.front = 1 - self.front;
    }

    /// Apply `f` to both sides (state resets).
    pub fn reset_with(&mut self, mut f: impl FnMut(&mut T)) {
        for b in &mut self.buffers {
            f(b);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prng::Prng;

    #[test]
    fn double_swap_restores_roles() {
        let mut db = DoubleBuffer::new(Grid::filled(Int2::new(2, 2), 1, 1.0), Grid::new(Int2::new(2, 2)));
        let front_before = db.front().clone();
        let back_before = db.back().clone();
        db.swap();
        db.swap();
        assert_eq!(db.front(), &front_before);
        assert_eq!(db.back(), &back_before);
    }

    #[test]
    fn front_after_swap_is_previous_back() {
        let mut db = DoubleBuffer::splat(Grid::new(Int2::new(3, 1)));
        db.front_mut().fill(5.0);
        db.swap();
        assert!(db.back().data().iter().all(|&v| v == 5.0));

        let previous_back = db.back().clone();
        db.swap();
        assert_eq!(db.front(), &previous_back);
    }

    #[test]
    fn split_reads_back_writes_front() {
        let mut db = DoubleBuffer::splat(Grid::new(Int2::new(2, 1)));
        db.front_mut().fill(2.0);
        db.swap();
        {
            let (front, back) = db.split();
            for (o, i) in front.data_mut().iter_mut().zip(back.data()) {
                *o = i * 3.0;
            }
        }
        db.swap();
        assert_eq!(db.back().data(), &[6.0, 6.0]);
    }

    #[test]
    fn columns_are_contiguous() {
        let mut g = Grid::new_3d(Int2::new(2, 2), 3);
        g.data_mut()[3..6].copy_from_slice(&[1.0, 2.0, 3.0]);
        assert_eq!(g.column(1), &[1.0, 2.0, 3.0]);
        assert_eq!(g.get_3d(1, 0, 2), 3.0);
    }

    #[test]
    fn random_grid_respects_range() {
        let mut rng = Prng::new(5);
        let g = Grid::random(Int2::new(8, 8), 4, (-0.1, 0.1), &mut rng);
        assert_eq!(g.len(), 256);
        assert!(g.data().iter().all(|v| (-0.1..0.1).contains(v)));
    }
}

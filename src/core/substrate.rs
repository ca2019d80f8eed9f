//! Per-cell compute launches.
//!
//! Each launch evaluates a kernel for every cell of an output grid. A kernel
//! only reads its inputs and writes its own cell, so cells within one launch
//! are independent and can run on any tier. Ordering between launches is the
//! caller's job (see [`DoubleBuffer`](crate::grid::DoubleBuffer)).

#[cfg(feature = "parallel")]
use rayon::prelude::*;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[cfg(feature = "simd")]
use wide::f32x4;

/// Execution tier for launches.
///
/// - `Scalar`: single-threaded loop (works everywhere).
/// - `Simd`: single-threaded, dense element-wise passes vectorized with `wide`.
/// - `Parallel`: cells distributed over the rayon pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ExecutionTier {
    #[default]
    Scalar,
    Simd,
    Parallel,
}

impl ExecutionTier {
    /// The tier that will actually run, given compiled-in features.
    pub fn effective(self) -> ExecutionTier {
        match self {
            ExecutionTier::Simd if cfg!(feature = "simd") => ExecutionTier::Simd,
            ExecutionTier::Parallel if cfg!(feature = "parallel") => ExecutionTier::Parallel,
            _ => ExecutionTier::Scalar,
        }
    }

    /// Best tier available in this build.
    pub fn best_available() -> ExecutionTier {
        if cfg!(feature = "parallel") {
            ExecutionTier::Parallel
        } else if cfg!(feature = "simd") {
            ExecutionTier::Simd
        } else {
            ExecutionTier::Scalar
        }
    }
}

/// `out[i] = kernel(i)` for every cell.
pub fn launch<F>(tier: ExecutionTier, out: &mut [f32], kernel: F)
where
    F: Fn(usize) -> f32 + Sync + Send,
{
    match tier.effective() {
        #[cfg(feature = "parallel")]
        ExecutionTier::Parallel => out
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, o)| *o = kernel(i)),
        _ => {
            for (i, o) in out.iter_mut().enumerate() {
                *o = kernel(i);
            }
        }
    }
}

/// Two outputs per cell: `(a[i], b[i]) = kernel(i)`.
pub fn launch_pair<F>(tier: ExecutionTier, a: &mut [f32], b: &mut [f32], kernel: F)
where
    F: Fn(usize) -> (f32, f32) + Sync + Send,
{
    debug_assert_eq!(a.len(), b.len());
    match tier.effective() {
        #[cfg(feature = "parallel")]
        ExecutionTier::Parallel => a
            .par_iter_mut()
            .zip(b.par_iter_mut())
            .enumerate()
            .for_each(|(i, (oa, ob))| {
                let (va, vb) = kernel(i);
                *oa = va;
                *ob = vb;
            }),
        _ => {
            for (i, (oa, ob)) in a.iter_mut().zip(b.iter_mut()).enumerate() {
                let (va, vb) = kernel(i);
                *oa = va;
                *ob = vb;
            }
        }
    }
}

/// Hand each cell its mutable column of `depth` values (weight updates).
pub fn launch_columns<F>(tier: ExecutionTier, data: &mut [f32], depth: usize, kernel: F)
where
    F: Fn(usize, &mut [f32]) + Sync + Send,
{
    match tier.effective() {
        #[cfg(feature = "parallel")]
        ExecutionTier::Parallel => data
            .par_chunks_mut(depth)
            .enumerate()
            .for_each(|(cell, col)| kernel(cell, col)),
        _ => {
            for (cell, col) in data.chunks_mut(depth).enumerate() {
                kernel(cell, col);
            }
        }
    }
}

/// Like [`launch_columns`] over two grids with identical shape
/// (weights and their eligibility traces).
pub fn launch_columns_pair<F>(
    tier: ExecutionTier,
    a: &mut [f32],
    b: &mut [f32],
    depth: usize,
    kernel: F,
) where
    F: Fn(usize, &mut [f32], &mut [f32]) + Sync + Send,
{
    debug_assert_eq!(a.len(), b.len());
    match tier.effective() {
        #[cfg(feature = "parallel")]
        ExecutionTier::Parallel => a
            .par_chunks_mut(depth)
            .zip(b.par_chunks_mut(depth))
            .enumerate()
            .for_each(|(cell, (ca, cb))| kernel(cell, ca, cb)),
        _ => {
            for (cell, (ca, cb)) in a.chunks_mut(depth).zip(b.chunks_mut(depth)).enumerate() {
                kernel(cell, ca, cb);
            }
        }
    }
}

/// `data *= k` element-wise.
pub fn scale(tier: ExecutionTier, data: &mut [f32], k: f32) {
    match tier.effective() {
        #[cfg(feature = "simd")]
        ExecutionTier::Simd => {
            let kv = f32x4::splat(k);
            let mut chunks = data.chunks_exact_mut(4);
            for c in &mut chunks {
                let v = f32x4::from([c[0], c[1], c[2], c[3]]) * kv;
                c.copy_from_slice(&v.to_array());
            }
            for v in chunks.into_remainder() {
                *v *= k;
            }
        }
        #[cfg(feature = "parallel")]
        ExecutionTier::Parallel => data.par_iter_mut().for_each(|v| *v *= k),
        _ => data.iter_mut().for_each(|v| *v *= k),
    }
}

/// `out = a - b` element-wise.
pub fn sub_into(tier: ExecutionTier, out: &mut [f32], a: &[f32], b: &[f32]) {
    debug_assert!(out.len() == a.len() && a.len() == b.len());
    match tier.effective() {
        #[cfg(feature = "simd")]
        ExecutionTier::Simd => {
            let n = out.len() - out.len() % 4;
            for i in (0..n).step_by(4) {
                let va = f32x4::from([a[i], a[i + 1], a[i + 2], a[i + 3]]);
                let vb = f32x4::from([b[i], b[i + 1], b[i + 2], b[i + 3]]);
                out[i..i + 4].copy_from_slice(&(va - vb).to_array());
            }
            for i in n..out.len() {
                out[i] = a[i] - b[i];
            }
        }
        _ => {
            for ((o, x), y) in out.iter_mut().zip(a).zip(b) {
                *o = x - y;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIERS: [ExecutionTier; 3] = [
        ExecutionTier::Scalar,
        ExecutionTier::Simd,
        ExecutionTier::Parallel,
    ];

    #[test]
    fn tiers_agree_on_launch() {
        let reference: Vec<f32> = (0..37).map(|i| (i as f32).sqrt()).collect();
        for tier in TIERS {
            let mut out = vec![0.0; 37];
            launch(tier, &mut out, |i| (i as f32).sqrt());
            assert_eq!(out, reference, "{tier:?}");
        }
    }

    #[test]
    fn columns_see_their_own_cell() {
        for tier in TIERS {
            let mut data = vec![0.0; 5 * 3];
            launch_columns(tier, &mut data, 3, |cell, col| {
                for (z, v) in col.iter_mut().enumerate() {
                    *v = (cell * 10 + z) as f32;
                }
            });
            assert_eq!(data[7], 21.0);
            assert_eq!(data[14], 42.0);
        }
    }

    #[test]
    fn dense_helpers_handle_tails() {
        for tier in TIERS {
            let mut data: Vec<f32> = (0..7).map(|i| i as f32).collect();
            scale(tier, &mut data, 0.5);
            assert_eq!(data[6], 3.0);

            let a = vec![3.0; 7];
            let mut out = vec![0.0; 7];
            sub_into(tier, &mut out, &a, &data);
            assert_eq!(out[6], 0.0);
            assert_eq!(out[0], 3.0);
        }
    }

    #[test]
    fn missing_features_fall_back_to_scalar() {
        if !cfg!(feature = "parallel") {
            assert_eq!(ExecutionTier::Parallel.effective(), ExecutionTier::Scalar);
        }
        assert_eq!(ExecutionTier::Scalar.effective(), ExecutionTier::Scalar);
    }
}

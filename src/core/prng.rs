// Random sources for weight initialization and exploration noise.
//
// Every stochastic operation in the crate takes a `&mut impl RandomSource`
// explicitly; there is no process-wide generator.

/// Anything that can hand out uniformly distributed 32-bit words.
///
/// The provided methods derive the float helpers the engine needs from
/// `next_u32`, so alternative generators only have to implement one method.
pub trait RandomSource {
    fn next_u32(&mut self) -> u32;

    /// Uniform sample in `[0, 1)`.
    #[inline]
    fn next_f32_01(&mut self) -> f32 {
        // 24 mantissa bits keep the result strictly below 1.0.
        (self.next_u32() >> 8) as f32 * (1.0 / (1u32 << 24) as f32)
    }

    /// Uniform sample in `[low, high)`.
    #[inline]
    fn gen_range_f32(&mut self, low: f32, high: f32) -> f32 {
        low + (high - low) * self.next_f32_01()
    }

    #[inline]
    fn gen_range_usize(&mut self, low: usize, high: usize) -> usize {
        if high <= low {
            return low;
        }
        let span = (high - low) as u32;
        low + (self.next_u32() % span) as usize
    }
}

/// xorshift64* generator.
///
/// NOT cryptographically secure. Used for weight init and controlled
/// exploration noise, where reproducibility from a seed is what matters.
#[derive(Debug, Clone)]
pub struct Prng {
    state: u64,
}

const ZERO_STATE_REPLACEMENT: u64 = 0x9E37_79B9_7F4A_7C15;

impl Prng {
    pub fn new(seed: u64) -> Self {
        // A zero state would be a fixed point of the xorshift.
        let state = if seed == 0 {
            ZERO_STATE_REPLACEMENT
        } else {
            seed
        };
        Self { state }
    }

    /// Snapshot of the internal state, for resuming a run bit-exactly.
    pub fn state(&self) -> u64 {
        self.state
    }

    pub fn from_state(state: u64) -> Self {
        Self::new(state)
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }
}

impl RandomSource for Prng {
    #[inline]
    fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_stream() {
        let mut a = Prng::new(7);
        let mut b = Prng::new(7);
        for _ in 0..100 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
    }

    #[test]
    fn zero_seed_is_usable() {
        let mut rng = Prng::new(0);
        let first = rng.next_u32();
        let second = rng.next_u32();
        assert_ne!(first, second);
    }

    #[test]
    fn float_range_is_half_open() {
        let mut rng = Prng::new(99);
        for _ in 0..10_000 {
            let v = rng.gen_range_f32(-0.5, 0.25);
            assert!((-0.5..0.25).contains(&v));
        }
    }

    #[test]
    fn state_roundtrip_resumes_stream() {
        let mut rng = Prng::new(1234);
        rng.next_u32();
        let mut resumed = Prng::from_state(rng.state());
        assert_eq!(rng.next_u32(), resumed.next_u32());
    }
}

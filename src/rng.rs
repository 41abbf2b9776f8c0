/*!
Deterministic, splittable random number streams.

Every particle and every chain owns exactly one [`RngStream`]. Streams are
derived from a single root seed by *stream index*: stream `i` is the ChaCha8
keystream for `(seed, i)`, so asking for more streams never changes the output
of the ones already handed out, and no generator is ever shared between two
particles or chains.

# Examples

```rust
use mini_monty::rng::RngStreams;

let mut streams = RngStreams::new(42, 4).unwrap();
let a = streams[0].normal(0.0, 1.0).unwrap();

// Adding streams does not perturb stream 0.
let mut more = RngStreams::new(42, 8).unwrap();
assert_eq!(a, more[0].normal(0.0, 1.0).unwrap());
```
*/

use std::ops::{Index, IndexMut};

use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Beta, Binomial, Distribution, Exp, Gamma, Normal, Poisson, StandardNormal};

use crate::error::{MontyError, Result};

/// Number of keystream words skipped by [`RngStream::jump`].
const JUMP_WORDS: u128 = 1 << 64;

/// A single independent random number stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RngStream {
    rng: ChaCha8Rng,
    index: u64,
}

impl RngStream {
    /// Stream `index` of the generator family rooted at `seed`.
    pub fn new(seed: u64, index: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        rng.set_stream(index);
        Self { rng, index }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    /// Advance this stream by a fixed, very large number of draws.
    ///
    /// Used to obtain a fresh, non-overlapping sequence from the same stream,
    /// for example when a filter is re-run and must not reuse randomness.
    pub fn jump(&mut self) {
        let pos = self.rng.get_word_pos();
        self.rng.set_word_pos(pos.wrapping_add(JUMP_WORDS));
    }

    /// Derive an independent child stream, advancing this one.
    pub fn split(&mut self) -> RngStream {
        RngStream::new(self.random_seed(), self.index)
    }

    /// A fresh root seed for another generator family.
    pub fn random_seed(&mut self) -> u64 {
        self.rng.next_u64()
    }

    /// A draw from `U[0, 1)`.
    pub fn random_real(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    pub fn std_normal(&mut self) -> f64 {
        self.rng.sample(StandardNormal)
    }

    pub fn uniform(&mut self, min: f64, max: f64) -> Result<f64> {
        if !(min.is_finite() && max.is_finite()) || max < min {
            return Err(MontyError::distribution(
                "uniform",
                format!("require finite min <= max, got [{min}, {max}]"),
            ));
        }
        Ok(min + (max - min) * self.random_real())
    }

    pub fn normal(&mut self, mean: f64, sd: f64) -> Result<f64> {
        if !(sd >= 0.0) {
            return Err(MontyError::distribution("normal", "sd must be non-negative"));
        }
        let dist = Normal::new(mean, sd)
            .map_err(|e| MontyError::distribution("normal", e.to_string()))?;
        Ok(dist.sample(&mut self.rng))
    }

    pub fn exponential(&mut self, rate: f64) -> Result<f64> {
        if !(rate > 0.0) {
            return Err(MontyError::distribution("exponential", "rate must be positive"));
        }
        let dist = Exp::new(rate).map_err(|e| MontyError::distribution("exponential", e.to_string()))?;
        Ok(dist.sample(&mut self.rng))
    }

    pub fn gamma(&mut self, shape: f64, scale: f64) -> Result<f64> {
        if !(shape > 0.0 && scale > 0.0) {
            return Err(MontyError::distribution(
                "gamma",
                format!("shape and scale must be positive, got {shape}, {scale}"),
            ));
        }
        let dist =
            Gamma::new(shape, scale).map_err(|e| MontyError::distribution("gamma", e.to_string()))?;
        Ok(dist.sample(&mut self.rng))
    }

    pub fn beta(&mut self, a: f64, b: f64) -> Result<f64> {
        if !(a > 0.0 && b > 0.0) {
            return Err(MontyError::distribution(
                "beta",
                format!("shape parameters must be positive, got {a}, {b}"),
            ));
        }
        let dist = Beta::new(a, b).map_err(|e| MontyError::distribution("beta", e.to_string()))?;
        Ok(dist.sample(&mut self.rng))
    }

    /// Number of successes in `n` trials with success probability `p`.
    pub fn binomial(&mut self, n: f64, p: f64) -> Result<f64> {
        if !(0.0..=1.0).contains(&p) {
            return Err(MontyError::distribution(
                "binomial",
                format!("probability {p} outside [0, 1]"),
            ));
        }
        if !(n >= 0.0) || n.fract() != 0.0 {
            return Err(MontyError::distribution(
                "binomial",
                format!("size {n} is not a non-negative integer"),
            ));
        }
        if n == 0.0 || p == 0.0 {
            return Ok(0.0);
        }
        let dist = Binomial::new(n as u64, p)
            .map_err(|e| MontyError::distribution("binomial", e.to_string()))?;
        Ok(dist.sample(&mut self.rng) as f64)
    }

    pub fn poisson(&mut self, lambda: f64) -> Result<f64> {
        if !(lambda >= 0.0) || !lambda.is_finite() {
            return Err(MontyError::distribution(
                "poisson",
                format!("rate {lambda} must be finite and non-negative"),
            ));
        }
        if lambda == 0.0 {
            return Ok(0.0);
        }
        let dist =
            Poisson::new(lambda).map_err(|e| MontyError::distribution("poisson", e.to_string()))?;
        Ok(dist.sample(&mut self.rng))
    }
}

impl RngCore for RngStream {
    fn next_u32(&mut self) -> u32 {
        self.rng.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand::Error> {
        self.rng.try_fill_bytes(dest)
    }
}

/// A family of streams rooted at one seed, one stream per particle or chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RngStreams {
    seed: u64,
    streams: Vec<RngStream>,
}

impl RngStreams {
    /// Create `n` streams with indices `0..n`. Fails if `n == 0`.
    pub fn new(seed: u64, n: usize) -> Result<Self> {
        if n == 0 {
            return Err(MontyError::invalid("at least one random number stream is required"));
        }
        let streams = (0..n as u64).map(|i| RngStream::new(seed, i)).collect();
        Ok(Self { seed, streams })
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Append `n` further streams. Existing streams are left untouched.
    pub fn extend(&mut self, n: usize) {
        let start = self.streams.len() as u64;
        self.streams
            .extend((start..start + n as u64).map(|i| RngStream::new(self.seed, i)));
    }

    /// Long-jump every stream.
    pub fn jump(&mut self) {
        self.streams.iter_mut().for_each(RngStream::jump);
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, RngStream> {
        self.streams.iter_mut()
    }

    pub fn as_mut_slice(&mut self) -> &mut [RngStream] {
        &mut self.streams
    }

    pub fn into_vec(self) -> Vec<RngStream> {
        self.streams
    }
}

impl Index<usize> for RngStreams {
    type Output = RngStream;

    fn index(&self, index: usize) -> &RngStream {
        &self.streams[index]
    }
}

impl IndexMut<usize> for RngStreams {
    fn index_mut(&mut self, index: usize) -> &mut RngStream {
        &mut self.streams[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draws(stream: &mut RngStream, n: usize) -> Vec<f64> {
        (0..n).map(|_| stream.random_real()).collect()
    }

    #[test]
    fn same_seed_and_index_reproduce() {
        let mut a = RngStream::new(1, 3);
        let mut b = RngStream::new(1, 3);
        assert_eq!(draws(&mut a, 10), draws(&mut b, 10));
    }

    #[test]
    fn streams_differ_by_index() {
        let mut streams = RngStreams::new(7, 2).unwrap();
        let x = draws(&mut streams[0], 5);
        let y = draws(&mut streams[1], 5);
        assert_ne!(x, y);
    }

    #[test]
    fn extending_does_not_perturb_existing_streams() {
        let mut small = RngStreams::new(99, 2).unwrap();
        let mut large = RngStreams::new(99, 2).unwrap();
        large.extend(10);
        assert_eq!(large.len(), 12);
        for i in 0..2 {
            assert_eq!(draws(&mut small[i], 20), draws(&mut large[i], 20));
        }
    }

    #[test]
    fn jump_moves_to_a_fresh_sequence() {
        let mut a = RngStream::new(5, 0);
        let mut b = a.clone();
        b.jump();
        assert_ne!(draws(&mut a, 5), draws(&mut b, 5));
    }

    #[test]
    fn split_is_deterministic() {
        let mut a = RngStream::new(5, 0);
        let mut b = RngStream::new(5, 0);
        let mut ca = a.split();
        let mut cb = b.split();
        assert_eq!(draws(&mut ca, 5), draws(&mut cb, 5));
        assert_ne!(draws(&mut ca, 5), draws(&mut a, 5));
    }

    #[test]
    fn zero_streams_is_rejected() {
        assert!(matches!(
            RngStreams::new(1, 0),
            Err(MontyError::InvalidArgument(_))
        ));
    }

    #[test]
    fn invalid_distribution_parameters_are_rejected() {
        let mut rng = RngStream::new(0, 0);
        assert!(matches!(
            rng.normal(0.0, -1.0),
            Err(MontyError::DistributionParameter { .. })
        ));
        assert!(matches!(
            rng.binomial(10.0, 1.5),
            Err(MontyError::DistributionParameter { .. })
        ));
        assert!(matches!(
            rng.poisson(-1.0),
            Err(MontyError::DistributionParameter { .. })
        ));
        assert!(matches!(
            rng.gamma(0.0, 1.0),
            Err(MontyError::DistributionParameter { .. })
        ));
        assert!(matches!(
            rng.beta(1.0, -2.0),
            Err(MontyError::DistributionParameter { .. })
        ));
        assert!(matches!(
            rng.exponential(0.0),
            Err(MontyError::DistributionParameter { .. })
        ));
    }

    #[test]
    fn degenerate_counts_are_zero() {
        let mut rng = RngStream::new(0, 0);
        assert_eq!(rng.binomial(0.0, 0.3).unwrap(), 0.0);
        assert_eq!(rng.binomial(10.0, 0.0).unwrap(), 0.0);
        assert_eq!(rng.poisson(0.0).unwrap(), 0.0);
        assert_eq!(rng.binomial(10.0, 1.0).unwrap(), 10.0);
    }

    #[test]
    fn sample_moments_are_plausible() {
        let mut rng = RngStream::new(2024, 0);
        let n = 20_000;
        let mean = |f: &mut dyn FnMut() -> f64| (0..n).map(|_| f()).sum::<f64>() / n as f64;
        let m = mean(&mut || rng.normal(2.0, 0.5).unwrap());
        assert!((m - 2.0).abs() < 0.02, "normal mean {m}");
        let m = mean(&mut || rng.poisson(4.0).unwrap());
        assert!((m - 4.0).abs() < 0.1, "poisson mean {m}");
        let m = mean(&mut || rng.gamma(2.0, 3.0).unwrap());
        assert!((m - 6.0).abs() < 0.15, "gamma mean {m}");
        let m = mean(&mut || rng.beta(2.0, 2.0).unwrap());
        assert!((m - 0.5).abs() < 0.01, "beta mean {m}");
        let m = mean(&mut || rng.binomial(20.0, 0.25).unwrap());
        assert!((m - 5.0).abs() < 0.1, "binomial mean {m}");
        let m = mean(&mut || rng.exponential(2.0).unwrap());
        assert!((m - 0.5).abs() < 0.02, "exponential mean {m}");
    }
}

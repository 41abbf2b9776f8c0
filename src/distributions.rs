/*!
Probability distributions needed by priors, observation models and samplers.

- [`Univariate`]: the independent one-dimensional distributions a [`Prior`]
  is built from, with log-density, its derivative, support and direct
  sampling from an [`RngStream`].
- Free functions such as [`poisson_log_density`] for writing
  [`Generator::compare`] implementations.
- [`MultivariateNormal`]: a dense Gaussian with analytic gradient, handy as a
  test target and as a proposal.

# Examples

```rust
use mini_monty::distributions::{poisson_log_density, Univariate};
use mini_monty::rng::RngStream;

let prior = Univariate::gamma(2.0, 0.5).unwrap();
assert!(prior.log_density(-1.0).is_infinite());

let mut rng = RngStream::new(1, 0);
let x = prior.sample(&mut rng).unwrap();
assert!(x > 0.0);

let lp = poisson_log_density(3.0, 2.5);
assert!((lp - (-1.5429)).abs() < 1e-3);
```

[`Prior`]: crate::model::prior::Prior
[`Generator::compare`]: crate::system::Generator::compare
*/

use std::f64::consts::{LN_2, PI, SQRT_2};

use nalgebra::{Cholesky, DMatrix, DVector};
use ndarray::{Array1, Array2};
use statrs::function::beta::ln_beta;
use statrs::function::erf::{erfc, erfc_inv};
use statrs::function::gamma::ln_gamma;

use crate::error::{MontyError, Result};
use crate::rng::RngStream;

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

/// A univariate distribution with finite parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Univariate {
    Normal { mean: f64, sd: f64 },
    Uniform { min: f64, max: f64 },
    Exponential { rate: f64 },
    Gamma { shape: f64, scale: f64 },
    Beta { a: f64, b: f64 },
    LogNormal { meanlog: f64, sdlog: f64 },
    TruncatedNormal { mean: f64, sd: f64, min: f64, max: f64 },
}

fn positive(distribution: &'static str, name: &str, x: f64) -> Result<()> {
    if x > 0.0 && x.is_finite() {
        Ok(())
    } else {
        Err(MontyError::distribution(
            distribution,
            format!("{name} must be positive and finite, got {x}"),
        ))
    }
}

fn finite(distribution: &'static str, name: &str, x: f64) -> Result<()> {
    if x.is_finite() {
        Ok(())
    } else {
        Err(MontyError::distribution(distribution, format!("{name} must be finite, got {x}")))
    }
}

impl Univariate {
    pub fn normal(mean: f64, sd: f64) -> Result<Self> {
        finite("normal", "mean", mean)?;
        positive("normal", "sd", sd)?;
        Ok(Univariate::Normal { mean, sd })
    }

    pub fn uniform(min: f64, max: f64) -> Result<Self> {
        finite("uniform", "min", min)?;
        finite("uniform", "max", max)?;
        if min >= max {
            return Err(MontyError::distribution("uniform", format!("min {min} >= max {max}")));
        }
        Ok(Univariate::Uniform { min, max })
    }

    pub fn exponential(rate: f64) -> Result<Self> {
        positive("exponential", "rate", rate)?;
        Ok(Univariate::Exponential { rate })
    }

    pub fn gamma(shape: f64, scale: f64) -> Result<Self> {
        positive("gamma", "shape", shape)?;
        positive("gamma", "scale", scale)?;
        Ok(Univariate::Gamma { shape, scale })
    }

    pub fn beta(a: f64, b: f64) -> Result<Self> {
        positive("beta", "a", a)?;
        positive("beta", "b", b)?;
        Ok(Univariate::Beta { a, b })
    }

    pub fn log_normal(meanlog: f64, sdlog: f64) -> Result<Self> {
        finite("log-normal", "meanlog", meanlog)?;
        positive("log-normal", "sdlog", sdlog)?;
        Ok(Univariate::LogNormal { meanlog, sdlog })
    }

    /// Normal restricted to `[min, max]`; either bound may be infinite.
    pub fn truncated_normal(mean: f64, sd: f64, min: f64, max: f64) -> Result<Self> {
        finite("truncated normal", "mean", mean)?;
        positive("truncated normal", "sd", sd)?;
        if !(min < max) {
            return Err(MontyError::distribution(
                "truncated normal",
                format!("min {min} must be below max {max}"),
            ));
        }
        Ok(Univariate::TruncatedNormal { mean, sd, min, max })
    }

    /// Closed support `(lower, upper)`, possibly infinite.
    pub fn support(&self) -> (f64, f64) {
        match *self {
            Univariate::Normal { .. } => (f64::NEG_INFINITY, f64::INFINITY),
            Univariate::Uniform { min, max } => (min, max),
            Univariate::Exponential { .. }
            | Univariate::Gamma { .. }
            | Univariate::LogNormal { .. } => (0.0, f64::INFINITY),
            Univariate::Beta { .. } => (0.0, 1.0),
            Univariate::TruncatedNormal { min, max, .. } => (min, max),
        }
    }

    pub fn log_density(&self, x: f64) -> f64 {
        let (lower, upper) = self.support();
        if !(x >= lower && x <= upper) {
            return f64::NEG_INFINITY;
        }
        match *self {
            Univariate::Normal { mean, sd } => normal_log_density(x, mean, sd),
            Univariate::Uniform { min, max } => -(max - min).ln(),
            Univariate::Exponential { rate } => rate.ln() - rate * x,
            Univariate::Gamma { shape, scale } => {
                if x == 0.0 {
                    return if shape == 1.0 { -scale.ln() } else { f64::NEG_INFINITY };
                }
                (shape - 1.0) * x.ln() - x / scale - ln_gamma(shape) - shape * scale.ln()
            }
            Univariate::Beta { a, b } => {
                // Finite at an edge only when that shape parameter is one.
                let edge = |shape: f64, y: f64| match (shape == 1.0, y == 0.0) {
                    (true, _) => 0.0,
                    (false, true) => f64::NEG_INFINITY,
                    (false, false) => (shape - 1.0) * y.ln(),
                };
                edge(a, x) + edge(b, 1.0 - x) - ln_beta(a, b)
            }
            Univariate::LogNormal { meanlog, sdlog } => {
                if x == 0.0 {
                    return f64::NEG_INFINITY;
                }
                normal_log_density(x.ln(), meanlog, sdlog) - x.ln()
            }
            Univariate::TruncatedNormal { mean, sd, min, max } => {
                normal_log_density(x, mean, sd) - truncated_mass(mean, sd, min, max).ln()
            }
        }
    }

    /// Derivative of the log-density; zero outside the support.
    pub fn gradient(&self, x: f64) -> f64 {
        let (lower, upper) = self.support();
        if !(x >= lower && x <= upper) {
            return 0.0;
        }
        match *self {
            Univariate::Normal { mean, sd } | Univariate::TruncatedNormal { mean, sd, .. } => {
                -(x - mean) / (sd * sd)
            }
            Univariate::Uniform { .. } => 0.0,
            Univariate::Exponential { rate } => -rate,
            Univariate::Gamma { shape, scale } => (shape - 1.0) / x - 1.0 / scale,
            Univariate::Beta { a, b } => {
                let term = |shape: f64, y: f64| if shape == 1.0 { 0.0 } else { (shape - 1.0) / y };
                term(a, x) - term(b, 1.0 - x)
            }
            Univariate::LogNormal { meanlog, sdlog } => {
                -(x.ln() - meanlog) / (sdlog * sdlog * x) - 1.0 / x
            }
        }
    }

    pub fn sample(&self, rng: &mut RngStream) -> Result<f64> {
        match *self {
            Univariate::Normal { mean, sd } => rng.normal(mean, sd),
            Univariate::Uniform { min, max } => rng.uniform(min, max),
            Univariate::Exponential { rate } => rng.exponential(rate),
            Univariate::Gamma { shape, scale } => rng.gamma(shape, scale),
            Univariate::Beta { a, b } => rng.beta(a, b),
            Univariate::LogNormal { meanlog, sdlog } => Ok(rng.normal(meanlog, sdlog)?.exp()),
            Univariate::TruncatedNormal { mean, sd, min, max } => {
                let alpha = (min - mean) / sd;
                let beta = (max - mean) / sd;
                // Sample the lower tail for precision.
                let (lo, hi, sign) = if alpha > 0.0 {
                    (-beta, -alpha, -1.0)
                } else {
                    (alpha, beta, 1.0)
                };
                let (p_lo, p_hi) = (std_normal_cdf(lo), std_normal_cdf(hi));
                let u = p_lo + rng.random_real() * (p_hi - p_lo);
                let z = std_normal_quantile(u).clamp(lo, hi);
                Ok(mean + sign * sd * z)
            }
        }
    }

    pub fn mean(&self) -> f64 {
        match *self {
            Univariate::Normal { mean, .. } => mean,
            Univariate::Uniform { min, max } => 0.5 * (min + max),
            Univariate::Exponential { rate } => 1.0 / rate,
            Univariate::Gamma { shape, scale } => shape * scale,
            Univariate::Beta { a, b } => a / (a + b),
            Univariate::LogNormal { meanlog, sdlog } => (meanlog + 0.5 * sdlog * sdlog).exp(),
            Univariate::TruncatedNormal { mean, sd, min, max } => {
                let (alpha, beta) = ((min - mean) / sd, (max - mean) / sd);
                let z = truncated_mass(mean, sd, min, max);
                mean + sd * (std_normal_pdf(alpha) - std_normal_pdf(beta)) / z
            }
        }
    }

    pub fn variance(&self) -> f64 {
        match *self {
            Univariate::Normal { sd, .. } => sd * sd,
            Univariate::Uniform { min, max } => (max - min).powi(2) / 12.0,
            Univariate::Exponential { rate } => 1.0 / (rate * rate),
            Univariate::Gamma { shape, scale } => shape * scale * scale,
            Univariate::Beta { a, b } => a * b / ((a + b).powi(2) * (a + b + 1.0)),
            Univariate::LogNormal { meanlog, sdlog } => {
                let s2 = sdlog * sdlog;
                (s2.exp() - 1.0) * (2.0 * meanlog + s2).exp()
            }
            Univariate::TruncatedNormal { mean, sd, min, max } => {
                let (alpha, beta) = ((min - mean) / sd, (max - mean) / sd);
                let z = truncated_mass(mean, sd, min, max);
                let (pa, pb) = (std_normal_pdf(alpha), std_normal_pdf(beta));
                // x·φ(x) vanishes at infinite bounds.
                let apa = if alpha.is_finite() { alpha * pa } else { 0.0 };
                let bpb = if beta.is_finite() { beta * pb } else { 0.0 };
                sd * sd * (1.0 + (apa - bpb) / z - ((pa - pb) / z).powi(2))
            }
        }
    }
}

fn std_normal_pdf(z: f64) -> f64 {
    if z.is_infinite() {
        0.0
    } else {
        (-0.5 * z * z - LN_SQRT_2PI).exp()
    }
}

fn std_normal_cdf(z: f64) -> f64 {
    0.5 * erfc(-z / SQRT_2)
}

fn std_normal_quantile(p: f64) -> f64 {
    -SQRT_2 * erfc_inv(2.0 * p)
}

fn truncated_mass(mean: f64, sd: f64, min: f64, max: f64) -> f64 {
    let alpha = (min - mean) / sd;
    let beta = (max - mean) / sd;
    if alpha > 0.0 {
        std_normal_cdf(-alpha) - std_normal_cdf(-beta)
    } else {
        std_normal_cdf(beta) - std_normal_cdf(alpha)
    }
}

pub fn normal_log_density(x: f64, mean: f64, sd: f64) -> f64 {
    let z = (x - mean) / sd;
    -0.5 * z * z - sd.ln() - LN_SQRT_2PI
}

pub fn poisson_log_density(x: f64, lambda: f64) -> f64 {
    if x < 0.0 {
        return f64::NEG_INFINITY;
    }
    if lambda == 0.0 {
        return if x == 0.0 { 0.0 } else { f64::NEG_INFINITY };
    }
    x * lambda.ln() - lambda - ln_gamma(x + 1.0)
}

pub fn binomial_log_density(x: f64, size: f64, prob: f64) -> f64 {
    if x < 0.0 || x > size {
        return f64::NEG_INFINITY;
    }
    let choose = ln_gamma(size + 1.0) - ln_gamma(x + 1.0) - ln_gamma(size - x + 1.0);
    let success = if x == 0.0 { 0.0 } else { x * prob.ln() };
    let failure = if x == size { 0.0 } else { (size - x) * (1.0 - prob).ln() };
    choose + success + failure
}

/// Negative binomial parameterised by dispersion `size` and mean `mu`.
pub fn negative_binomial_log_density(x: f64, size: f64, mu: f64) -> f64 {
    if x < 0.0 {
        return f64::NEG_INFINITY;
    }
    if mu == 0.0 {
        return if x == 0.0 { 0.0 } else { f64::NEG_INFINITY };
    }
    let ratio = size / (size + mu);
    ln_gamma(x + size) - ln_gamma(size) - ln_gamma(x + 1.0)
        + size * ratio.ln()
        + x * (mu / (size + mu)).ln()
}

/// Copy an `ndarray` matrix into `nalgebra` storage.
pub(crate) fn to_dmatrix(a: &Array2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

/// Lower-triangular Cholesky factor of a symmetric positive-definite matrix.
pub fn cholesky(a: &Array2<f64>) -> Result<DMatrix<f64>> {
    if a.ncols() != a.nrows() {
        return Err(MontyError::shape("square matrix columns", a.nrows(), a.ncols()));
    }
    Cholesky::new(to_dmatrix(a))
        .map(|c| c.l())
        .ok_or_else(|| MontyError::invalid("matrix is not positive definite"))
}

/// A multivariate normal distribution with dense covariance.
#[derive(Debug, Clone, PartialEq)]
pub struct MultivariateNormal {
    mean: DVector<f64>,
    chol: DMatrix<f64>,
    log_norm: f64,
}

impl MultivariateNormal {
    pub fn new(mean: Array1<f64>, cov: Array2<f64>) -> Result<Self> {
        if cov.nrows() != mean.len() {
            return Err(MontyError::shape("covariance rows", mean.len(), cov.nrows()));
        }
        let chol = cholesky(&cov)?;
        let log_det: f64 = chol.diagonal().iter().map(|d| 2.0 * d.ln()).sum();
        let d = mean.len() as f64;
        let log_norm = -0.5 * (d * (LN_2 + PI.ln()) + log_det);
        Ok(Self {
            mean: DVector::from_iterator(mean.len(), mean.iter().copied()),
            chol,
            log_norm,
        })
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> Array1<f64> {
        self.mean.iter().copied().collect()
    }

    fn centred(&self, x: &[f64]) -> DVector<f64> {
        DVector::from_column_slice(x) - &self.mean
    }

    pub fn log_density(&self, x: &[f64]) -> f64 {
        match self.chol.solve_lower_triangular(&self.centred(x)) {
            Some(z) => self.log_norm - 0.5 * z.norm_squared(),
            None => f64::NAN,
        }
    }

    /// `-Σ⁻¹ (x - μ)`
    pub fn gradient(&self, x: &[f64]) -> Vec<f64> {
        self.chol
            .solve_lower_triangular(&self.centred(x))
            .and_then(|z| self.chol.tr_solve_lower_triangular(&z))
            .map_or_else(
                || vec![f64::NAN; self.dim()],
                |v| v.iter().map(|g| -g).collect(),
            )
    }

    pub fn sample(&self, rng: &mut RngStream) -> Vec<f64> {
        let z = DVector::from_fn(self.dim(), |_, _| rng.std_normal());
        (&self.mean + &self.chol * z).iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2};

    fn moments(dist: Univariate, n: usize) -> (f64, f64) {
        let mut rng = RngStream::new(42, 0);
        let xs: Vec<f64> = (0..n).map(|_| dist.sample(&mut rng).unwrap()).collect();
        let mean = xs.iter().sum::<f64>() / n as f64;
        let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
        (mean, var)
    }

    #[test]
    fn direct_samples_match_moments() {
        let dists = [
            Univariate::normal(1.0, 2.0).unwrap(),
            Univariate::uniform(-1.0, 3.0).unwrap(),
            Univariate::exponential(2.0).unwrap(),
            Univariate::gamma(3.0, 0.5).unwrap(),
            Univariate::beta(2.0, 5.0).unwrap(),
            Univariate::log_normal(0.0, 0.25).unwrap(),
            Univariate::truncated_normal(0.0, 1.0, 0.0, f64::INFINITY).unwrap(),
            Univariate::truncated_normal(0.0, 1.0, 2.0, 3.0).unwrap(),
        ];
        for dist in dists {
            let (mean, var) = moments(dist, 50_000);
            let se = (dist.variance() / 50_000.0).sqrt();
            assert!(
                (mean - dist.mean()).abs() < 5.0 * se,
                "{dist:?}: mean {mean} vs {}",
                dist.mean()
            );
            assert_abs_diff_eq!(var, dist.variance(), epsilon = 0.05 * dist.variance());
        }
    }

    #[test]
    fn truncated_samples_stay_in_bounds() {
        let dist = Univariate::truncated_normal(0.0, 1.0, 4.0, 4.5).unwrap();
        let mut rng = RngStream::new(3, 0);
        for _ in 0..1000 {
            let x = dist.sample(&mut rng).unwrap();
            assert!((4.0..=4.5).contains(&x));
        }
    }

    #[test]
    fn log_densities_match_closed_forms() {
        let n = Univariate::normal(0.0, 1.0).unwrap();
        assert_abs_diff_eq!(n.log_density(0.0), -LN_SQRT_2PI, epsilon = 1e-12);
        let e = Univariate::exponential(2.0).unwrap();
        assert_abs_diff_eq!(e.log_density(1.0), 2f64.ln() - 2.0, epsilon = 1e-12);
        assert_eq!(e.log_density(-0.1), f64::NEG_INFINITY);
        let b = Univariate::beta(2.0, 2.0).unwrap();
        assert_abs_diff_eq!(b.log_density(0.5), 1.5f64.ln(), epsilon = 1e-10);
        let t = Univariate::truncated_normal(0.0, 1.0, 0.0, f64::INFINITY).unwrap();
        assert_abs_diff_eq!(t.log_density(0.0), -LN_SQRT_2PI + LN_2, epsilon = 1e-10);
    }

    #[test]
    fn gradients_match_finite_differences() {
        let dists = [
            Univariate::normal(1.0, 2.0).unwrap(),
            Univariate::gamma(3.0, 0.5).unwrap(),
            Univariate::beta(2.0, 5.0).unwrap(),
            Univariate::log_normal(0.0, 0.5).unwrap(),
        ];
        let h = 1e-6;
        for dist in dists {
            let x = 0.3;
            let fd = (dist.log_density(x + h) - dist.log_density(x - h)) / (2.0 * h);
            assert_abs_diff_eq!(dist.gradient(x), fd, epsilon = 1e-5);
        }
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        assert!(matches!(
            Univariate::normal(0.0, -1.0),
            Err(MontyError::DistributionParameter { .. })
        ));
        assert!(Univariate::uniform(1.0, 1.0).is_err());
        assert!(Univariate::beta(0.0, 1.0).is_err());
    }

    #[test]
    fn count_densities() {
        assert_abs_diff_eq!(poisson_log_density(0.0, 2.0), -2.0, epsilon = 1e-12);
        assert_eq!(poisson_log_density(1.0, 0.0), f64::NEG_INFINITY);
        assert_abs_diff_eq!(
            binomial_log_density(2.0, 4.0, 0.5),
            (6.0f64 / 16.0).ln(),
            epsilon = 1e-10
        );
        assert_eq!(binomial_log_density(0.0, 4.0, 0.0), 0.0);
        // size → ∞ recovers the Poisson.
        assert_abs_diff_eq!(
            negative_binomial_log_density(3.0, 1e8, 2.0),
            poisson_log_density(3.0, 2.0),
            epsilon = 1e-5
        );
    }

    #[test]
    fn beta_edges_are_finite_for_unit_shapes() {
        let flat = Univariate::beta(1.0, 1.0).unwrap();
        assert_eq!(flat.log_density(0.0), 0.0);
        assert_eq!(flat.log_density(1.0), 0.0);
        assert_eq!(flat.gradient(0.0), 0.0);

        // Beta(1, 3) has density 3 (1 - x)^2.
        let b13 = Univariate::beta(1.0, 3.0).unwrap();
        assert_abs_diff_eq!(b13.log_density(0.0), 3f64.ln(), epsilon = 1e-12);
        assert_eq!(b13.log_density(1.0), f64::NEG_INFINITY);
        assert_abs_diff_eq!(b13.gradient(0.0), -2.0, epsilon = 1e-12);

        let b21 = Univariate::beta(2.0, 1.0).unwrap();
        assert_abs_diff_eq!(b21.log_density(1.0), 2f64.ln(), epsilon = 1e-12);
        assert_eq!(b21.log_density(0.0), f64::NEG_INFINITY);
    }

    #[test]
    fn cholesky_factor_and_rejection() {
        let l = cholesky(&arr2(&[[4.0, 2.0], [2.0, 3.0]])).unwrap();
        assert_abs_diff_eq!(l[(0, 0)], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(l[(1, 0)], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(l[(1, 1)], 2f64.sqrt(), epsilon = 1e-12);
        assert_eq!(l[(0, 1)], 0.0);
        assert!(matches!(
            cholesky(&arr2(&[[1.0, 2.0], [2.0, 1.0]])),
            Err(MontyError::InvalidArgument(_))
        ));
        assert!(matches!(
            cholesky(&Array2::zeros((2, 3))),
            Err(MontyError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn multivariate_normal_density_and_gradient() {
        let mvn = MultivariateNormal::new(arr1(&[0.0, 1.0]), arr2(&[[4.0, 2.0], [2.0, 3.0]])).unwrap();
        // Σ⁻¹ = [[3, -2], [-2, 4]] / 8
        let g = mvn.gradient(&[1.0, 1.0]);
        assert_abs_diff_eq!(g[0], -3.0 / 8.0, epsilon = 1e-12);
        assert_abs_diff_eq!(g[1], 2.0 / 8.0, epsilon = 1e-12);
        let expected = -(2.0 * PI).ln() - 0.5 * 8f64.ln() - 0.5 * 3.0 / 8.0;
        assert_abs_diff_eq!(mvn.log_density(&[1.0, 1.0]), expected, epsilon = 1e-12);
        assert!(MultivariateNormal::new(arr1(&[0.0]), arr2(&[[-1.0]])).is_err());
    }
}

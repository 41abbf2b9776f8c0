//! Running chain statistics: windowed acceptance rates, split-free R-hat
//! across chains and FFT-based autocorrelation.

use std::collections::VecDeque;

use ndarray::prelude::*;
use ndarray_stats::QuantileExt;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

use crate::error::{MontyError, Result};

const ACCEPT_WINDOW: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct ChainTracker {
    n_params: usize,
    n: u64,
    n_accepted: u64,
    p_accept: f64,
    mean: Array1<f64>,    // n_params
    mean_sq: Array1<f64>, // n_params
    accept_queue: VecDeque<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainStats {
    pub n: u64,
    /// Acceptance rate over the last 100 steps.
    pub p_accept: f64,
    pub mean: Array1<f64>, // n_params
    pub sm2: Array1<f64>,  // n_params
}

impl ChainTracker {
    pub fn new(n_params: usize) -> Self {
        Self {
            n_params,
            n: 0,
            n_accepted: 0,
            p_accept: 0.0,
            mean: Array1::zeros(n_params),
            mean_sq: Array1::zeros(n_params),
            accept_queue: VecDeque::with_capacity(ACCEPT_WINDOW + 1),
        }
    }

    pub fn step(&mut self, x: &[f64], accepted: bool) -> Result<()> {
        if x.len() != self.n_params {
            return Err(MontyError::shape("tracked state", self.n_params, x.len()));
        }
        self.n += 1;
        self.n_accepted += accepted as u64;

        self.accept_queue.push_back(accepted);
        if self.accept_queue.len() > ACCEPT_WINDOW {
            self.accept_queue.pop_front();
        }
        let hits = self.accept_queue.iter().filter(|&&a| a).count();
        self.p_accept = hits as f64 / self.accept_queue.len() as f64;

        let n = self.n as f64;
        let x_arr = ArrayView1::from(x);
        self.mean = (&self.mean * (n - 1.0) + &x_arr) / n;
        self.mean_sq = (&self.mean_sq * (n - 1.0) + x_arr.pow2()) / n;
        Ok(())
    }

    pub fn n(&self) -> u64 {
        self.n
    }

    /// Acceptance rate over every tracked step.
    pub fn acceptance_rate(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.n_accepted as f64 / self.n as f64
        }
    }

    pub fn sm2(&self) -> Array1<f64> {
        let n = self.n as f64;
        (&self.mean_sq - self.mean.pow2()) * n / (n - 1.0)
    }

    pub fn stats(&self) -> ChainStats {
        ChainStats {
            n: self.n,
            p_accept: self.p_accept,
            mean: self.mean.clone(),
            sm2: self.sm2(),
        }
    }
}

/// R-hat per parameter from the running summaries of several chains.
pub fn collect_rhat(all_chain_stats: &[&ChainStats]) -> Result<Array1<f64>> {
    if all_chain_stats.len() < 2 {
        return Err(MontyError::invalid("R-hat needs at least two chains"));
    }
    let stack = |views: Vec<ArrayView1<f64>>| {
        ndarray::stack(Axis(0), &views).map_err(|e| MontyError::invalid(e.to_string()))
    };
    let means = stack(all_chain_stats.iter().map(|x| x.mean.view()).collect())?;
    let sm2s = stack(all_chain_stats.iter().map(|x| x.sm2.view()).collect())?;

    let w = sm2s
        .mean_axis(Axis(0))
        .ok_or_else(|| MontyError::invalid("no chains"))?;
    let global_means = means
        .mean_axis(Axis(0))
        .ok_or_else(|| MontyError::invalid("no chains"))?;
    let diffs = &means - &global_means.insert_axis(Axis(0));
    let b = diffs.pow2().sum_axis(Axis(0)) / (means.nrows() - 1) as f64;

    let n: f64 =
        all_chain_stats.iter().map(|x| x.n as f64).sum::<f64>() / all_chain_stats.len() as f64;
    Ok(((b + &w * ((n - 1.0) / n)) / w).sqrt())
}

pub fn max_skipnan(x: &Array1<f64>) -> f64 {
    x.iter()
        .copied()
        .filter(|v| !v.is_nan())
        .fold(f64::NEG_INFINITY, f64::max)
}

/// R-hat over synchronised chains, updated one draw (across all chains) at a
/// time.
#[derive(Debug, Clone, PartialEq)]
pub struct RhatMulti {
    n: usize,
    mean: Array2<f64>,    // n_chains x n_params
    mean_sq: Array2<f64>, // n_chains x n_params
    n_chains: usize,
    n_params: usize,
}

impl RhatMulti {
    pub fn new(n_chains: usize, n_params: usize) -> Self {
        Self {
            n: 0,
            mean: Array2::zeros((n_chains, n_params)),
            mean_sq: Array2::zeros((n_chains, n_params)),
            n_chains,
            n_params,
        }
    }

    /// Add one draw per chain, given as a row-major `chain × parameter` slice.
    pub fn step(&mut self, x: &[f64]) -> Result<()> {
        let x_arr = ArrayView2::from_shape((self.n_chains, self.n_params), x)
            .map_err(|_| MontyError::shape("chain draws", self.n_chains * self.n_params, x.len()))?;
        self.n += 1;
        let n = self.n as f64;
        self.mean = (&self.mean * (n - 1.0) + &x_arr) / n;
        self.mean_sq = (&self.mean_sq * (n - 1.0) + x_arr.pow2()) / n;
        Ok(())
    }

    pub fn all(&self) -> Result<Array1<f64>> {
        let mean_chain = self
            .mean
            .mean_axis(Axis(0))
            .ok_or_else(|| MontyError::invalid("mean reduction across chains failed"))?;
        let n_chains = self.mean.shape()[0] as f64;
        let n = self.n as f64;
        let fac = n / (n_chains - 1.0);
        let between = (&self.mean - &mean_chain.insert_axis(Axis(0)))
            .pow2()
            .sum_axis(Axis(0))
            * fac;
        let sm2 = (&self.mean_sq - self.mean.pow2()) * n / (n - 1.0);
        let within = sm2
            .mean_axis(Axis(0))
            .ok_or_else(|| MontyError::invalid("mean reduction across chains failed"))?;
        let var = &within * ((n - 1.0) / n) + between * (1.0 / n);
        Ok((var / within).sqrt())
    }

    pub fn max(&self) -> Result<f64> {
        let all = self.all()?;
        all.max()
            .copied()
            .map_err(|e| MontyError::invalid(e.to_string()))
    }
}

/// Normalised autocorrelation of `x` at lags `0..=max_lag`, computed with a
/// zero-padded FFT.
pub fn autocorrelation(x: &[f64], max_lag: usize) -> Vec<f64> {
    let n = x.len();
    if n == 0 {
        return Vec::new();
    }
    let mean = x.iter().sum::<f64>() / n as f64;
    let size = (2 * n).next_power_of_two();
    let mut buf: Vec<Complex<f64>> = x
        .iter()
        .map(|&v| Complex::new(v - mean, 0.0))
        .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
        .take(size)
        .collect();

    let mut planner = FftPlanner::<f64>::new();
    planner.plan_fft_forward(size).process(&mut buf);
    for c in buf.iter_mut() {
        *c = Complex::new(c.norm_sqr(), 0.0);
    }
    planner.plan_fft_inverse(size).process(&mut buf);

    let r0 = buf[0].re;
    let max_lag = max_lag.min(n - 1);
    if r0 == 0.0 {
        let mut out = vec![0.0; max_lag + 1];
        out[0] = 1.0;
        return out;
    }
    buf.iter().take(max_lag + 1).map(|c| c.re / r0).collect()
}

#[cfg(test)]
mod tests {
    use std::f64;

    use super::*;
    use approx::assert_abs_diff_eq;

    fn run_rhat_test(data0: Array2<f64>, data1: Array2<f64>, expected: Array1<f64>, tol: f64) {
        let mut psr = RhatMulti::new(3, 4);
        psr.step(data0.as_slice().unwrap()).unwrap();
        psr.step(data1.as_slice().unwrap()).unwrap();
        let rhat = psr.all().unwrap();
        let diff = *(rhat.clone() - expected.clone()).abs().max().unwrap();
        assert!(
            diff < tol,
            "Mismatch in Rhat. Got {:?}, expected {:?}, diff = {:?}",
            rhat,
            expected,
            diff
        );
    }

    #[test]
    fn test_rhat_1() {
        // Step 0 data (chains x params)
        let data_step_0 = arr2(&[
            [0.0, 1.0, 0.0, 1.0], // chain 0
            [1.0, 2.0, 0.0, 2.0], // chain 1
            [0.0, 0.0, 0.0, 2.0], // chain 2
        ]);

        // Step 1 data (chains x params)
        let data_step_1 = arr2(&[
            [1.0, 2.0, 2.0, 0.0], // chain 0
            [1.0, 1.0, 1.0, 1.0], // chain 1
            [0.0, 1.0, 0.0, 0.0], // chain 2
        ]);
        let expected = array![f64::consts::SQRT_2, 1.08012345, 0.89442719, 0.8660254];
        run_rhat_test(data_step_0, data_step_1, expected, 1e-7);
    }

    #[test]
    fn test_rhat_2() {
        let data_step_0 = arr2(&[
            [1.0, 0.0, 0.0, 1.0],
            [1.0, 0.0, 0.0, 1.0],
            [0.0, 1.0, 0.0, 2.0],
        ]);
        let data_step_1 = arr2(&[
            [1.0, 2.0, 0.0, 2.0],
            [1.0, 2.0, 0.0, 0.0],
            [2.0, 0.0, 1.0, 2.0],
        ]);
        let expected = array![f64::consts::FRAC_1_SQRT_2, 0.74535599, 1.0, 1.5];
        run_rhat_test(data_step_0, data_step_1, expected, 1e-7);
    }

    #[test]
    fn tracker_rhat_matches_batch_rhat() {
        let draws = [
            arr2(&[[0.0, 1.0], [1.0, 2.0], [0.5, 0.0]]),
            arr2(&[[1.0, 2.0], [1.0, 1.0], [0.0, 1.0]]),
            arr2(&[[2.0, 0.0], [0.5, 1.5], [1.0, 1.0]]),
        ];
        let mut multi = RhatMulti::new(3, 2);
        let mut trackers = vec![ChainTracker::new(2); 3];
        for d in &draws {
            multi.step(d.as_slice().unwrap()).unwrap();
            for (c, t) in trackers.iter_mut().enumerate() {
                t.step(d.row(c).as_slice().unwrap(), true).unwrap();
            }
        }
        let stats: Vec<ChainStats> = trackers.iter().map(ChainTracker::stats).collect();
        let refs: Vec<&ChainStats> = stats.iter().collect();
        let from_trackers = collect_rhat(&refs).unwrap();
        let from_multi = multi.all().unwrap();
        assert_abs_diff_eq!(from_trackers, from_multi, epsilon = 1e-12);
    }

    #[test]
    fn acceptance_window_slides() {
        let mut tracker = ChainTracker::new(1);
        for i in 0..200 {
            tracker.step(&[i as f64], i < 100).unwrap();
        }
        assert_eq!(tracker.stats().p_accept, 0.0);
        assert_abs_diff_eq!(tracker.acceptance_rate(), 0.5);
    }

    #[test]
    fn autocorrelation_of_ar1() {
        let mut rng = crate::rng::RngStream::new(11, 0);
        let phi = 0.8;
        let mut x = vec![0.0; 20_000];
        for i in 1..x.len() {
            x[i] = phi * x[i - 1] + rng.std_normal();
        }
        let acf = autocorrelation(&x, 3);
        assert_eq!(acf.len(), 4);
        assert_abs_diff_eq!(acf[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(acf[1], phi, epsilon = 0.03);
        assert_abs_diff_eq!(acf[2], phi * phi, epsilon = 0.04);
    }
}

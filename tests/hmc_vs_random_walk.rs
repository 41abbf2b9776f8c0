//! HMC and random-walk Metropolis on a strongly correlated 2D Gaussian.

use mini_monty::core::{sample, SampleOptions};
use mini_monty::error::MontyError;
use mini_monty::model::MontyModel;
use mini_monty::samplers::{Hmc, RandomWalk};
use mini_monty::samples::Samples;
use mini_monty::stats::autocorrelation;

const RHO: f64 = 0.9;

fn correlated_gaussian() -> MontyModel {
    let c = 1.0 / (1.0 - RHO * RHO);
    MontyModel::from_fn(["x", "y"], move |p: &[f64]| {
        -0.5 * c * (p[0] * p[0] - 2.0 * RHO * p[0] * p[1] + p[1] * p[1])
    })
    .with_gradient(move |p: &[f64]| vec![-c * (p[0] - RHO * p[1]), -c * (p[1] - RHO * p[0])])
    .build()
    .unwrap()
}

fn options() -> SampleOptions {
    SampleOptions::default()
        .with_chains(4)
        .with_initial(vec![vec![0.0, 0.0]])
        .set_seed(2025)
}

/// Lag-1 autocorrelation of every parameter of every chain, averaged.
fn mean_lag1(samples: &Samples) -> f64 {
    let mut total = 0.0;
    let mut count = 0;
    for chain in 0..samples.chains() {
        for par in 0..samples.parameter_names.len() {
            let trace: Vec<f64> = samples.pars.slice(ndarray::s![par, .., chain]).to_vec();
            total += autocorrelation(&trace, 1)[1];
            count += 1;
        }
    }
    total / count as f64
}

#[test]
fn hmc_mixes_faster_than_random_walk() {
    let model = correlated_gaussian();
    let n_steps = 2000;

    let hmc = sample(&model, &Hmc::new(0.15, 20).unwrap(), n_steps, &options())
        .unwrap()
        .thin(200, 1)
        .unwrap();
    let rw = sample(&model, &RandomWalk::isotropic(2, 0.5).unwrap(), n_steps, &options())
        .unwrap()
        .thin(200, 1)
        .unwrap();

    let (hmc_ac, rw_ac) = (mean_lag1(&hmc), mean_lag1(&rw));
    assert!(hmc_ac < rw_ac, "HMC lag-1 {hmc_ac} vs random walk {rw_ac}");
    assert!(rw_ac > 0.5, "random walk lag-1 {rw_ac}");

    for d in &hmc.details {
        assert!(d.acceptance_rate > 0.7, "HMC acceptance {}", d.acceptance_rate);
    }
}

#[test]
fn hmc_recovers_the_correlation() {
    let model = correlated_gaussian();
    let samples = sample(&model, &Hmc::new(0.15, 20).unwrap(), 3000, &options())
        .unwrap()
        .thin(300, 1)
        .unwrap();
    let flat = samples.pars_flat();
    let n = flat.ncols() as f64;
    let (x, y) = (flat.row(0), flat.row(1));
    let (mx, my) = (x.sum() / n, y.sum() / n);
    let cov = x.iter().zip(y.iter()).map(|(a, b)| (a - mx) * (b - my)).sum::<f64>() / n;
    let vx = x.iter().map(|a| (a - mx).powi(2)).sum::<f64>() / n;
    let vy = y.iter().map(|b| (b - my).powi(2)).sum::<f64>() / n;
    let corr = cov / (vx * vy).sqrt();
    assert!((corr - RHO).abs() < 0.05, "correlation {corr}");
    assert!((vx - 1.0).abs() < 0.2, "variance {vx}");
}

#[test]
fn hmc_needs_a_gradient() {
    let model = MontyModel::from_fn(["x"], |p: &[f64]| -0.5 * p[0] * p[0])
        .build()
        .unwrap();
    let options = SampleOptions::default().with_initial(vec![vec![0.0]]);
    let err = sample(&model, &Hmc::new(0.1, 10).unwrap(), 10, &options).unwrap_err();
    assert!(matches!(err, MontyError::MissingCapability(_)), "{err}");
}

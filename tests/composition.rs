//! Priors, closure likelihoods and their sums.

use approx::assert_abs_diff_eq;
use mini_monty::core::{sample, SampleOptions};
use mini_monty::distributions::{normal_log_density, Univariate};
use mini_monty::model::prior::Prior;
use mini_monty::model::MontyModel;
use mini_monty::rng::RngStream;
use mini_monty::samplers::RandomWalk;

fn prior() -> MontyModel {
    Prior::new()
        .with("mu", Univariate::normal(0.0, 2.0).unwrap())
        .unwrap()
        .with("sigma", Univariate::gamma(2.0, 1.0).unwrap())
        .unwrap()
        .into_model()
}

const DATA: [f64; 5] = [0.3, -0.4, 1.1, 0.7, 0.2];

fn likelihood() -> MontyModel {
    MontyModel::from_fn(["mu", "sigma"], |x: &[f64]| {
        DATA.iter().map(|&y| normal_log_density(y, x[0], x[1])).sum()
    })
    .with_domain(vec![f64::NEG_INFINITY, 0.0], vec![f64::INFINITY, f64::INFINITY])
    .build()
    .unwrap()
}

#[test]
fn sum_density_is_sum_of_parts() {
    let (mut p, mut l) = (prior(), likelihood());
    let mut posterior = (prior() + likelihood()).unwrap();
    for mu in [-2.0, -0.5, 0.0, 0.4, 3.0] {
        for sigma in [0.2, 0.9, 1.0, 4.0] {
            let x = [mu, sigma];
            let expected = p.density(&x).unwrap() + l.density(&x).unwrap();
            assert_abs_diff_eq!(posterior.density(&x).unwrap(), expected, epsilon = 1e-10);
        }
    }
}

#[test]
fn sum_keeps_tightest_domain_and_drops_direct_sampling() {
    let posterior = (prior() + likelihood()).unwrap();
    assert_eq!(posterior.domain().lower(), &[f64::NEG_INFINITY, 0.0]);
    let props = posterior.properties();
    assert!(!props.has_direct_sample);
    assert!(!props.is_stochastic);
    assert!(prior().properties().has_direct_sample);
}

#[test]
fn zero_prior_density_short_circuits() {
    let mut posterior = (prior() + likelihood()).unwrap();
    assert_eq!(posterior.density(&[0.0, -1.0]).unwrap(), f64::NEG_INFINITY);
}

#[test]
fn prior_direct_samples_match_moments() {
    let mut model = prior();
    let mut rng = RngStream::new(11, 0);
    let n = 20_000;
    let draws: Vec<Vec<f64>> = (0..n).map(|_| model.direct_sample(&mut rng).unwrap()).collect();

    let mean = |i: usize| draws.iter().map(|d| d[i]).sum::<f64>() / n as f64;
    let var = |i: usize, m: f64| draws.iter().map(|d| (d[i] - m).powi(2)).sum::<f64>() / n as f64;
    let (m0, m1) = (mean(0), mean(1));
    // normal(0, 2) and gamma(shape 2, scale 1); tolerances are about four
    // standard errors.
    assert_abs_diff_eq!(m0, 0.0, epsilon = 0.06);
    assert_abs_diff_eq!(var(0, m0), 4.0, epsilon = 0.2);
    assert_abs_diff_eq!(m1, 2.0, epsilon = 0.05);
    assert_abs_diff_eq!(var(1, m1), 2.0, epsilon = 0.15);
}

#[test]
fn conjugate_normal_posterior_mean() {
    // mu ~ N(0, 10), y ~ N(mu, 1): posterior mean is sum(y) / (n + 1/100).
    let prior = Prior::new()
        .with("mu", Univariate::normal(0.0, 10.0).unwrap())
        .unwrap()
        .into_model();
    let likelihood = MontyModel::from_fn(["mu"], |x: &[f64]| {
        DATA.iter().map(|&y| normal_log_density(y, x[0], 1.0)).sum()
    })
    .build()
    .unwrap();
    let posterior = (prior + likelihood).unwrap();

    let options = SampleOptions::default()
        .with_chains(4)
        .with_initial(vec![vec![0.0]])
        .set_seed(5);
    let samples = sample(&posterior, &RandomWalk::isotropic(1, 0.9).unwrap(), 4000, &options)
        .unwrap()
        .thin(500, 1)
        .unwrap();
    let mean = samples.pars.mean().unwrap();
    let expected = DATA.iter().sum::<f64>() / (DATA.len() as f64 + 0.01);
    assert_abs_diff_eq!(mean, expected, epsilon = 0.05);
}

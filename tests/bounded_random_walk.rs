//! Random-walk Metropolis on a model whose support is bounded below at zero.

use mini_monty::core::{sample, SampleOptions};
use mini_monty::distributions::Univariate;
use mini_monty::model::prior::Prior;
use mini_monty::model::MontyModel;
use mini_monty::samplers::{Boundaries, RandomWalk};

fn half_normal_prior() -> MontyModel {
    Prior::new()
        .with("a", Univariate::truncated_normal(0.0, 1.0, 0.0, f64::INFINITY).unwrap())
        .unwrap()
        .with("b", Univariate::truncated_normal(0.0, 1.0, 0.0, f64::INFINITY).unwrap())
        .unwrap()
        .into_model()
}

fn options() -> SampleOptions {
    SampleOptions::default()
        .with_chains(2)
        .with_initial(vec![vec![1.0, 1.0]])
        .set_seed(42)
}

#[test]
fn reflect_keeps_every_draw_in_bounds() {
    let model = half_normal_prior();
    let sampler = RandomWalk::isotropic(2, 1.0).unwrap();
    assert_eq!(sampler.boundaries(), Boundaries::Reflect);

    let samples = sample(&model, &sampler, 1000, &options()).unwrap();
    assert_eq!(samples.pars.shape(), &[2, 1000, 2]);
    assert!(samples.pars.iter().all(|&x| x >= 0.0));
    assert!(samples.density.iter().all(|d| d.is_finite()));

    // Half-normal(0, 1) has mean sqrt(2 / pi).
    let flat = samples.pars_flat();
    let mean = flat.row(0).sum() / flat.ncols() as f64;
    assert!((mean - (2.0 / std::f64::consts::PI).sqrt()).abs() < 0.2, "mean {mean}");
}

#[test]
fn reject_keeps_every_draw_in_bounds() {
    let model = half_normal_prior();
    let sampler = RandomWalk::isotropic(2, 1.0)
        .unwrap()
        .with_boundaries(Boundaries::Reject);
    let samples = sample(&model, &sampler, 1000, &options()).unwrap();
    assert!(samples.pars.iter().all(|&x| x >= 0.0));
}

#[test]
fn reflect_accepts_more_often_than_reject_near_a_boundary() {
    let model = half_normal_prior();
    let reflect = RandomWalk::isotropic(2, 1.0).unwrap();
    let reject = reflect.clone().with_boundaries(Boundaries::Reject);
    let rate = |s: &mini_monty::samples::Samples| {
        s.details.iter().map(|d| d.acceptance_rate).sum::<f64>() / s.details.len() as f64
    };
    let with_reflect = sample(&model, &reflect, 1000, &options()).unwrap();
    let with_reject = sample(&model, &reject, 1000, &options()).unwrap();
    assert!(rate(&with_reflect) > rate(&with_reject));
}

#[test]
fn closure_model_with_box_domain() {
    let model = MontyModel::from_fn(["x", "y"], |x: &[f64]| -0.5 * (x[0] * x[0] + x[1] * x[1]))
        .with_domain(vec![0.0, 0.0], vec![f64::INFINITY, 2.0])
        .build()
        .unwrap();
    let samples = sample(&model, &RandomWalk::isotropic(2, 1.5).unwrap(), 1000, &options()).unwrap();
    for draw in samples.pars_flat().columns() {
        assert!(draw[0] >= 0.0);
        assert!((0.0..=2.0).contains(&draw[1]));
    }
}

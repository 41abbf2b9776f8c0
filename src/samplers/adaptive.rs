/*!
Adaptive random-walk Metropolis.

The proposal covariance is re-estimated on every iteration from the chain's
draws so far, shrunk toward the initial covariance:

```text
vcv_n = (w0 * V0 + n * S_n) / (w0 + n)
```

where `V0` is the initial covariance, `w0` its pseudo-count weight and `S_n`
the empirical covariance of the `n` draws seen. The initial covariance
dominates early on and is diluted as draws accumulate.

Proposals use `scaling * vcv_n`. The scaling starts at `2.38² / d` and is
updated on the log scale by a Robbins–Monro step toward the target acceptance
rate (0.234 by default), with step size shrinking as `1 / sqrt(n)`.

Adaptation can be switched off after a fixed number of iterations with
[`AdaptiveRandomWalk::with_adapt_end`]; the kernel is a fixed random walk from
then on.
*/

use std::collections::BTreeMap;

use nalgebra::DMatrix;
use ndarray::{Array1, Array2};

use crate::core::{accept, evaluate, ChainState, Sampler};
use crate::distributions::cholesky;
use crate::error::{MontyError, Result};
use crate::model::MontyModel;
use crate::rng::RngStream;
use crate::samplers::random_walk::{apply_boundaries, check_dim, propose, Boundaries};

#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveRandomWalk {
    initial_vcv: Array2<f64>,
    initial_vcv_weight: f64,
    initial_scaling: Option<f64>,
    scaling_increment: f64,
    acceptance_target: f64,
    adapt_end: Option<usize>,
    boundaries: Boundaries,
}

impl AdaptiveRandomWalk {
    pub fn new(initial_vcv: Array2<f64>) -> Result<Self> {
        cholesky(&initial_vcv)?;
        Ok(Self {
            initial_vcv,
            initial_vcv_weight: 1000.0,
            initial_scaling: None,
            scaling_increment: 1.0,
            acceptance_target: 0.234,
            adapt_end: None,
            boundaries: Boundaries::default(),
        })
    }

    /// Pseudo-count given to the initial covariance.
    pub fn with_weight(mut self, weight: f64) -> Result<Self> {
        if !(weight >= 0.0 && weight.is_finite()) {
            return Err(MontyError::invalid(format!(
                "initial covariance weight must be non-negative, got {weight}"
            )));
        }
        self.initial_vcv_weight = weight;
        Ok(self)
    }

    pub fn with_initial_scaling(mut self, scaling: f64) -> Result<Self> {
        if !(scaling > 0.0 && scaling.is_finite()) {
            return Err(MontyError::invalid(format!("scaling must be positive, got {scaling}")));
        }
        self.initial_scaling = Some(scaling);
        Ok(self)
    }

    pub fn with_scaling_increment(mut self, increment: f64) -> Self {
        self.scaling_increment = increment;
        self
    }

    pub fn with_acceptance_target(mut self, target: f64) -> Result<Self> {
        if !(target > 0.0 && target < 1.0) {
            return Err(MontyError::invalid(format!(
                "acceptance target must be in (0, 1), got {target}"
            )));
        }
        self.acceptance_target = target;
        Ok(self)
    }

    /// Stop adapting after `n` iterations.
    pub fn with_adapt_end(mut self, n: usize) -> Self {
        self.adapt_end = Some(n);
        self
    }

    pub fn with_boundaries(mut self, boundaries: Boundaries) -> Self {
        self.boundaries = boundaries;
        self
    }
}

/// Per-chain adaptation state.
#[derive(Debug, Clone, PartialEq)]
pub struct Adaptation {
    iteration: usize,
    n: usize,
    mean: Array1<f64>,
    /// Sum of outer products of deviations (Welford).
    scatter: Array2<f64>,
    log_scaling: f64,
    vcv: Array2<f64>,
    chol: DMatrix<f64>,
}

impl Adaptation {
    pub fn scaling(&self) -> f64 {
        self.log_scaling.exp()
    }

    pub fn vcv(&self) -> &Array2<f64> {
        &self.vcv
    }

    fn observe(&mut self, x: &[f64]) {
        self.n += 1;
        let n = self.n as f64;
        let x = Array1::from(x.to_vec());
        let delta = &x - &self.mean;
        self.mean = &self.mean + &(&delta / n);
        let delta2 = &x - &self.mean;
        let d = x.len();
        for i in 0..d {
            for j in 0..d {
                self.scatter[[i, j]] += delta[i] * delta2[j];
            }
        }
    }

    fn update_vcv(&mut self, initial: &Array2<f64>, weight: f64) {
        if self.n < 2 {
            return;
        }
        let n = self.n as f64;
        let empirical = &self.scatter / (n - 1.0);
        let vcv = (initial * weight + &empirical * n) / (weight + n);
        match cholesky(&vcv) {
            Ok(chol) => {
                self.vcv = vcv;
                self.chol = chol;
            }
            Err(_) => log::debug!(
                "adapted covariance is not positive definite after {} draws; keeping previous",
                self.n
            ),
        }
    }
}

impl Sampler for AdaptiveRandomWalk {
    type Aux = Adaptation;

    fn check(&self, model: &MontyModel) -> Result<()> {
        check_dim(&self.initial_vcv, model)
    }

    fn initialise(
        &self,
        _model: &mut MontyModel,
        state: &ChainState,
        _rng: &mut RngStream,
    ) -> Result<Adaptation> {
        let d = state.pars.len();
        let scaling = self
            .initial_scaling
            .unwrap_or(2.38 * 2.38 / d.max(1) as f64);
        Ok(Adaptation {
            iteration: 0,
            n: 0,
            mean: Array1::zeros(d),
            scatter: Array2::zeros((d, d)),
            log_scaling: scaling.ln(),
            vcv: self.initial_vcv.clone(),
            chol: cholesky(&self.initial_vcv)?,
        })
    }

    fn step(
        &self,
        model: &mut MontyModel,
        state: &mut ChainState,
        aux: &mut Adaptation,
        rng: &mut RngStream,
    ) -> Result<bool> {
        let scale = aux.scaling().sqrt();
        let mut proposal = propose(&state.pars, &aux.chol, scale, rng);
        let (accepted, p_accept) = if apply_boundaries(model.domain(), self.boundaries, &mut proposal) {
            let density = evaluate(model, &proposal)?;
            let log_ratio = density - state.density;
            let p_accept = if log_ratio.is_nan() {
                0.0
            } else {
                log_ratio.exp().min(1.0)
            };
            let accepted = accept(log_ratio, rng);
            if accepted {
                state.pars = proposal;
                state.density = density;
            }
            (accepted, p_accept)
        } else {
            (false, 0.0)
        };

        aux.iteration += 1;
        if self.adapt_end.map_or(true, |end| aux.iteration <= end) {
            let gain = self.scaling_increment / (aux.iteration as f64).sqrt();
            aux.log_scaling += gain * (p_accept - self.acceptance_target);
            aux.observe(&state.pars);
            aux.update_vcv(&self.initial_vcv, self.initial_vcv_weight);
        }
        Ok(accepted)
    }

    fn details(&self, aux: &Adaptation) -> BTreeMap<String, f64> {
        BTreeMap::from([("scaling".to_string(), aux.scaling())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{sample, SampleOptions};
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;

    #[test]
    fn welford_matches_batch_covariance() {
        let sampler = AdaptiveRandomWalk::new(Array2::eye(2)).unwrap();
        let mut model = MontyModel::from_fn(["a", "b"], |_: &[f64]| 0.0).build().unwrap();
        let state = ChainState {
            pars: vec![0.0, 0.0],
            density: 0.0,
        };
        let mut aux = sampler.initialise(&mut model, &state, &mut RngStream::new(0, 0)).unwrap();
        let xs = [[1.0, 2.0], [3.0, 1.0], [2.0, 2.0], [0.0, 5.0]];
        for x in &xs {
            aux.observe(x);
        }
        let m0 = xs.iter().map(|x| x[0]).sum::<f64>() / 4.0;
        let m1 = xs.iter().map(|x| x[1]).sum::<f64>() / 4.0;
        let c01 = xs.iter().map(|x| (x[0] - m0) * (x[1] - m1)).sum::<f64>() / 3.0;
        assert_abs_diff_eq!(aux.scatter[[0, 1]] / 3.0, c01, epsilon = 1e-12);
        assert_abs_diff_eq!(aux.mean[1], m1, epsilon = 1e-12);

        // Zero weight leaves just the empirical covariance.
        aux.update_vcv(&Array2::eye(2), 0.0);
        assert_abs_diff_eq!(aux.vcv()[[0, 1]], c01, epsilon = 1e-12);
    }

    #[test]
    fn learns_correlated_target() {
        let rho: f64 = 0.9;
        let det = 1.0 - rho * rho;
        let model = MontyModel::from_fn(["a", "b"], move |x: &[f64]| {
            -0.5 * (x[0] * x[0] - 2.0 * rho * x[0] * x[1] + x[1] * x[1]) / det
        })
        .build()
        .unwrap();
        let sampler = AdaptiveRandomWalk::new(Array2::eye(2) * 0.1)
            .unwrap()
            .with_weight(10.0)
            .unwrap();
        let options = SampleOptions::default().with_initial(vec![vec![0.0, 0.0]]).set_seed(21);
        let samples = sample(&model, &sampler, 20_000, &options).unwrap();
        let rate = samples.details[0].acceptance_rate;
        assert!(rate > 0.15 && rate < 0.4, "acceptance rate {rate}");
        let scaling = samples.details[0].extra["scaling"];
        assert!(scaling > 0.5 && scaling < 10.0, "scaling {scaling}");

        let kept = samples.thin(5000, 1).unwrap();
        let a = kept.pars.slice(ndarray::s![0, .., 0]).to_vec();
        let b = kept.pars.slice(ndarray::s![1, .., 0]).to_vec();
        let n = a.len() as f64;
        let ma = a.iter().sum::<f64>() / n;
        let mb = b.iter().sum::<f64>() / n;
        let cov = a.iter().zip(&b).map(|(x, y)| (x - ma) * (y - mb)).sum::<f64>() / n;
        assert_abs_diff_eq!(cov, rho, epsilon = 0.2);
    }

    #[test]
    fn adaptation_stops() {
        let model = MontyModel::from_fn(["a"], |x: &[f64]| -0.5 * x[0] * x[0]).build().unwrap();
        let sampler = AdaptiveRandomWalk::new(arr2(&[[1.0]])).unwrap().with_adapt_end(10);
        let mut m = model.fork(&mut RngStream::new(2, 0)).unwrap();
        let mut state = ChainState {
            pars: vec![0.0],
            density: 0.0,
        };
        let mut rng = RngStream::new(2, 0);
        let mut aux = sampler.initialise(&mut m, &state, &mut rng).unwrap();
        for _ in 0..10 {
            sampler.step(&mut m, &mut state, &mut aux, &mut rng).unwrap();
        }
        let frozen = aux.clone();
        for _ in 0..20 {
            sampler.step(&mut m, &mut state, &mut aux, &mut rng).unwrap();
        }
        assert_eq!(aux.scaling(), frozen.scaling());
        assert_eq!(aux.vcv(), frozen.vcv());
        assert_eq!(aux.iteration, 30);
    }

    #[test]
    fn invalid_configuration() {
        assert!(AdaptiveRandomWalk::new(arr2(&[[-1.0]])).is_err());
        let s = AdaptiveRandomWalk::new(arr2(&[[1.0]])).unwrap();
        assert!(s.clone().with_weight(-1.0).is_err());
        assert!(s.clone().with_acceptance_target(1.5).is_err());
        assert!(s.with_initial_scaling(0.0).is_err());
    }
}

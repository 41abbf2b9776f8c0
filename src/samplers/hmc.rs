/*!
Hamiltonian Monte Carlo with a fixed step size and number of leapfrog steps.

Momentum is drawn as `p ~ N(0, M)` with a diagonal mass matrix `M` (identity
by default). The trajectory is integrated with the leapfrog scheme using the
model gradient, and the end point is accepted with probability
`min(1, exp(H(x, p) - H(x*, p*)))`, where `H = -log π(x) + pᵀ M⁻¹ p / 2`.

A trajectory that leaves the model domain, or reaches a point where the
gradient cannot be computed, is rejected.

```rust
use mini_monty::core::{sample, SampleOptions};
use mini_monty::model::MontyModel;
use mini_monty::samplers::hmc::Hmc;

let model = MontyModel::from_fn(["x"], |x: &[f64]| -0.5 * x[0] * x[0])
    .with_gradient(|x: &[f64]| vec![-x[0]])
    .build()
    .unwrap();
let sampler = Hmc::new(0.2, 10).unwrap();
let options = SampleOptions::default().with_initial(vec![vec![1.0]]).set_seed(3);
let samples = sample(&model, &sampler, 100, &options).unwrap();
assert!(samples.details[0].acceptance_rate > 0.9);
```
*/

use crate::core::{accept, evaluate, evaluate_gradient, ChainState, Sampler};
use crate::error::{MontyError, Result};
use crate::model::MontyModel;
use crate::rng::RngStream;

#[derive(Debug, Clone, PartialEq)]
pub struct Hmc {
    epsilon: f64,
    n_integration_steps: usize,
    mass: Option<Vec<f64>>,
}

impl Hmc {
    pub fn new(epsilon: f64, n_integration_steps: usize) -> Result<Self> {
        if !(epsilon > 0.0 && epsilon.is_finite()) {
            return Err(MontyError::invalid(format!("epsilon must be positive, got {epsilon}")));
        }
        if n_integration_steps == 0 {
            return Err(MontyError::invalid("n_integration_steps must be at least 1"));
        }
        Ok(Self {
            epsilon,
            n_integration_steps,
            mass: None,
        })
    }

    /// Diagonal of the mass matrix.
    pub fn with_mass(mut self, mass: Vec<f64>) -> Result<Self> {
        if let Some(m) = mass.iter().find(|m| !(**m > 0.0 && m.is_finite())) {
            return Err(MontyError::invalid(format!("mass must be positive, got {m}")));
        }
        self.mass = Some(mass);
        Ok(self)
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn n_integration_steps(&self) -> usize {
        self.n_integration_steps
    }

    fn mass(&self, i: usize) -> f64 {
        self.mass.as_ref().map_or(1.0, |m| m[i])
    }

    fn kinetic(&self, p: &[f64]) -> f64 {
        p.iter()
            .enumerate()
            .map(|(i, pi)| 0.5 * pi * pi / self.mass(i))
            .sum()
    }
}

/// Gradient at the current state, reused as the start of the next trajectory.
#[derive(Debug, Clone, PartialEq)]
pub struct HmcState {
    gradient: Option<Vec<f64>>,
}

impl Sampler for Hmc {
    type Aux = HmcState;

    fn check(&self, model: &MontyModel) -> Result<()> {
        if !model.properties().has_gradient {
            return Err(MontyError::MissingCapability("gradient"));
        }
        if let Some(mass) = &self.mass {
            if mass.len() != model.dim() {
                return Err(MontyError::shape("mass matrix", model.dim(), mass.len()));
            }
        }
        Ok(())
    }

    fn initialise(
        &self,
        model: &mut MontyModel,
        state: &ChainState,
        _rng: &mut RngStream,
    ) -> Result<HmcState> {
        Ok(HmcState {
            gradient: evaluate_gradient(model, &state.pars)?,
        })
    }

    fn step(
        &self,
        model: &mut MontyModel,
        state: &mut ChainState,
        aux: &mut HmcState,
        rng: &mut RngStream,
    ) -> Result<bool> {
        let Some(mut gradient) = aux.gradient.clone() else {
            // Stuck at a point without a gradient; try to recover one.
            aux.gradient = evaluate_gradient(model, &state.pars)?;
            return Ok(false);
        };
        let eps = self.epsilon;
        let mut x = state.pars.clone();
        let mut p: Vec<f64> = (0..x.len())
            .map(|i| self.mass(i).sqrt() * rng.std_normal())
            .collect();
        let kinetic_start = self.kinetic(&p);

        for (pi, gi) in p.iter_mut().zip(&gradient) {
            *pi += 0.5 * eps * gi;
        }
        for step in 0..self.n_integration_steps {
            for (i, xi) in x.iter_mut().enumerate() {
                *xi += eps * p[i] / self.mass(i);
            }
            if !model.domain().contains(&x) {
                return Ok(false);
            }
            gradient = match evaluate_gradient(model, &x)? {
                Some(g) => g,
                None => return Ok(false),
            };
            let factor = if step + 1 == self.n_integration_steps {
                0.5 * eps
            } else {
                eps
            };
            for (pi, gi) in p.iter_mut().zip(&gradient) {
                *pi += factor * gi;
            }
        }

        let density = evaluate(model, &x)?;
        let log_ratio = (density - self.kinetic(&p)) - (state.density - kinetic_start);
        if accept(log_ratio, rng) {
            state.pars = x;
            state.density = density;
            aux.gradient = Some(gradient);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn gaussian() -> MontyModel {
        MontyModel::from_fn(["a", "b"], |x: &[f64]| -0.5 * (x[0] * x[0] + x[1] * x[1] / 4.0))
            .with_gradient(|x: &[f64]| vec![-x[0], -x[1] / 4.0])
            .build()
            .unwrap()
    }

    #[test]
    fn leapfrog_conserves_energy_for_small_steps() {
        let mut model = gaussian();
        let sampler = Hmc::new(0.01, 100).unwrap();
        let mut state = ChainState {
            pars: vec![1.0, -1.0],
            density: model.density(&[1.0, -1.0]).unwrap(),
        };
        let mut rng = RngStream::new(5, 0);
        let mut aux = sampler.initialise(&mut model, &state, &mut rng).unwrap();
        let mut accepted = 0;
        for _ in 0..50 {
            accepted += sampler.step(&mut model, &mut state, &mut aux, &mut rng).unwrap() as usize;
        }
        assert_eq!(accepted, 50);
        assert_abs_diff_eq!(
            aux.gradient.as_ref().unwrap()[0],
            -state.pars[0],
            epsilon = 1e-12
        );
    }

    #[test]
    fn requires_gradient() {
        let model = MontyModel::from_fn(["a"], |_: &[f64]| 0.0).build().unwrap();
        let sampler = Hmc::new(0.1, 5).unwrap();
        assert!(matches!(sampler.check(&model), Err(MontyError::MissingCapability(_))));
        assert!(Hmc::new(0.0, 5).is_err());
        assert!(Hmc::new(0.1, 0).is_err());
        let sampler = sampler.with_mass(vec![1.0, 2.0]).unwrap();
        assert!(matches!(sampler.check(&gaussian()), Ok(())));
        assert!(Hmc::new(0.1, 5).unwrap().with_mass(vec![0.0]).is_err());
    }

    #[test]
    fn leaving_the_domain_rejects() {
        let mut model = MontyModel::from_fn(["a"], |x: &[f64]| -x[0])
            .with_gradient(|_: &[f64]| vec![-1.0])
            .with_domain(vec![0.0], vec![f64::INFINITY])
            .build()
            .unwrap();
        // Large steps toward the boundary from close to it.
        let sampler = Hmc::new(1.0, 3).unwrap();
        let mut state = ChainState {
            pars: vec![0.01],
            density: -0.01,
        };
        let mut rng = RngStream::new(8, 0);
        let mut aux = sampler.initialise(&mut model, &state, &mut rng).unwrap();
        for _ in 0..100 {
            sampler.step(&mut model, &mut state, &mut aux, &mut rng).unwrap();
            assert!(state.pars[0] >= 0.0);
        }
    }
}

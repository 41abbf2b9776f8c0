/*!
Random-walk Metropolis.

Proposals are `x* = x + L z` with `L` the Cholesky factor of the proposal
covariance and `z` standard normal. A proposal that leaves a bounded domain is
handled by the [`Boundaries`] policy:

- `Reflect` (default): fold the offending coordinates back into the domain,
  `2 * bound - x*` for a single violated bound, then evaluate there.
- `Reject`: reject without evaluating the density.
- `Ignore`: evaluate as proposed. Only correct if the density itself returns
  `-inf` outside its support, so it must be asked for explicitly.

```rust
use mini_monty::core::{sample, SampleOptions};
use mini_monty::model::MontyModel;
use mini_monty::samplers::random_walk::{Boundaries, RandomWalk};
use ndarray::arr2;

let model = MontyModel::from_fn(["rate"], |x: &[f64]| -x[0])
    .with_domain(vec![0.0], vec![f64::INFINITY])
    .build()
    .unwrap();
let sampler = RandomWalk::new(arr2(&[[0.5]]))
    .unwrap()
    .with_boundaries(Boundaries::Reject);
let options = SampleOptions::default().with_initial(vec![vec![1.0]]).set_seed(1);
let samples = sample(&model, &sampler, 200, &options).unwrap();
assert!(samples.pars.iter().all(|&x| x >= 0.0));
```
*/

use nalgebra::{DMatrix, DVector};
use ndarray::Array2;

use crate::core::{accept, evaluate, ChainState, Sampler};
use crate::distributions::cholesky;
use crate::error::{MontyError, Result};
use crate::model::{Domain, MontyModel};
use crate::rng::RngStream;

/// What to do with a proposal outside the model domain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Boundaries {
    #[default]
    Reflect,
    Reject,
    Ignore,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RandomWalk {
    vcv: Array2<f64>,
    chol: DMatrix<f64>,
    boundaries: Boundaries,
}

impl RandomWalk {
    /// `vcv` must be symmetric positive definite.
    pub fn new(vcv: Array2<f64>) -> Result<Self> {
        let chol = cholesky(&vcv)?;
        Ok(Self {
            vcv,
            chol,
            boundaries: Boundaries::default(),
        })
    }

    /// Independent proposals with standard deviation `sd` in every dimension.
    pub fn isotropic(dim: usize, sd: f64) -> Result<Self> {
        if !(sd > 0.0 && sd.is_finite()) {
            return Err(MontyError::invalid(format!("proposal sd must be positive, got {sd}")));
        }
        Self::new(Array2::eye(dim) * (sd * sd))
    }

    pub fn with_boundaries(mut self, boundaries: Boundaries) -> Self {
        self.boundaries = boundaries;
        self
    }

    pub fn vcv(&self) -> &Array2<f64> {
        &self.vcv
    }

    pub fn boundaries(&self) -> Boundaries {
        self.boundaries
    }

    pub(crate) fn chol(&self) -> &DMatrix<f64> {
        &self.chol
    }
}

/// `x + scale * L z`.
pub(crate) fn propose(x: &[f64], chol: &DMatrix<f64>, scale: f64, rng: &mut RngStream) -> Vec<f64> {
    let z = DVector::from_fn(x.len(), |_, _| rng.std_normal());
    let step = chol * z;
    x.iter().zip(step.iter()).map(|(xi, s)| xi + scale * s).collect()
}

/// Apply the boundary policy in place. `false` means the proposal is rejected
/// outright.
pub(crate) fn apply_boundaries(domain: &Domain, boundaries: Boundaries, x: &mut [f64]) -> bool {
    if domain.contains(x) {
        return true;
    }
    match boundaries {
        Boundaries::Reflect => {
            domain.reflect(x);
            true
        }
        Boundaries::Reject => false,
        Boundaries::Ignore => true,
    }
}

pub(crate) fn check_dim(vcv: &Array2<f64>, model: &MontyModel) -> Result<()> {
    if vcv.nrows() != model.dim() {
        return Err(MontyError::shape("proposal covariance", model.dim(), vcv.nrows()));
    }
    Ok(())
}

/// One Metropolis step with a Gaussian proposal; shared with the adaptive
/// sampler.
pub(crate) fn metropolis_step(
    model: &mut MontyModel,
    state: &mut ChainState,
    chol: &DMatrix<f64>,
    scale: f64,
    boundaries: Boundaries,
    rng: &mut RngStream,
) -> Result<bool> {
    let mut proposal = propose(&state.pars, chol, scale, rng);
    if !apply_boundaries(model.domain(), boundaries, &mut proposal) {
        return Ok(false);
    }
    let density = evaluate(model, &proposal)?;
    if accept(density - state.density, rng) {
        state.pars = proposal;
        state.density = density;
        Ok(true)
    } else {
        Ok(false)
    }
}

impl Sampler for RandomWalk {
    type Aux = ();

    fn check(&self, model: &MontyModel) -> Result<()> {
        check_dim(&self.vcv, model)
    }

    fn initialise(&self, _model: &mut MontyModel, _state: &ChainState, _rng: &mut RngStream) -> Result<()> {
        Ok(())
    }

    fn step(
        &self,
        model: &mut MontyModel,
        state: &mut ChainState,
        _aux: &mut (),
        rng: &mut RngStream,
    ) -> Result<bool> {
        metropolis_step(model, state, &self.chol, 1.0, self.boundaries, rng)
    }
}

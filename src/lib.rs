/*!
# Mini Monty

Particle filters and MCMC samplers for stochastic and deterministic dynamical
models.

- [`system`]: the [`system::Generator`] interface implemented by models, and a
  [`system::System`] that runs many particles of a model forward in time,
  by discrete updates or by ODE integration.
- [`filter`]: a bootstrap particle filter estimating the marginal likelihood
  of observed data.
- [`packer`]: mapping between flat parameter vectors and named parameters.
- [`model`]: the density interface samplers work against, with priors,
  closures and particle-filter likelihoods as sources, and composition by `+`.
- [`core`] and [`samplers`]: parallel multi-chain MCMC with random-walk,
  adaptive, HMC and parallel-tempering kernels.
- [`samples`]: the sample bundle and its post-processing.

Randomness always flows through explicit [`rng::RngStream`] handles: every
particle and every chain owns its own stream, derived from a root seed by
index.

## Example

```rust
use mini_monty::core::{sample, SampleOptions};
use mini_monty::distributions::Univariate;
use mini_monty::model::{prior::Prior, MontyModel};
use mini_monty::samplers::RandomWalk;

let prior = Prior::new()
    .with("mu", Univariate::normal(0.0, 10.0).unwrap())
    .unwrap()
    .into_model();
let data = [1.2, 0.8, 1.1, 0.9];
let likelihood = MontyModel::from_fn(["mu"], move |x: &[f64]| {
    data.iter().map(|y| -0.5 * (y - x[0]).powi(2)).sum()
})
.build()
.unwrap();
let posterior = (prior + likelihood).unwrap();

let options = SampleOptions::default()
    .with_chains(2)
    .with_initial(vec![vec![0.0]])
    .set_seed(1);
let samples = sample(&posterior, &RandomWalk::isotropic(1, 0.8).unwrap(), 2000, &options).unwrap();
let mean = samples.thin(500, 1).unwrap().pars.mean().unwrap();
assert!((mean - 1.0).abs() < 0.2);
```
*/

pub mod core;
pub mod data;
pub mod distributions;
pub mod error;
pub mod filter;
pub mod io;
pub mod model;
pub mod packer;
pub mod params;
pub mod rng;
pub mod samplers;
pub mod samples;
pub mod stats;
pub mod system;

/*!
Parallel tempering.

A ladder of rungs with inverse temperatures `1 = β₀ > β₁ > … ≥ 0` targets

```text
log π_β(x) = log base(x) + β · log L(x)
```

so the cold rung is the model itself and a rung with `β = 0` is the base
alone. The base is found in one of two ways:

- the model is a sum whose one operand can be sampled directly (typically
  `prior + likelihood`); that operand is the base, always at full weight, and
  the other operand is `L`;
- a reference model given with [`ParallelTempering::with_base`]; then
  `log L = log π - log base`.

Every iteration each rung takes one random-walk step against its tempered
density; a rung at `β = 0` whose base can be sampled directly draws from the
base instead. Neighbouring rungs then attempt to swap states, alternating
between the even pairs `(0, 1), (2, 3), …` and the odd pairs `(1, 2), …`
(the non-reversible scheme). A swap between rungs `i` and `j` is accepted
with probability `min(1, exp((β_i - β_j)(log L(x_j) - log L(x_i))))`.

Only the cold rung is reported. When the model has observers, every rung
keeps the observation made at its own point, it travels with the rung through
swaps, and the cold rung's observation is stored with each draw. Swap
acceptance rates per neighbouring pair are reported as `swap_rate_<i>` in the
chain details.
*/

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::core::{accept, evaluate, ChainState, Sampler};
use crate::error::{MontyError, Result};
use crate::model::{MontyModel, Observation};
use crate::rng::RngStream;
use crate::samplers::random_walk::{apply_boundaries, check_dim, propose, RandomWalk};

#[derive(Debug, Clone)]
pub struct ParallelTempering {
    proposal: RandomWalk,
    betas: Vec<f64>,
    base: Option<Arc<Mutex<MontyModel>>>,
}

impl ParallelTempering {
    /// `n_rungs + 1` rungs with `β` evenly spaced from 1 down to 0.
    pub fn new(proposal: RandomWalk, n_rungs: usize) -> Result<Self> {
        if n_rungs == 0 {
            return Err(MontyError::invalid("parallel tempering needs at least one hot rung"));
        }
        let betas = (0..=n_rungs)
            .map(|i| 1.0 - i as f64 / n_rungs as f64)
            .collect();
        Ok(Self {
            proposal,
            betas,
            base: None,
        })
    }

    /// Explicit inverse temperatures, strictly decreasing from 1.
    pub fn with_betas(mut self, betas: Vec<f64>) -> Result<Self> {
        if betas.len() < 2 || betas[0] != 1.0 {
            return Err(MontyError::invalid(
                "betas must start at 1 and have at least two rungs",
            ));
        }
        if betas.windows(2).any(|w| !(w[1] < w[0])) || betas.iter().any(|b| !(*b >= 0.0)) {
            return Err(MontyError::invalid(
                "betas must be strictly decreasing and non-negative",
            ));
        }
        self.betas = betas;
        Ok(self)
    }

    /// Reference model for targets that are not a `prior + likelihood` sum.
    pub fn with_base(mut self, base: MontyModel) -> Self {
        self.base = Some(Arc::new(Mutex::new(base)));
        self
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }
}

enum Decomposition {
    Prior { first: bool },
    Base(MontyModel),
}

/// Which operand of a sum can be sampled directly.
fn prior_side(model: &MontyModel) -> Option<bool> {
    let (a, b) = model.split()?;
    if a.properties().has_direct_sample {
        Some(true)
    } else if b.properties().has_direct_sample {
        Some(false)
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Rung {
    pars: Vec<f64>,
    base: f64,
    likelihood: f64,
    observation: Option<Observation>,
}

impl Rung {
    fn tempered(&self, beta: f64) -> f64 {
        if beta == 0.0 {
            self.base
        } else {
            self.base + beta * self.likelihood
        }
    }

    fn target(&self) -> f64 {
        self.base + self.likelihood
    }
}

/// Per-chain ladder of rungs.
pub struct TemperingState {
    decomposition: Decomposition,
    observed: bool,
    rungs: Vec<Rung>,
    iteration: usize,
    swap_attempts: Vec<u64>,
    swap_accepts: Vec<u64>,
}

impl TemperingState {
    /// Position of each rung, coldest first.
    pub fn rung_pars(&self) -> Vec<&[f64]> {
        self.rungs.iter().map(|r| r.pars.as_slice()).collect()
    }

    pub fn swap_rates(&self) -> Vec<f64> {
        self.swap_attempts
            .iter()
            .zip(&self.swap_accepts)
            .map(|(&n, &k)| if n == 0 { 0.0 } else { k as f64 / n as f64 })
            .collect()
    }
}

fn evaluate_rung(
    model: &mut MontyModel,
    decomposition: &mut Decomposition,
    x: Vec<f64>,
    observed: bool,
) -> Result<Rung> {
    let (base, likelihood) = match decomposition {
        Decomposition::Prior { first } => {
            let (a, b) = model
                .split_mut()
                .ok_or(MontyError::MissingCapability("prior + likelihood decomposition"))?;
            let (prior, likelihood) = if *first { (a, b) } else { (b, a) };
            let base = evaluate(prior, &x)?;
            if base == f64::NEG_INFINITY {
                (base, f64::NEG_INFINITY)
            } else {
                (base, evaluate(likelihood, &x)?)
            }
        }
        Decomposition::Base(reference) => {
            let base = evaluate(reference, &x)?;
            if base == f64::NEG_INFINITY {
                (base, f64::NEG_INFINITY)
            } else {
                let l = evaluate(model, &x)? - base;
                (base, if l.is_nan() { f64::NEG_INFINITY } else { l })
            }
        }
    };
    let observation = if observed && likelihood > f64::NEG_INFINITY {
        Some(model.observe()?)
    } else {
        None
    };
    Ok(Rung {
        pars: x,
        base,
        likelihood,
        observation,
    })
}

fn sample_base(
    model: &mut MontyModel,
    decomposition: &mut Decomposition,
    rng: &mut RngStream,
) -> Result<Option<Vec<f64>>> {
    match decomposition {
        Decomposition::Prior { first } => {
            let (a, b) = model
                .split_mut()
                .ok_or(MontyError::MissingCapability("prior + likelihood decomposition"))?;
            let prior = if *first { a } else { b };
            Ok(Some(prior.direct_sample(rng)?))
        }
        Decomposition::Base(reference) if reference.properties().has_direct_sample => {
            Ok(Some(reference.direct_sample(rng)?))
        }
        Decomposition::Base(_) => Ok(None),
    }
}

impl Sampler for ParallelTempering {
    type Aux = TemperingState;

    fn check(&self, model: &MontyModel) -> Result<()> {
        check_dim(self.proposal.vcv(), model)?;
        match &self.base {
            Some(base) => {
                let base = base
                    .lock()
                    .map_err(|_| MontyError::invalid("base model lock poisoned"))?;
                if base.parameters() != model.parameters() {
                    return Err(MontyError::invalid(
                        "base model must have the same parameters as the target",
                    ));
                }
                Ok(())
            }
            None => prior_side(model).map(|_| ()).ok_or(MontyError::MissingCapability(
                "a directly sampleable prior operand or a base model for tempering",
            )),
        }
    }

    fn initialise(
        &self,
        model: &mut MontyModel,
        state: &ChainState,
        rng: &mut RngStream,
    ) -> Result<TemperingState> {
        let mut decomposition = match &self.base {
            Some(base) => {
                let base = base
                    .lock()
                    .map_err(|_| MontyError::invalid("base model lock poisoned"))?;
                Decomposition::Base(base.fork(rng)?)
            }
            None => Decomposition::Prior {
                first: prior_side(model).ok_or(MontyError::MissingCapability(
                    "a directly sampleable prior operand or a base model for tempering",
                ))?,
            },
        };
        let observed = model.properties().has_observer;
        let start = evaluate_rung(model, &mut decomposition, state.pars.clone(), observed)?;
        let n_pairs = self.betas.len() - 1;
        Ok(TemperingState {
            decomposition,
            observed,
            rungs: vec![start; self.betas.len()],
            iteration: 0,
            swap_attempts: vec![0; n_pairs],
            swap_accepts: vec![0; n_pairs],
        })
    }

    fn step(
        &self,
        model: &mut MontyModel,
        state: &mut ChainState,
        aux: &mut TemperingState,
        rng: &mut RngStream,
    ) -> Result<bool> {
        let mut moved = false;
        for (i, &beta) in self.betas.iter().enumerate() {
            if beta == 0.0 {
                if let Some(x) = sample_base(model, &mut aux.decomposition, rng)? {
                    aux.rungs[i] = evaluate_rung(model, &mut aux.decomposition, x, aux.observed)?;
                    continue;
                }
            }
            let mut proposal = propose(&aux.rungs[i].pars, self.proposal.chol(), 1.0, rng);
            if !apply_boundaries(model.domain(), self.proposal.boundaries(), &mut proposal) {
                continue;
            }
            let candidate = evaluate_rung(model, &mut aux.decomposition, proposal, aux.observed)?;
            if accept(candidate.tempered(beta) - aux.rungs[i].tempered(beta), rng) {
                aux.rungs[i] = candidate;
                moved |= i == 0;
            }
        }

        for i in (aux.iteration % 2..self.betas.len() - 1).step_by(2) {
            let log_alpha = (self.betas[i] - self.betas[i + 1])
                * (aux.rungs[i + 1].likelihood - aux.rungs[i].likelihood);
            aux.swap_attempts[i] += 1;
            if accept(log_alpha, rng) {
                aux.rungs.swap(i, i + 1);
                aux.swap_accepts[i] += 1;
                moved |= i == 0;
            }
        }
        aux.iteration += 1;
        if aux.iteration % 1000 == 0 {
            log::debug!("tempering swap rates after {} steps: {:?}", aux.iteration, aux.swap_rates());
        }

        state.pars.clone_from(&aux.rungs[0].pars);
        state.density = aux.rungs[0].target();
        Ok(moved)
    }

    fn observe(&self, _model: &mut MontyModel, aux: &TemperingState) -> Result<Option<Observation>> {
        Ok(aux.rungs[0].observation.clone())
    }

    fn details(&self, aux: &TemperingState) -> BTreeMap<String, f64> {
        aux.swap_rates()
            .into_iter()
            .enumerate()
            .map(|(i, rate)| (format!("swap_rate_{i}"), rate))
            .collect()
    }
}

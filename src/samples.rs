/*!
# Sample Bundles

[`Samples`] is the output of [`crate::core::sample`]:

- `pars`: `parameter × step × chain`
- `density`: `step × chain`
- `observations`: one array per observer key, with the observer's own
  dimensions followed by `step × chain` (so trajectories are
  `state × time × step × chain`). Steps without an observation are `NaN`.
- `initial`: `parameter × chain`
- `details`: per-chain acceptance rate and sampler diagnostics.

Bundles can be thinned after the fact and a finished run can be continued
from [`Samples::restart`] and joined with [`Samples::append`].
*/

use std::collections::BTreeMap;

use ndarray::{concatenate, Array2, Array3, ArrayD, Axis, IxDyn, Slice};

use crate::core::ChainOutput;
use crate::error::{MontyError, Result};
use crate::model::Observation;

/// Per-chain summary of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainDetails {
    pub acceptance_rate: f64,
    /// Sampler-specific diagnostics, e.g. tempering swap rates.
    pub extra: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Samples {
    pub parameter_names: Vec<String>,
    pub pars: Array3<f64>,
    pub density: Array2<f64>,
    pub initial: Array2<f64>,
    pub observations: BTreeMap<String, ArrayD<f64>>,
    pub details: Vec<ChainDetails>,
    restart: Vec<Vec<f64>>,
}

impl Samples {
    pub(crate) fn from_chains(parameter_names: Vec<String>, chains: Vec<ChainOutput>) -> Result<Self> {
        let n_chains = chains.len();
        let n_pars = parameter_names.len();
        let n_steps = chains.first().map_or(0, |c| c.density.len());

        let mut pars = Array3::<f64>::zeros((n_pars, n_steps, n_chains));
        let mut density = Array2::<f64>::zeros((n_steps, n_chains));
        let mut initial = Array2::<f64>::zeros((n_pars, n_chains));
        for (c, chain) in chains.iter().enumerate() {
            if chain.density.len() != n_steps {
                return Err(MontyError::shape("chain length", n_steps, chain.density.len()));
            }
            pars.index_axis_mut(Axis(2), c).assign(&chain.pars);
            for (s, &d) in chain.density.iter().enumerate() {
                density[[s, c]] = d;
            }
            for (p, &v) in chain.initial.iter().enumerate() {
                initial[[p, c]] = v;
            }
        }

        let per_chain: Vec<&[Option<Observation>]> =
            chains.iter().map(|c| c.observations.as_slice()).collect();
        let observations = stack_observations(&per_chain, n_steps)?;

        Ok(Self {
            parameter_names,
            pars,
            density,
            initial,
            observations,
            details: chains.iter().map(|c| c.details.clone()).collect(),
            restart: chains.into_iter().map(|c| c.last).collect(),
        })
    }

    pub fn chains(&self) -> usize {
        self.pars.shape()[2]
    }

    pub fn n_steps(&self) -> usize {
        self.pars.shape()[1]
    }

    /// Draws of every chain side by side as `parameter × (chain, step)`.
    pub fn pars_flat(&self) -> Array2<f64> {
        let n_steps = self.n_steps();
        let n = n_steps * self.chains();
        Array2::from_shape_fn((self.parameter_names.len(), n), |(p, k)| {
            self.pars[[p, k % n_steps, k / n_steps]]
        })
    }

    /// Final position of each chain, usable as the initial points of a
    /// continuation run.
    pub fn restart(&self) -> &[Vec<f64>] {
        &self.restart
    }

    /// Drop the first `burnin` steps, then keep every `thinning`-th step.
    pub fn thin(&self, burnin: usize, thinning: usize) -> Result<Samples> {
        if thinning == 0 {
            return Err(MontyError::invalid("thinning must be at least 1"));
        }
        if burnin >= self.n_steps() {
            return Err(MontyError::invalid(format!(
                "burnin ({burnin}) leaves no samples out of {} steps",
                self.n_steps()
            )));
        }
        let slice = Slice::new(burnin as isize, None, thinning as isize);
        let observations = self
            .observations
            .iter()
            .map(|(k, v)| {
                let step_axis = Axis(v.ndim() - 2);
                (k.clone(), v.slice_axis(step_axis, slice).to_owned())
            })
            .collect();
        Ok(Samples {
            parameter_names: self.parameter_names.clone(),
            pars: self.pars.slice_axis(Axis(1), slice).to_owned(),
            density: self.density.slice_axis(Axis(0), slice).to_owned(),
            initial: self.initial.clone(),
            observations,
            details: self.details.clone(),
            restart: self.restart.clone(),
        })
    }

    /// Join a continuation run (started from [`Samples::restart`]) onto the
    /// end of this one.
    pub fn append(&self, other: &Samples) -> Result<Samples> {
        if other.parameter_names != self.parameter_names {
            return Err(MontyError::invalid(
                "appended samples have different parameters",
            ));
        }
        if other.chains() != self.chains() {
            return Err(MontyError::shape("chains", self.chains(), other.chains()));
        }
        let join = |a: &ArrayD<f64>, b: &ArrayD<f64>| {
            let axis = Axis(a.ndim() - 2);
            concatenate(axis, &[a.view(), b.view()])
                .map_err(|e| MontyError::invalid(format!("cannot append observations: {e}")))
        };
        let mut observations = BTreeMap::new();
        for (key, value) in &self.observations {
            let more = other
                .observations
                .get(key)
                .ok_or_else(|| MontyError::UnknownName(key.clone()))?;
            observations.insert(key.clone(), join(value, more)?);
        }
        if let Some(key) = other.observations.keys().find(|k| !self.observations.contains_key(*k)) {
            return Err(MontyError::UnknownName(key.clone()));
        }

        let (n_a, n_b) = (self.n_steps() as f64, other.n_steps() as f64);
        let details = self
            .details
            .iter()
            .zip(&other.details)
            .map(|(a, b)| ChainDetails {
                acceptance_rate: (a.acceptance_rate * n_a + b.acceptance_rate * n_b) / (n_a + n_b),
                extra: b.extra.clone(),
            })
            .collect();

        Ok(Samples {
            parameter_names: self.parameter_names.clone(),
            pars: concatenate(Axis(1), &[self.pars.view(), other.pars.view()])
                .map_err(|e| MontyError::invalid(e.to_string()))?,
            density: concatenate(Axis(0), &[self.density.view(), other.density.view()])
                .map_err(|e| MontyError::invalid(e.to_string()))?,
            initial: self.initial.clone(),
            observations,
            details,
            restart: other.restart.clone(),
        })
    }
}

/// Stack per-step observer payloads into `payload × step × chain` arrays.
fn stack_observations(
    chains: &[&[Option<Observation>]],
    n_steps: usize,
) -> Result<BTreeMap<String, ArrayD<f64>>> {
    let mut shapes: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for obs in chains.iter().flat_map(|c| c.iter()).flatten() {
        for (key, value) in obs {
            shapes
                .entry(key.clone())
                .or_insert_with(|| value.shape().to_vec());
        }
    }

    let n_chains = chains.len();
    let mut out = BTreeMap::new();
    for (key, payload) in shapes {
        let mut shape = payload.clone();
        shape.extend([n_steps, n_chains]);
        let nd = shape.len();
        let mut arr = ArrayD::<f64>::from_elem(IxDyn(&shape), f64::NAN);
        for (c, steps) in chains.iter().enumerate() {
            let mut chain_view = arr.index_axis_mut(Axis(nd - 1), c);
            for (s, obs) in steps.iter().enumerate() {
                let Some(value) = obs.as_ref().and_then(|o| o.get(&key)) else {
                    continue;
                };
                if value.shape() != payload.as_slice() {
                    return Err(MontyError::shape(
                        format!("observation '{key}' size"),
                        payload.iter().product(),
                        value.len(),
                    ));
                }
                chain_view.index_axis_mut(Axis(nd - 2), s).assign(value);
            }
        }
        out.insert(key, arr);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2, Array1};

    fn output(offset: f64, n: usize, observe: bool) -> ChainOutput {
        let pars = Array2::from_shape_fn((2, n), |(p, s)| offset + (10 * p + s) as f64);
        let observations = (0..n)
            .map(|s| {
                observe.then(|| {
                    let mut o = Observation::new();
                    o.insert("state".into(), arr1(&[s as f64, offset]).into_dyn());
                    o
                })
            })
            .collect();
        ChainOutput {
            pars,
            density: (0..n).map(|s| -(s as f64)).collect(),
            observations,
            initial: vec![offset, offset],
            last: vec![offset + (n - 1) as f64, offset + (10 + n - 1) as f64],
            details: ChainDetails {
                acceptance_rate: 0.5,
                extra: BTreeMap::new(),
            },
        }
    }

    fn samples(n: usize) -> Samples {
        let names = vec!["a".to_string(), "b".to_string()];
        Samples::from_chains(names, vec![output(0.0, n, true), output(100.0, n, true)]).unwrap()
    }

    #[test]
    fn layout_is_parameter_step_chain() {
        let s = samples(4);
        assert_eq!(s.pars.shape(), &[2, 4, 2]);
        assert_eq!(s.pars[[1, 3, 1]], 113.0);
        assert_eq!(s.density.shape(), &[4, 2]);
        assert_eq!(s.initial, arr2(&[[0.0, 100.0], [0.0, 100.0]]));
        assert_eq!(s.observations["state"].shape(), &[2, 4, 2]);
        assert_eq!(s.observations["state"][[0, 2, 1]], 2.0);
        assert_eq!(s.restart()[1], vec![103.0, 113.0]);
    }

    #[test]
    fn missing_observations_are_nan() {
        let names = vec!["a".to_string(), "b".to_string()];
        let s = Samples::from_chains(names, vec![output(0.0, 3, true), output(1.0, 3, false)]).unwrap();
        let obs = &s.observations["state"];
        assert_eq!(obs[[0, 1, 0]], 1.0);
        assert!(obs[[0, 1, 1]].is_nan());
    }

    #[test]
    fn thinning() {
        let s = samples(10).thin(3, 2).unwrap();
        assert_eq!(s.n_steps(), 4);
        let kept: Array1<f64> = s.pars.slice(ndarray::s![0, .., 0]).to_owned();
        assert_eq!(kept, arr1(&[3.0, 5.0, 7.0, 9.0]));
        assert_eq!(s.observations["state"].shape(), &[2, 4, 2]);
        assert_eq!(s.observations["state"][[0, 1, 0]], 5.0);
        assert!(samples(10).thin(10, 1).is_err());
        assert!(samples(10).thin(0, 0).is_err());
    }

    #[test]
    fn flat_draws_concatenate_chains() {
        let flat = samples(3).pars_flat();
        assert_eq!(flat.shape(), &[2, 6]);
        assert_eq!(flat.row(0).to_vec(), vec![0.0, 1.0, 2.0, 100.0, 101.0, 102.0]);
    }

    #[test]
    fn append_joins_along_steps() {
        let a = samples(3);
        let b = samples(2);
        let joined = a.append(&b).unwrap();
        assert_eq!(joined.n_steps(), 5);
        assert_eq!(joined.observations["state"].shape(), &[2, 5, 2]);
        assert_eq!(joined.restart(), b.restart());
        assert_eq!(joined.initial, a.initial);
        let one_chain = Samples::from_chains(
            vec!["a".to_string(), "b".to_string()],
            vec![output(0.0, 2, true)],
        )
        .unwrap();
        assert!(matches!(a.append(&one_chain), Err(MontyError::ShapeMismatch { .. })));
    }
}

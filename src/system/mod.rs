/*!
# Systems

A [`System`] is an executable instance of a compiled dynamical model: it holds
`n_groups × n_particles` independent copies of a fixed-length state vector,
one parameter set per group, the current time, and one random number stream
per particle.

Models are supplied by implementing [`Generator`]. The crate never parses model
source; a generator only has to expose the state layout, the initial
conditions, and either a discrete-time `update` or a continuous-time `rhs`,
plus optionally a per-stream `compare` used by the particle filter.

## Discrete-time ordering

Each step `t0 → t0 + dt`:

1. components declared with [`Generator::zero_every`] are zeroed if `t0` is a
   multiple of their period;
2. `update` reads the old state (and any time-varying inputs at `t0`) and
   writes the new state into a separate buffer, so there is no
   read-after-write inside a step;
3. time advances to `t0 + dt`.

Comparison against a data record at `t0 + dt` happens afterwards, through
[`System::compare_data`], using the new state and the new time.

# Example

```rust
use mini_monty::params::Parameters;
use mini_monty::rng::RngStream;
use mini_monty::system::{Generator, System, SystemOptions};
use mini_monty::error::Result;

struct Growth;

impl Generator for Growth {
    fn state_names(&self) -> Vec<String> {
        vec!["x".into()]
    }
    fn initial(&self, _t: f64, _p: &Parameters, _rng: &mut RngStream, state: &mut [f64]) -> Result<()> {
        state[0] = 1.0;
        Ok(())
    }
    fn update(&self, _t: f64, dt: f64, state: &[f64], p: &Parameters, _rng: &mut RngStream, next: &mut [f64]) -> Result<()> {
        next[0] = state[0] * (1.0 + p.scalar("r")? * dt);
        Ok(())
    }
}

let pars = Parameters::new().with("r", 0.1);
let mut sys = System::new(Growth, &[pars], SystemOptions::default()).unwrap();
sys.set_state_initial().unwrap();
sys.step_to(2.0).unwrap();
assert!((sys.state()[0] - 1.21).abs() < 1e-12);
```
*/

pub mod ode;

use std::sync::Arc;

use ndarray::Array3;
use rayon::prelude::*;

use crate::data::DataRecord;
use crate::error::{MontyError, Result};
use crate::params::Parameters;
use crate::rng::{RngStream, RngStreams};

pub use ode::OdeControl;
use ode::OdeSolver;

/// How a model moves through time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeKind {
    /// Fixed-step update rule.
    Discrete,
    /// Derivative function integrated with an adaptive stepper.
    Continuous,
}

/// A compiled model definition.
///
/// Discrete-time models override [`Generator::update`]; continuous-time
/// models return [`TimeKind::Continuous`] from [`Generator::time_kind`] and
/// override [`Generator::rhs`].
pub trait Generator: Send + Sync {
    /// Ordered names of the state components; fixes the state length.
    fn state_names(&self) -> Vec<String>;

    /// Names of the parameters the model reads. Informational only.
    fn parameter_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn time_kind(&self) -> TimeKind {
        TimeKind::Discrete
    }

    /// Write initial conditions at `time` into `state`.
    fn initial(
        &self,
        time: f64,
        pars: &Parameters,
        rng: &mut RngStream,
        state: &mut [f64],
    ) -> Result<()>;

    /// Compute the state at `time + dt` from the state at `time`.
    fn update(
        &self,
        _time: f64,
        _dt: f64,
        state: &[f64],
        _pars: &Parameters,
        _rng: &mut RngStream,
        state_next: &mut [f64],
    ) -> Result<()> {
        state_next.copy_from_slice(state);
        Ok(())
    }

    /// Time derivative of the state at `time`.
    fn rhs(
        &self,
        _time: f64,
        _state: &[f64],
        _pars: &Parameters,
        dstate_dt: &mut [f64],
    ) -> Result<()> {
        dstate_dt.fill(0.0);
        Ok(())
    }

    /// State components forced to zero at the start of any step whose time is
    /// a multiple of the given period, as `(index, period)` pairs.
    fn zero_every(&self) -> Vec<(usize, f64)> {
        Vec::new()
    }

    /// Names of the data streams this model can be compared against. An
    /// empty list means the model has no observation model.
    fn data_streams(&self) -> Vec<String> {
        Vec::new()
    }

    /// Log-density of `observed` on `stream` given the current state.
    fn compare(
        &self,
        _time: f64,
        _state: &[f64],
        _stream: &str,
        _observed: f64,
        _pars: &Parameters,
        _rng: &mut RngStream,
    ) -> Result<f64> {
        Ok(0.0)
    }
}

impl<G: Generator + ?Sized> Generator for Arc<G> {
    fn state_names(&self) -> Vec<String> {
        (**self).state_names()
    }
    fn parameter_names(&self) -> Vec<String> {
        (**self).parameter_names()
    }
    fn time_kind(&self) -> TimeKind {
        (**self).time_kind()
    }
    fn initial(&self, time: f64, pars: &Parameters, rng: &mut RngStream, state: &mut [f64]) -> Result<()> {
        (**self).initial(time, pars, rng, state)
    }
    fn update(
        &self,
        time: f64,
        dt: f64,
        state: &[f64],
        pars: &Parameters,
        rng: &mut RngStream,
        state_next: &mut [f64],
    ) -> Result<()> {
        (**self).update(time, dt, state, pars, rng, state_next)
    }
    fn rhs(&self, time: f64, state: &[f64], pars: &Parameters, dstate_dt: &mut [f64]) -> Result<()> {
        (**self).rhs(time, state, pars, dstate_dt)
    }
    fn zero_every(&self) -> Vec<(usize, f64)> {
        (**self).zero_every()
    }
    fn data_streams(&self) -> Vec<String> {
        (**self).data_streams()
    }
    fn compare(
        &self,
        time: f64,
        state: &[f64],
        stream: &str,
        observed: f64,
        pars: &Parameters,
        rng: &mut RngStream,
    ) -> Result<f64> {
        (**self).compare(time, state, stream, observed, pars, rng)
    }
}

/// Construction options for a [`System`].
#[derive(Debug, Clone, PartialEq)]
pub struct SystemOptions {
    pub n_particles: usize,
    /// Number of parameter groups; defaults to the number of parameter sets.
    pub n_groups: Option<usize>,
    pub time: f64,
    /// Step size for discrete-time models.
    pub dt: f64,
    pub seed: u64,
    pub ode: OdeControl,
}

impl Default for SystemOptions {
    fn default() -> Self {
        Self {
            n_particles: 1,
            n_groups: None,
            time: 0.0,
            dt: 1.0,
            seed: 0,
            ode: OdeControl::default(),
        }
    }
}

impl SystemOptions {
    pub fn with_particles(mut self, n_particles: usize) -> Self {
        self.n_particles = n_particles;
        self
    }

    pub fn with_groups(mut self, n_groups: usize) -> Self {
        self.n_groups = Some(n_groups);
        self
    }

    pub fn with_time(mut self, time: f64) -> Self {
        self.time = time;
        self
    }

    pub fn with_dt(mut self, dt: f64) -> Self {
        self.dt = dt;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_ode(mut self, ode: OdeControl) -> Self {
        self.ode = ode;
        self
    }
}

/// Particle-parallel simulation of one model.
pub struct System<G: Generator> {
    generator: G,
    state_names: Vec<String>,
    n_state: usize,
    n_particles: usize,
    n_groups: usize,
    pars: Vec<Parameters>,
    /// Particle-major: particle `k` occupies `k * n_state .. (k + 1) * n_state`.
    state: Vec<f64>,
    time: f64,
    dt: f64,
    rngs: Vec<RngStream>,
    zero_every: Vec<(usize, f64)>,
    ode: OdeControl,
    solvers: Vec<OdeSolver>,
}

impl<G: Generator> System<G> {
    /// Create a system. `pars` is either a single parameter set shared by all
    /// groups or one set per group.
    pub fn new(generator: G, pars: &[Parameters], options: SystemOptions) -> Result<Self> {
        if options.n_particles == 0 {
            return Err(MontyError::invalid("n_particles must be at least 1"));
        }
        if pars.is_empty() {
            return Err(MontyError::invalid("at least one parameter set is required"));
        }
        let n_groups = options.n_groups.unwrap_or(pars.len());
        if n_groups == 0 {
            return Err(MontyError::invalid("n_groups must be at least 1"));
        }
        let pars = fan_out(pars, n_groups)?;
        if !options.time.is_finite() {
            return Err(MontyError::invalid("initial time must be finite"));
        }
        let kind = generator.time_kind();
        if kind == TimeKind::Discrete && !(options.dt > 0.0 && options.dt.is_finite()) {
            return Err(MontyError::invalid(format!("dt must be positive, got {}", options.dt)));
        }
        if kind == TimeKind::Continuous {
            options.ode.validate()?;
        }

        let state_names = generator.state_names();
        let n_state = state_names.len();
        let zero_every = generator.zero_every();
        for &(i, period) in &zero_every {
            if i >= n_state {
                return Err(MontyError::invalid(format!(
                    "zero_every index {i} out of range for state of length {n_state}"
                )));
            }
            if !(period > 0.0) {
                return Err(MontyError::invalid("zero_every period must be positive"));
            }
        }

        let n_total = options.n_particles * n_groups;
        let rngs = RngStreams::new(options.seed, n_total)?.into_vec();
        let solvers = match kind {
            TimeKind::Continuous => (0..n_total).map(|_| OdeSolver::new(n_state)).collect(),
            TimeKind::Discrete => Vec::new(),
        };

        Ok(Self {
            generator,
            state_names,
            n_state,
            n_particles: options.n_particles,
            n_groups,
            pars,
            state: vec![0.0; n_total * n_state],
            time: options.time,
            dt: options.dt,
            rngs,
            zero_every,
            ode: options.ode,
            solvers,
        })
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub fn n_state(&self) -> usize {
        self.n_state
    }

    pub fn n_particles(&self) -> usize {
        self.n_particles
    }

    pub fn n_groups(&self) -> usize {
        self.n_groups
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn state_names(&self) -> &[String] {
        &self.state_names
    }

    /// Index of a state component by name.
    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.state_names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| MontyError::UnknownName(name.to_string()))
    }

    pub fn parameters(&self) -> &[Parameters] {
        &self.pars
    }

    /// Flat particle-major state of all particles in all groups.
    pub fn state(&self) -> &[f64] {
        &self.state
    }

    /// State of one particle in one group.
    pub fn particle_state(&self, group: usize, particle: usize) -> &[f64] {
        let k = group * self.n_particles + particle;
        &self.state[k * self.n_state..(k + 1) * self.n_state]
    }

    /// State as a `state × particle × group` array.
    pub fn state_array(&self) -> Array3<f64> {
        Array3::from_shape_fn((self.n_state, self.n_particles, self.n_groups), |(i, p, g)| {
            self.state[(g * self.n_particles + p) * self.n_state + i]
        })
    }

    /// Overwrite the state. `values` may hold one state vector (copied to
    /// every particle) or one per particle. Time is not changed.
    pub fn set_state(&mut self, values: &[f64]) -> Result<()> {
        let n = self.n_state;
        if values.len() == n {
            self.state.par_chunks_mut(n).for_each(|s| s.copy_from_slice(values));
        } else if values.len() == self.state.len() {
            self.state.copy_from_slice(values);
        } else {
            return Err(MontyError::shape("state", self.state.len(), values.len()));
        }
        self.reset_solvers();
        Ok(())
    }

    /// Reset every particle to the model's initial conditions at the current
    /// time. Time is not changed.
    pub fn set_state_initial(&mut self) -> Result<()> {
        let (n, np, time) = (self.n_state, self.n_particles, self.time);
        let generator = &self.generator;
        let pars = &self.pars;
        self.state
            .par_chunks_mut(n)
            .zip(self.rngs.par_iter_mut())
            .enumerate()
            .try_for_each(|(k, (state, rng))| generator.initial(time, &pars[k / np], rng, state))?;
        self.reset_solvers();
        Ok(())
    }

    /// Set the current time without touching the state; rewinding is allowed.
    pub fn set_time(&mut self, time: f64) -> Result<()> {
        if !time.is_finite() {
            return Err(MontyError::invalid("time must be finite"));
        }
        self.time = time;
        self.reset_solvers();
        Ok(())
    }

    /// Merge new values into the existing parameter sets, either one set for
    /// all groups or one per group.
    pub fn update_parameters(&mut self, pars: &[Parameters]) -> Result<()> {
        let pars = fan_out(pars, self.n_groups)?;
        for (old, new) in self.pars.iter_mut().zip(&pars) {
            old.merge(new);
        }
        self.reset_solvers();
        Ok(())
    }

    /// Replace the parameter sets outright.
    pub fn set_parameters(&mut self, pars: &[Parameters]) -> Result<()> {
        self.pars = fan_out(pars, self.n_groups)?;
        self.reset_solvers();
        Ok(())
    }

    /// Replace the random number streams, e.g. to rerun reproducibly.
    pub fn set_rng_seed(&mut self, seed: u64) -> Result<()> {
        self.rngs = RngStreams::new(seed, self.rngs.len())?.into_vec();
        Ok(())
    }

    /// Advance every particle to `time`.
    ///
    /// Discrete systems apply `ceil((time - now) / dt)` updates; continuous
    /// systems integrate exactly to `time`.
    pub fn step_to(&mut self, time: f64) -> Result<()> {
        if time < self.time || !time.is_finite() {
            return Err(MontyError::TimeOrder {
                requested: time,
                current: self.time,
            });
        }
        match self.generator.time_kind() {
            TimeKind::Discrete => self.run_discrete(time),
            TimeKind::Continuous => self.run_continuous(time),
        }
    }

    fn run_discrete(&mut self, time: f64) -> Result<()> {
        // Tolerate rounding so that t0 + k * dt lands on k steps.
        let n_steps = ((time - self.time) / self.dt - 1e-8).ceil().max(0.0) as usize;
        if n_steps == 0 {
            return Ok(());
        }
        let (n, np, t0, dt) = (self.n_state, self.n_particles, self.time, self.dt);
        let generator = &self.generator;
        let pars = &self.pars;
        let zero_every = &self.zero_every;
        self.state
            .par_chunks_mut(n)
            .zip(self.rngs.par_iter_mut())
            .enumerate()
            .try_for_each(|(k, (state, rng))| {
                let p = &pars[k / np];
                let mut next = vec![0.0; n];
                for step in 0..n_steps {
                    let t = t0 + step as f64 * dt;
                    for &(i, period) in zero_every {
                        if is_multiple(t, period) {
                            state[i] = 0.0;
                        }
                    }
                    generator.update(t, dt, state, p, rng, &mut next)?;
                    state.copy_from_slice(&next);
                }
                Ok::<(), MontyError>(())
            })?;
        self.time = t0 + n_steps as f64 * dt;
        Ok(())
    }

    fn run_continuous(&mut self, time: f64) -> Result<()> {
        if time == self.time {
            return Ok(());
        }
        let (n, np, t0) = (self.n_state, self.n_particles, self.time);
        let generator = &self.generator;
        let pars = &self.pars;
        let control = &self.ode;
        self.state
            .par_chunks_mut(n)
            .zip(self.solvers.par_iter_mut())
            .enumerate()
            .try_for_each(|(k, (state, solver))| {
                let p = &pars[k / np];
                let rhs = |t: f64, y: &[f64], dy: &mut [f64]| generator.rhs(t, y, p, dy);
                solver.integrate(&rhs, t0, time, state, control)
            })?;
        self.time = time;
        Ok(())
    }

    /// Run forward and record the state at each of `times`, returning a
    /// `state × particle × time` array. `index` restricts which state
    /// components are kept.
    pub fn simulate(&mut self, times: &[f64], index: Option<&[usize]>) -> Result<Array3<f64>> {
        check_times(self.time, times)?;
        let index: Vec<usize> = match index {
            Some(idx) => {
                if let Some(&bad) = idx.iter().find(|&&i| i >= self.n_state) {
                    return Err(MontyError::invalid(format!(
                        "state index {bad} out of range for state of length {}",
                        self.n_state
                    )));
                }
                idx.to_vec()
            }
            None => (0..self.n_state).collect(),
        };
        let n_total = self.n_particles * self.n_groups;
        let mut out = Array3::<f64>::zeros((index.len(), n_total, times.len()));
        for (j, &t) in times.iter().enumerate() {
            self.step_to(t)?;
            for k in 0..n_total {
                let s = &self.state[k * self.n_state..(k + 1) * self.n_state];
                for (r, &i) in index.iter().enumerate() {
                    out[[r, k, j]] = s[i];
                }
            }
        }
        Ok(out)
    }

    /// Per-particle observation log-density for `record`, summed over the
    /// streams observed in the record; missing streams are skipped.
    pub fn compare_data(&mut self, record: &DataRecord) -> Result<Vec<f64>> {
        let (n, np, time) = (self.n_state, self.n_particles, self.time);
        let generator = &self.generator;
        let pars = &self.pars;
        let observed: Vec<(&str, f64)> = record.observed().collect();
        self.state
            .par_chunks(n)
            .zip(self.rngs.par_iter_mut())
            .enumerate()
            .map(|(k, (state, rng))| {
                let p = &pars[k / np];
                observed.iter().try_fold(0.0, |acc, &(stream, value)| {
                    Ok::<f64, MontyError>(acc + generator.compare(time, state, stream, value, p, rng)?)
                })
            })
            .collect()
    }

    /// Reorder particle states: particle `k` takes the state previously held
    /// by particle `index[k]`. Random number streams stay with their slots.
    pub fn reorder(&mut self, index: &[usize]) -> Result<()> {
        let n_total = self.n_particles * self.n_groups;
        if index.len() != n_total {
            return Err(MontyError::shape("particle index", n_total, index.len()));
        }
        if let Some(&bad) = index.iter().find(|&&i| i >= n_total) {
            return Err(MontyError::invalid(format!("particle index {bad} out of range")));
        }
        let n = self.n_state;
        let old = self.state.clone();
        self.state
            .par_chunks_mut(n)
            .zip(index.par_iter())
            .for_each(|(s, &from)| s.copy_from_slice(&old[from * n..(from + 1) * n]));
        self.reset_solvers();
        Ok(())
    }

    fn reset_solvers(&mut self) {
        self.solvers.iter_mut().for_each(OdeSolver::reset);
    }
}

fn fan_out(pars: &[Parameters], n_groups: usize) -> Result<Vec<Parameters>> {
    match pars.len() {
        1 => Ok(vec![pars[0].clone(); n_groups]),
        n if n == n_groups => Ok(pars.to_vec()),
        n => Err(MontyError::shape("parameter sets", n_groups, n)),
    }
}

fn is_multiple(t: f64, period: f64) -> bool {
    let r = t / period;
    (r - r.round()).abs() < 1e-8
}

pub(crate) fn check_times(now: f64, times: &[f64]) -> Result<()> {
    let mut previous = None;
    for &t in times {
        let ok = match previous {
            None => t >= now,
            Some(p) => t > p,
        };
        if !ok || !t.is_finite() {
            return Err(MontyError::TimeOrder {
                requested: t,
                current: previous.unwrap_or(now),
            });
        }
        previous = Some(t);
    }
    Ok(())
}

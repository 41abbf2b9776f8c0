/*!
# Bootstrap Particle Filter

Runs `n_particles` realisations of a [`System`] through a series of
observations, weighting each particle by its observation log-density at every
data time and resampling with a single systematic draw. The result of a run
is an unbiased estimate of the marginal likelihood, returned on the log scale.

For each record the filter

1. steps every particle to the record time,
2. evaluates the per-particle log-density via [`System::compare_data`],
3. accumulates `max + ln(mean(exp(w - max)))` into the running log-likelihood,
4. draws resampling indices proportional to `exp(w - max)` using one uniform
   from a stream reserved for resampling, and
5. reorders the particles (and records the ancestry when history is kept).

A record where every stream is missing carries no information, so no
weighting or resampling happens for it. If every particle has zero likelihood
at some record, the run stops and returns `-inf`.

Trajectories, the final state and snapshots are recorded only if enabled in
[`FilterOptions`]; trajectories and snapshots are reconstructed after the run
by replaying the ancestry backwards so that only lineages surviving to the end
are reported.

# Example

```rust
use mini_monty::data::ObservationData;
use mini_monty::error::Result;
use mini_monty::filter::{FilterOptions, ParticleFilter};
use mini_monty::params::Parameters;
use mini_monty::rng::RngStream;
use mini_monty::system::Generator;

/// Gaussian random walk observed with noise.
struct Walk;

impl Generator for Walk {
    fn state_names(&self) -> Vec<String> {
        vec!["x".into()]
    }
    fn initial(&self, _t: f64, _p: &Parameters, _rng: &mut RngStream, s: &mut [f64]) -> Result<()> {
        s[0] = 0.0;
        Ok(())
    }
    fn update(&self, _t: f64, _dt: f64, s: &[f64], p: &Parameters, rng: &mut RngStream, next: &mut [f64]) -> Result<()> {
        next[0] = s[0] + rng.normal(0.0, p.scalar("sd")?)?;
        Ok(())
    }
    fn data_streams(&self) -> Vec<String> {
        vec!["y".into()]
    }
    fn compare(&self, _t: f64, s: &[f64], _stream: &str, y: f64, _p: &Parameters, _rng: &mut RngStream) -> Result<f64> {
        Ok(-0.5 * (y - s[0]).powi(2))
    }
}

let data = ObservationData::from_columns(0.0, &[1.0, 2.0, 3.0], &[("y", vec![0.1, 0.4, 0.2])]).unwrap();
let options = FilterOptions::default().with_particles(100).with_trajectories(true);
let mut filter = ParticleFilter::new(Walk, data, options.set_seed(42)).unwrap();
let ll = filter.run(&Parameters::new().with("sd", 0.5)).unwrap();
assert!(ll.is_finite());
assert_eq!(filter.last_trajectories().unwrap().shape(), &[1, 100, 3]);
```
*/

use std::sync::Arc;

use ndarray::{Array2, Array3};

use crate::data::ObservationData;
use crate::error::{MontyError, Result};
use crate::params::Parameters;
use crate::rng::RngStream;
use crate::system::{Generator, OdeControl, System, SystemOptions};

/// Configuration of a [`ParticleFilter`]. Artifacts must be enabled here,
/// before the filter runs.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterOptions {
    pub n_particles: usize,
    /// Step size for discrete-time models.
    pub dt: f64,
    pub seed: u64,
    pub save_trajectories: bool,
    /// State components kept in trajectories; all when `None`.
    pub trajectory_index: Option<Vec<usize>>,
    pub save_state: bool,
    /// Data times at which the full state is captured.
    pub save_snapshots: Vec<f64>,
    /// Restart every run from the same random streams.
    pub reproducible: bool,
    pub ode: OdeControl,
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self {
            n_particles: 100,
            dt: 1.0,
            seed: 0,
            save_trajectories: false,
            trajectory_index: None,
            save_state: false,
            save_snapshots: Vec::new(),
            reproducible: false,
            ode: OdeControl::default(),
        }
    }
}

impl FilterOptions {
    pub fn with_particles(mut self, n_particles: usize) -> Self {
        self.n_particles = n_particles;
        self
    }

    pub fn with_dt(mut self, dt: f64) -> Self {
        self.dt = dt;
        self
    }

    pub fn with_trajectories(mut self, save: bool) -> Self {
        self.save_trajectories = save;
        self
    }

    pub fn with_trajectory_index(mut self, index: Vec<usize>) -> Self {
        self.save_trajectories = true;
        self.trajectory_index = Some(index);
        self
    }

    pub fn with_state(mut self, save: bool) -> Self {
        self.save_state = save;
        self
    }

    pub fn with_snapshots(mut self, times: Vec<f64>) -> Self {
        self.save_snapshots = times;
        self
    }

    pub fn with_reproducible(mut self, reproducible: bool) -> Self {
        self.reproducible = reproducible;
        self
    }

    pub fn with_ode(mut self, ode: OdeControl) -> Self {
        self.ode = ode;
        self
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Everything recorded by the most recent run.
#[derive(Debug, Clone, Default)]
struct History {
    /// Post-resampling saved state at each data time, particle-major.
    states: Vec<Vec<f64>>,
    /// Resampling indices at each data time.
    ancestry: Vec<Vec<usize>>,
    /// Post-resampling full state at the snapshot times, particle-major.
    snapshots: Vec<(usize, Vec<f64>)>,
}

pub struct ParticleFilter<G: Generator> {
    generator: Arc<G>,
    data: ObservationData,
    options: FilterOptions,
    n_state: usize,
    trajectory_index: Vec<usize>,
    /// Record position of each snapshot time.
    snapshot_records: Vec<usize>,
    system: Option<System<Arc<G>>>,
    resample_rng: RngStream,
    increments: Vec<f64>,
    trajectories: Option<Array3<f64>>,
    snapshots: Option<Array3<f64>>,
    state: Option<Array2<f64>>,
    degenerate_at: Option<f64>,
    has_run: bool,
}

impl<G: Generator> ParticleFilter<G> {
    pub fn new(generator: G, data: ObservationData, options: FilterOptions) -> Result<Self> {
        Self::from_shared(Arc::new(generator), data, options)
    }

    /// Create a filter over a generator shared with other filters.
    pub fn from_shared(generator: Arc<G>, data: ObservationData, options: FilterOptions) -> Result<Self> {
        if options.n_particles == 0 {
            return Err(MontyError::invalid("n_particles must be at least 1"));
        }
        let streams = generator.data_streams();
        if streams.is_empty() {
            return Err(MontyError::MissingCapability("comparison to data"));
        }
        for record in data.records() {
            if let Some(unknown) = record.streams().find(|s| !streams.iter().any(|d| d.as_str() == *s)) {
                return Err(MontyError::UnknownName(unknown.to_string()));
            }
        }

        let n_state = generator.state_names().len();
        let trajectory_index = match &options.trajectory_index {
            Some(index) => {
                if let Some(&bad) = index.iter().find(|&&i| i >= n_state) {
                    return Err(MontyError::invalid(format!(
                        "trajectory index {bad} out of range for state of length {n_state}"
                    )));
                }
                index.clone()
            }
            None => (0..n_state).collect(),
        };

        let times = data.times();
        let mut snapshot_records = Vec::with_capacity(options.save_snapshots.len());
        for &t in &options.save_snapshots {
            let pos = times.iter().position(|&d| d == t).ok_or_else(|| {
                MontyError::invalid(format!("snapshot time {t} is not a data time"))
            })?;
            if snapshot_records.last().is_some_and(|&last| pos <= last) {
                return Err(MontyError::TimeOrder {
                    requested: t,
                    current: times[snapshot_records[snapshot_records.len() - 1]],
                });
            }
            snapshot_records.push(pos);
        }

        let resample_rng = RngStream::new(options.seed, options.n_particles as u64);
        Ok(Self {
            generator,
            data,
            options,
            n_state,
            trajectory_index,
            snapshot_records,
            system: None,
            resample_rng,
            increments: Vec::new(),
            trajectories: None,
            snapshots: None,
            state: None,
            degenerate_at: None,
            has_run: false,
        })
    }

    /// An independent filter over the same generator and data, with its own
    /// random streams derived from `seed`.
    pub fn fork(&self, seed: u64) -> Result<Self> {
        let options = self.options.clone().set_seed(seed);
        Self::from_shared(Arc::clone(&self.generator), self.data.clone(), options)
    }

    pub fn options(&self) -> &FilterOptions {
        &self.options
    }

    pub fn data(&self) -> &ObservationData {
        &self.data
    }

    pub fn n_particles(&self) -> usize {
        self.options.n_particles
    }

    pub fn n_state(&self) -> usize {
        self.n_state
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    /// State components kept in saved trajectories.
    pub fn trajectory_index(&self) -> &[usize] {
        &self.trajectory_index
    }

    fn prepare_system(&mut self, pars: &Parameters) -> Result<&mut System<Arc<G>>> {
        let pars = std::slice::from_ref(pars);
        match &mut self.system {
            Some(system) => {
                system.set_parameters(pars)?;
                if self.options.reproducible {
                    system.set_rng_seed(self.options.seed)?;
                    self.resample_rng =
                        RngStream::new(self.options.seed, self.options.n_particles as u64);
                }
            }
            None => {
                let sys_options = SystemOptions::default()
                    .with_particles(self.options.n_particles)
                    .with_time(self.data.time_start())
                    .with_dt(self.options.dt)
                    .with_seed(self.options.seed)
                    .with_ode(self.options.ode.clone());
                self.system = Some(System::new(Arc::clone(&self.generator), pars, sys_options)?);
            }
        }
        self.system
            .as_mut()
            .ok_or_else(|| MontyError::invalid("system was not created"))
    }

    /// Run the filter at `pars` and return the log marginal likelihood
    /// estimate, `-inf` if the filter degenerated.
    pub fn run(&mut self, pars: &Parameters) -> Result<f64> {
        self.has_run = false;
        self.trajectories = None;
        self.snapshots = None;
        self.state = None;
        self.degenerate_at = None;
        self.increments.clear();

        let n = self.options.n_particles;
        let n_state = self.n_state;
        let save_trajectories = self.options.save_trajectories;
        let keep_history = save_trajectories || !self.snapshot_records.is_empty();
        let time_start = self.data.time_start();
        let records = self.data.records().to_vec();

        let mut history = History::default();
        let mut next_snapshot = 0;
        let mut ll = 0.0;
        let mut weights = vec![0.0; n];

        {
            let system = self.prepare_system(pars)?;
            system.set_time(time_start)?;
            system.set_state_initial()?;
        }

        for (r, record) in records.iter().enumerate() {
            let system = self.prepare_existing()?;
            system.step_to(record.time)?;

            let index: Vec<usize> = if record.is_empty() {
                self.increments.push(0.0);
                (0..n).collect()
            } else {
                let mut log_w = system.compare_data(record)?;
                for w in log_w.iter_mut() {
                    if w.is_nan() {
                        *w = f64::NEG_INFINITY;
                    }
                }
                let max = log_w.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                if max == f64::NEG_INFINITY {
                    log::warn!(
                        "all {n} particles have zero likelihood at time {}; returning -inf",
                        record.time
                    );
                    self.increments.push(f64::NEG_INFINITY);
                    self.degenerate_at = Some(record.time);
                    self.has_run = true;
                    return Ok(f64::NEG_INFINITY);
                }
                for (w, lw) in weights.iter_mut().zip(&log_w) {
                    *w = (lw - max).exp();
                }
                let increment = max + (weights.iter().sum::<f64>() / n as f64).ln();
                self.increments.push(increment);
                ll += increment;

                let sum_sq: f64 = weights.iter().map(|w| w * w).sum();
                log::trace!(
                    "resampling at time {}: effective sample size {:.1} of {n}",
                    record.time,
                    weights.iter().sum::<f64>().powi(2) / sum_sq
                );
                let u = self.resample_rng.random_real();
                let index = systematic_resample(&weights, u);
                let system = self.prepare_existing()?;
                system.reorder(&index)?;
                index
            };

            if keep_history {
                let state = self.current_state()?;
                if save_trajectories {
                    let mut saved = Vec::with_capacity(n * self.trajectory_index.len());
                    for s in state.chunks(n_state) {
                        saved.extend(self.trajectory_index.iter().map(|&i| s[i]));
                    }
                    history.states.push(saved);
                }
                if self.snapshot_records.get(next_snapshot) == Some(&r) {
                    history.snapshots.push((r, state.to_vec()));
                    next_snapshot += 1;
                }
                history.ancestry.push(index);
            }
        }
        log::debug!(
            "particle filter finished {} records with log-likelihood {ll}",
            records.len()
        );

        if keep_history {
            self.reconstruct(&history);
        }
        if self.options.save_state {
            let state = self.current_state()?;
            let state = Array2::from_shape_fn((n_state, n), |(i, p)| state[p * n_state + i]);
            self.state = Some(state);
        }
        self.has_run = true;
        Ok(ll)
    }

    fn prepare_existing(&mut self) -> Result<&mut System<Arc<G>>> {
        self.system
            .as_mut()
            .ok_or_else(|| MontyError::invalid("filter has not been initialised"))
    }

    fn current_state(&self) -> Result<&[f64]> {
        self.system
            .as_ref()
            .map(System::state)
            .ok_or_else(|| MontyError::invalid("filter has not been initialised"))
    }

    /// Trace surviving lineages back through the recorded ancestry.
    fn reconstruct(&mut self, history: &History) {
        let n = self.options.n_particles;
        let n_times = history.ancestry.len();
        let n_saved = self.trajectory_index.len();
        let n_state = self.n_state;

        let mut trajectories = if self.options.save_trajectories {
            Some(Array3::<f64>::zeros((n_saved, n, n_times)))
        } else {
            None
        };
        let mut snapshots = if history.snapshots.is_empty() {
            None
        } else {
            Some(Array3::<f64>::zeros((n_state, n, history.snapshots.len())))
        };

        let mut lineage: Vec<usize> = (0..n).collect();
        let mut snapshot = history.snapshots.len();
        for t in (0..n_times).rev() {
            if let Some(traj) = trajectories.as_mut() {
                let states = &history.states[t];
                for (p, &k) in lineage.iter().enumerate() {
                    for i in 0..n_saved {
                        traj[[i, p, t]] = states[k * n_saved + i];
                    }
                }
            }
            if let Some(snaps) = snapshots.as_mut() {
                if snapshot > 0 && history.snapshots[snapshot - 1].0 == t {
                    snapshot -= 1;
                    let states = &history.snapshots[snapshot].1;
                    for (p, &k) in lineage.iter().enumerate() {
                        for i in 0..n_state {
                            snaps[[i, p, snapshot]] = states[k * n_state + i];
                        }
                    }
                }
            }
            let ancestry = &history.ancestry[t];
            for k in lineage.iter_mut() {
                *k = ancestry[*k];
            }
        }
        self.trajectories = trajectories;
        self.snapshots = snapshots;
    }

    fn check_run(&self) -> Result<()> {
        if !self.has_run {
            return Err(MontyError::invalid("the filter has not been run"));
        }
        match self.degenerate_at {
            Some(time) => Err(MontyError::DegenerateFilter { time }),
            None => Ok(()),
        }
    }

    /// `Err(DegenerateFilter)` if the last run collapsed.
    pub fn last_status(&self) -> Result<()> {
        self.check_run()
    }

    /// Saved trajectories as `state × particle × time`.
    pub fn last_trajectories(&self) -> Result<&Array3<f64>> {
        if !self.options.save_trajectories {
            return Err(MontyError::ArtifactNotSaved("trajectories"));
        }
        self.check_run()?;
        self.trajectories
            .as_ref()
            .ok_or(MontyError::ArtifactNotSaved("trajectories"))
    }

    /// Final state as `state × particle`.
    pub fn last_state(&self) -> Result<&Array2<f64>> {
        if !self.options.save_state {
            return Err(MontyError::ArtifactNotSaved("final states"));
        }
        self.check_run()?;
        self.state.as_ref().ok_or(MontyError::ArtifactNotSaved("final states"))
    }

    /// Snapshots as `state × particle × snapshot`.
    pub fn last_snapshots(&self) -> Result<&Array3<f64>> {
        if self.options.save_snapshots.is_empty() {
            return Err(MontyError::ArtifactNotSaved("snapshots"));
        }
        self.check_run()?;
        self.snapshots.as_ref().ok_or(MontyError::ArtifactNotSaved("snapshots"))
    }

    /// Number of time points in the saved trajectories.
    pub fn last_history_len(&self) -> Result<usize> {
        Ok(self.last_trajectories()?.shape()[2])
    }

    /// Contribution of each data record to the last log-likelihood.
    pub fn last_log_likelihood_increments(&self) -> &[f64] {
        &self.increments
    }
}

/// Systematic resampling: one uniform `u` in `[0, 1)` places `n` evenly spaced
/// pointers on the cumulative weights. Weights need not be normalised.
pub(crate) fn systematic_resample(weights: &[f64], u: f64) -> Vec<usize> {
    let n = weights.len();
    let total: f64 = weights.iter().sum();
    let mut index = Vec::with_capacity(n);
    let mut j = 0;
    let mut cumulative = weights[0];
    for k in 0..n {
        let pointer = (u + k as f64) / n as f64 * total;
        while pointer >= cumulative && j + 1 < n {
            j += 1;
            cumulative += weights[j];
        }
        index.push(j);
    }
    index
}

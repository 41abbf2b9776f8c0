/*!
# Chains and the Multi-Chain Runner

Every chain moves through three phases: [`ChainPhase::Initializing`] picks a
starting point (explicit, validated against the model domain, or drawn from
the model with `direct_sample`) and evaluates the density there;
[`ChainPhase::Running`] applies one sampler step per iteration; and
[`ChainPhase::Finished`] holds the chain's output.

[`sample`] forks the model once per chain, gives chain `i` random stream `i`
of the root seed and runs all chains in parallel with `rayon`. Chains never
communicate while running. All argument checks happen before any chain
starts.

Density evaluations that produce `NaN`, or fail with a recoverable error
(see [`MontyError::is_recoverable`]), count as `-inf`: the proposal is rejected
and the run continues.

```rust
use mini_monty::core::{sample, SampleOptions};
use mini_monty::model::MontyModel;
use mini_monty::samplers::random_walk::RandomWalk;
use ndarray::arr2;

let model = MontyModel::from_fn(["a", "b"], |x: &[f64]| -0.5 * (x[0] * x[0] + x[1] * x[1]))
    .build()
    .unwrap();
let sampler = RandomWalk::new(arr2(&[[1.0, 0.0], [0.0, 1.0]])).unwrap();
let options = SampleOptions::default()
    .with_chains(2)
    .with_initial(vec![vec![0.0, 0.0]])
    .set_seed(42);
let samples = sample(&model, &sampler, 500, &options).unwrap();
assert_eq!(samples.pars.shape(), &[2, 500, 2]);
```
*/

use std::collections::BTreeMap;
use std::sync::mpsc::{self, Sender, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use ndarray::Array2;
use rayon::prelude::*;

use crate::error::{MontyError, Result};
use crate::model::{MontyModel, Observation};
use crate::rng::RngStream;
use crate::samples::{ChainDetails, Samples};
use crate::stats::{collect_rhat, max_skipnan, ChainStats, ChainTracker};

/// Where a chain is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainPhase {
    Initializing,
    Running,
    Finished,
}

/// Current position of a chain and the log-density there.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainState {
    pub pars: Vec<f64>,
    pub density: f64,
}

/// A Markov transition kernel over a [`MontyModel`].
///
/// The sampler value holds configuration only and is shared by every chain;
/// anything that changes while a chain runs (adapted covariances, cached
/// gradients, tempering rungs) lives in the per-chain `Aux`.
pub trait Sampler: Clone + Send + Sync {
    type Aux: Send;

    /// Reject a model this sampler cannot work with. Called once, before any
    /// chain is created.
    fn check(&self, model: &MontyModel) -> Result<()>;

    fn initialise(
        &self,
        model: &mut MontyModel,
        state: &ChainState,
        rng: &mut RngStream,
    ) -> Result<Self::Aux>;

    /// One iteration. Returns whether `state` moved to an accepted proposal.
    fn step(
        &self,
        model: &mut MontyModel,
        state: &mut ChainState,
        aux: &mut Self::Aux,
        rng: &mut RngStream,
    ) -> Result<bool>;

    /// Per-chain diagnostics reported in the sample bundle.
    fn details(&self, _aux: &Self::Aux) -> BTreeMap<String, f64> {
        BTreeMap::new()
    }

    /// Observer output for `state` after an accepted step. The default
    /// assumes the model's last evaluation was at the accepted point.
    fn observe(&self, model: &mut MontyModel, _aux: &Self::Aux) -> Result<Option<Observation>> {
        model.observe().map(Some)
    }
}

pub trait MarkovChain {
    /// Performs one iteration; `true` if the proposal was accepted.
    fn step(&mut self) -> Result<bool>;

    fn current_state(&self) -> &[f64];

    fn current_density(&self) -> f64;
}

/// Log-density at `x`, with numerical failures mapped to `-inf`.
pub(crate) fn evaluate(model: &mut MontyModel, x: &[f64]) -> Result<f64> {
    match model.density(x) {
        Ok(d) if d.is_nan() => {
            log::debug!("density is NaN at {x:?}; treating as -inf");
            Ok(f64::NEG_INFINITY)
        }
        Ok(d) => Ok(d),
        Err(e) if e.is_recoverable() => {
            log::warn!("density evaluation failed at {x:?} ({e}); treating as -inf");
            Ok(f64::NEG_INFINITY)
        }
        Err(e) => Err(e),
    }
}

/// Gradient at `x`, or `None` where it cannot be computed.
pub(crate) fn evaluate_gradient(model: &mut MontyModel, x: &[f64]) -> Result<Option<Vec<f64>>> {
    match model.gradient(x) {
        Ok(g) if g.iter().any(|v| !v.is_finite()) => {
            log::debug!("non-finite gradient at {x:?}");
            Ok(None)
        }
        Ok(g) => Ok(Some(g)),
        Err(e) if e.is_recoverable() => {
            log::warn!("gradient evaluation failed at {x:?} ({e})");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Metropolis acceptance on the log scale; `NaN` ratios are rejected.
pub(crate) fn accept(log_ratio: f64, rng: &mut RngStream) -> bool {
    if log_ratio.is_nan() {
        return false;
    }
    log_ratio >= 0.0 || rng.random_real().ln() < log_ratio
}

/// One chain: a forked model, a sampler and the chain's own random stream.
pub struct Chain<S: Sampler> {
    model: MontyModel,
    sampler: S,
    rng: RngStream,
    phase: ChainPhase,
    state: ChainState,
    initial: Vec<f64>,
    aux: S::Aux,
    has_observer: bool,
    observation: Option<Observation>,
    tracker: ChainTracker,
}

impl<S: Sampler> Chain<S> {
    /// Initialise a chain at `initial`, or at a draw from the model when
    /// `initial` is `None`.
    pub fn new(
        mut model: MontyModel,
        sampler: S,
        mut rng: RngStream,
        initial: Option<Vec<f64>>,
    ) -> Result<Self> {
        let pars = match initial {
            Some(pars) => {
                model.domain().check(&pars)?;
                pars
            }
            None if model.properties().has_direct_sample => model.direct_sample(&mut rng)?,
            None => {
                return Err(MontyError::MissingCapability(
                    "direct sampling (no initial state was given)",
                ))
            }
        };
        let density = evaluate(&mut model, &pars)?;
        let has_observer = model.properties().has_observer;
        // Nothing to observe after a failed evaluation.
        let observation = if has_observer && density > f64::NEG_INFINITY {
            Some(model.observe()?)
        } else {
            None
        };
        let state = ChainState {
            pars: pars.clone(),
            density,
        };
        let aux = sampler.initialise(&mut model, &state, &mut rng)?;
        let tracker = ChainTracker::new(pars.len());
        Ok(Self {
            model,
            sampler,
            rng,
            phase: ChainPhase::Running,
            state,
            initial: pars,
            aux,
            has_observer,
            observation,
            tracker,
        })
    }

    pub fn phase(&self) -> ChainPhase {
        self.phase
    }

    pub fn state(&self) -> &ChainState {
        &self.state
    }

    pub fn initial(&self) -> &[f64] {
        &self.initial
    }

    pub fn model(&self) -> &MontyModel {
        &self.model
    }

    pub fn acceptance_rate(&self) -> f64 {
        self.tracker.acceptance_rate()
    }

    pub fn details(&self) -> ChainDetails {
        ChainDetails {
            acceptance_rate: self.tracker.acceptance_rate(),
            extra: self.sampler.details(&self.aux),
        }
    }

    /// Run `n_steps` iterations and keep every `thinning`-th draw after the
    /// first `burnin`. The chain is finished afterwards.
    pub fn run(
        &mut self,
        n_steps: usize,
        burnin: usize,
        thinning: usize,
        progress: Option<Sender<ChainStats>>,
    ) -> Result<ChainOutput> {
        if thinning == 0 {
            return Err(MontyError::invalid("thinning must be at least 1"));
        }
        let n_keep = kept_steps(n_steps, burnin, thinning);
        let dim = self.state.pars.len();
        let mut pars = Array2::<f64>::zeros((dim, n_keep));
        let mut density = Vec::with_capacity(n_keep);
        let mut observations = Vec::with_capacity(n_keep);
        let mut last_sent = Instant::now();
        let freq = Duration::from_millis(500);

        for i in 0..n_steps {
            self.step()?;
            if i >= burnin && (i - burnin) % thinning == 0 {
                let k = density.len();
                for (p, &v) in self.state.pars.iter().enumerate() {
                    pars[[p, k]] = v;
                }
                density.push(self.state.density);
                observations.push(self.observation.clone());
            }
            if let Some(tx) = &progress {
                let now = Instant::now();
                if now >= last_sent + freq || i + 1 == n_steps {
                    if let Err(e) = tx.send(self.tracker.stats()) {
                        log::debug!("sending chain statistics failed: {e}");
                    }
                    last_sent = now;
                }
            }
        }
        self.phase = ChainPhase::Finished;
        Ok(ChainOutput {
            pars,
            density,
            observations,
            initial: self.initial.clone(),
            last: self.state.pars.clone(),
            details: self.details(),
        })
    }
}

impl<S: Sampler> MarkovChain for Chain<S> {
    fn step(&mut self) -> Result<bool> {
        if self.phase != ChainPhase::Running {
            return Err(MontyError::invalid(format!(
                "chain cannot step in phase {:?}",
                self.phase
            )));
        }
        let accepted = self
            .sampler
            .step(&mut self.model, &mut self.state, &mut self.aux, &mut self.rng)?;
        if accepted && self.has_observer {
            if let Some(observation) = self.sampler.observe(&mut self.model, &self.aux)? {
                self.observation = Some(observation);
            }
        }
        self.tracker.step(&self.state.pars, accepted)?;
        Ok(accepted)
    }

    fn current_state(&self) -> &[f64] {
        &self.state.pars
    }

    fn current_density(&self) -> f64 {
        self.state.density
    }
}

/// Everything one chain contributes to a [`Samples`] bundle.
#[derive(Debug, Clone)]
pub struct ChainOutput {
    /// `parameter × step`
    pub pars: Array2<f64>,
    pub density: Vec<f64>,
    pub observations: Vec<Option<Observation>>,
    pub initial: Vec<f64>,
    pub last: Vec<f64>,
    pub details: ChainDetails,
}

/// Configuration for [`sample`].
#[derive(Debug, Clone, PartialEq)]
pub struct SampleOptions {
    pub n_chains: usize,
    pub seed: u64,
    /// One starting point shared by all chains, or one per chain. Chains
    /// without a starting point draw one from the model.
    pub initial: Option<Vec<Vec<f64>>>,
    pub burnin: usize,
    pub thinning: usize,
    /// Show one progress bar per chain.
    pub progress: bool,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            n_chains: 1,
            seed: 0,
            initial: None,
            burnin: 0,
            thinning: 1,
            progress: false,
        }
    }
}

impl SampleOptions {
    pub fn with_chains(mut self, n_chains: usize) -> Self {
        self.n_chains = n_chains;
        self
    }

    pub fn with_initial(mut self, initial: Vec<Vec<f64>>) -> Self {
        self.initial = Some(initial);
        self
    }

    pub fn with_burnin(mut self, burnin: usize) -> Self {
        self.burnin = burnin;
        self
    }

    pub fn with_thinning(mut self, thinning: usize) -> Self {
        self.thinning = thinning;
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Root seed; chain `i` uses stream `i` of this seed.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    fn initial_for(&self, chain: usize) -> Option<Vec<f64>> {
        match &self.initial {
            Some(points) if points.len() == 1 => Some(points[0].clone()),
            Some(points) => points.get(chain).cloned(),
            None => None,
        }
    }
}

pub(crate) fn kept_steps(n_steps: usize, burnin: usize, thinning: usize) -> usize {
    if n_steps <= burnin {
        0
    } else {
        (n_steps - burnin).div_ceil(thinning)
    }
}

fn validate(model: &MontyModel, n_steps: usize, options: &SampleOptions) -> Result<()> {
    if options.n_chains == 0 {
        return Err(MontyError::invalid("n_chains must be at least 1"));
    }
    if n_steps == 0 {
        return Err(MontyError::invalid("n_steps must be at least 1"));
    }
    if options.thinning == 0 {
        return Err(MontyError::invalid("thinning must be at least 1"));
    }
    if options.burnin >= n_steps {
        return Err(MontyError::invalid(format!(
            "burnin ({}) leaves no samples out of {n_steps} steps",
            options.burnin
        )));
    }
    match &options.initial {
        Some(points) => {
            if points.len() != 1 && points.len() != options.n_chains {
                return Err(MontyError::shape(
                    "initial points",
                    options.n_chains,
                    points.len(),
                ));
            }
            for p in points {
                model.domain().check(p)?;
            }
        }
        None if !model.properties().has_direct_sample => {
            return Err(MontyError::MissingCapability(
                "direct sampling (no initial state was given)",
            ));
        }
        None => {}
    }
    Ok(())
}

/// Run `options.n_chains` independent chains of `sampler` on `model` for
/// `n_steps` iterations each.
pub fn sample<S: Sampler>(
    model: &MontyModel,
    sampler: &S,
    n_steps: usize,
    options: &SampleOptions,
) -> Result<Samples> {
    validate(model, n_steps, options)?;
    sampler.check(model)?;

    // Forks draw their seeds from the chain's own stream.
    let forks = (0..options.n_chains)
        .map(|i| {
            let mut rng = RngStream::new(options.seed, i as u64);
            model.fork(&mut rng).map(|fork| (fork, rng))
        })
        .collect::<Result<Vec<_>>>()?;
    let mut chains: Vec<Chain<S>> = forks
        .into_par_iter()
        .enumerate()
        .map(|(i, (fork, rng))| Chain::new(fork, sampler.clone(), rng, options.initial_for(i)))
        .collect::<Result<_>>()?;
    log::debug!(
        "running {} chains for {n_steps} steps",
        options.n_chains
    );

    let outputs = if options.progress {
        run_progress(&mut chains, n_steps, options)?
    } else {
        chains
            .par_iter_mut()
            .map(|chain| chain.run(n_steps, options.burnin, options.thinning, None))
            .collect::<Result<Vec<_>>>()?
    };
    Samples::from_chains(model.parameters().to_vec(), outputs)
}

fn run_progress<S: Sampler>(
    chains: &mut [Chain<S>],
    n_steps: usize,
    options: &SampleOptions,
) -> Result<Vec<ChainOutput>> {
    let mut rxs = Vec::with_capacity(chains.len());
    let mut txs = Vec::with_capacity(chains.len());
    for _ in 0..chains.len() {
        let (tx, rx) = mpsc::channel::<ChainStats>();
        rxs.push(rx);
        txs.push(tx);
    }

    let total = n_steps as u64;
    let progress_handle = thread::spawn(move || {
        let sleep_ms = Duration::from_millis(250);
        let multi = MultiProgress::new();
        let pb_style = ProgressStyle::default_bar()
            .template("{prefix:8} {bar:40.cyan/blue} {pos}/{len} ({eta}) | {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");

        let global_pb = multi.add(ProgressBar::new(rxs.len() as u64 * total));
        global_pb.set_style(pb_style.clone());
        global_pb.set_prefix("Global");

        let bars: Vec<ProgressBar> = (0..rxs.len())
            .map(|i| {
                let pb = multi.add(ProgressBar::new(total));
                pb.set_style(pb_style.clone());
                pb.set_prefix(format!("Chain {i}"));
                pb
            })
            .collect();
        let mut most_recent: Vec<Option<ChainStats>> = vec![None; rxs.len()];
        let mut open = vec![true; rxs.len()];

        loop {
            for (i, rx) in rxs.iter().enumerate() {
                loop {
                    match rx.try_recv() {
                        Ok(stats) => most_recent[i] = Some(stats),
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => {
                            open[i] = false;
                            break;
                        }
                    }
                }
            }

            let mut avg_p_accept = 0.0;
            let mut n_available = 0.0;
            for (pb, stats) in bars.iter().zip(&most_recent) {
                if let Some(stats) = stats {
                    pb.set_position(stats.n);
                    pb.set_message(format!("p(accept)≈{:.2}", stats.p_accept));
                    avg_p_accept += stats.p_accept;
                    n_available += 1.0;
                }
            }
            if n_available > 0.0 {
                avg_p_accept /= n_available;
            }
            global_pb.set_position(most_recent.iter().flatten().map(|s| s.n).sum());
            let valid: Vec<&ChainStats> = most_recent.iter().flatten().collect();
            if valid.len() >= 2 {
                if let Ok(rhats) = collect_rhat(&valid) {
                    global_pb.set_message(format!(
                        "p(accept)≈{:.2} max(rhat)≈{:.2}",
                        avg_p_accept,
                        max_skipnan(&rhats)
                    ));
                }
            } else {
                global_pb.set_message(format!("p(accept)≈{:.2}", avg_p_accept));
            }

            if open.iter().all(|o| !o) {
                for pb in &bars {
                    pb.finish();
                }
                global_pb.finish();
                break;
            }
            thread::sleep(sleep_ms);
        }
    });

    let outputs = chains
        .par_iter_mut()
        .zip(txs)
        .map(|(chain, tx)| chain.run(n_steps, options.burnin, options.thinning, Some(tx)))
        .collect::<Result<Vec<_>>>();
    if progress_handle.join().is_err() {
        log::warn!("progress reporting thread panicked");
    }
    outputs
}

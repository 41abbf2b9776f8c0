//! Fit a stochastic SIR model to simulated daily case counts, using a
//! particle-filter likelihood and adaptive random-walk Metropolis.

use std::error::Error;

use mini_monty::core::{sample, SampleOptions};
use mini_monty::data::ObservationData;
use mini_monty::distributions::{poisson_log_density, Univariate};
use mini_monty::error::Result;
use mini_monty::filter::{FilterOptions, ParticleFilter};
use mini_monty::model::likelihood::FilterLikelihood;
use mini_monty::model::prior::Prior;
use mini_monty::packer::Packer;
use mini_monty::params::Parameters;
use mini_monty::rng::RngStream;
use mini_monty::samplers::AdaptiveRandomWalk;
use mini_monty::stats::RhatMulti;
use mini_monty::system::{Generator, System, SystemOptions};
use ndarray::{s, Array2};

/// Chain-binomial SIR with daily incidence.
struct Sir;

impl Generator for Sir {
    fn state_names(&self) -> Vec<String> {
        ["S", "I", "R", "incidence"].map(String::from).to_vec()
    }

    fn parameter_names(&self) -> Vec<String> {
        ["beta", "gamma", "N", "I0"].map(String::from).to_vec()
    }

    fn initial(&self, _t: f64, p: &Parameters, _rng: &mut RngStream, state: &mut [f64]) -> Result<()> {
        let (n, i0) = (p.scalar("N")?, p.scalar("I0")?);
        state.copy_from_slice(&[n - i0, i0, 0.0, 0.0]);
        Ok(())
    }

    fn update(
        &self,
        _t: f64,
        dt: f64,
        state: &[f64],
        p: &Parameters,
        rng: &mut RngStream,
        next: &mut [f64],
    ) -> Result<()> {
        let (beta, gamma, n) = (p.scalar("beta")?, p.scalar("gamma")?, p.scalar("N")?);
        let [s, i, r, inc] = [state[0], state[1], state[2], state[3]];
        let n_si = rng.binomial(s, 1.0 - (-beta * i / n * dt).exp())?;
        let n_ir = rng.binomial(i, 1.0 - (-gamma * dt).exp())?;
        next.copy_from_slice(&[s - n_si, i + n_si - n_ir, r + n_ir, inc + n_si]);
        Ok(())
    }

    fn zero_every(&self) -> Vec<(usize, f64)> {
        vec![(3, 1.0)]
    }

    fn data_streams(&self) -> Vec<String> {
        vec!["cases".into()]
    }

    fn compare(
        &self,
        _t: f64,
        state: &[f64],
        _stream: &str,
        observed: f64,
        _p: &Parameters,
        _rng: &mut RngStream,
    ) -> Result<f64> {
        Ok(poisson_log_density(observed, state[3] + 1e-6))
    }
}

fn main() -> std::result::Result<(), Box<dyn Error>> {
    const SEED: u64 = 42;
    const N_CHAINS: usize = 4;
    const N_STEPS: usize = 2000;
    const BURNIN: usize = 500;
    const DT: f64 = 0.25;

    let truth = Parameters::new()
        .with("beta", 0.2)
        .with("gamma", 0.1)
        .with("N", 1000.0)
        .with("I0", 10.0);
    let times: Vec<f64> = (1..=60).map(f64::from).collect();

    // One noisy realisation as the observed data.
    let mut system = System::new(Sir, &[truth], SystemOptions::default().with_dt(DT).with_seed(SEED))?;
    system.set_state_initial()?;
    let simulated = system.simulate(&times, Some(&[3]))?;
    let cases: Vec<f64> = simulated.slice(s![0, 0, ..]).to_vec();
    println!("Simulated {} days, total cases {}", times.len(), cases.iter().sum::<f64>());
    let data = ObservationData::from_columns(0.0, &times, &[("cases", cases)])?;

    let filter_options = FilterOptions::default()
        .with_particles(200)
        .with_dt(DT)
        .with_trajectories(true)
        .with_trajectory_index(vec![1])
        .set_seed(SEED);
    let filter = ParticleFilter::new(Sir, data, filter_options)?;
    let packer = Packer::new(["beta", "gamma"])?
        .with_fixed(Parameters::new().with("N", 1000.0).with("I0", 10.0))?;
    let likelihood = FilterLikelihood::new(filter, packer).into_model()?;
    let prior = Prior::new()
        .with("beta", Univariate::exponential(1.0)?)?
        .with("gamma", Univariate::exponential(1.0)?)?
        .into_model();
    let posterior = (prior + likelihood)?;

    let sampler = AdaptiveRandomWalk::new(Array2::eye(2) * 4e-4)?;
    let options = SampleOptions::default()
        .with_chains(N_CHAINS)
        .with_initial(vec![vec![0.3, 0.15]])
        .with_progress(true)
        .set_seed(SEED);
    let samples = sample(&posterior, &sampler, N_STEPS, &options)?.thin(BURNIN, 1)?;

    let flat = samples.pars_flat();
    for (name, row) in samples.parameter_names.iter().zip(flat.rows()) {
        let mean = row.sum() / row.len() as f64;
        println!("Posterior mean of {name}: {mean:.4}");
    }
    for (i, d) in samples.details.iter().enumerate() {
        println!("Chain {i}: acceptance rate {:.3}", d.acceptance_rate);
    }

    let n_pars = samples.parameter_names.len();
    let mut rhat = RhatMulti::new(samples.chains(), n_pars);
    let pars = &samples.pars;
    for step in 0..samples.n_steps() {
        let draw: Vec<f64> = (0..samples.chains())
            .flat_map(|c| (0..n_pars).map(move |p| pars[[p, step, c]]))
            .collect();
        rhat.step(&draw)?;
    }
    println!("max R-hat: {:.3}", rhat.max()?);

    if let Some(traj) = samples.observations.get("trajectories") {
        // state × time × step × chain
        let day_30 = traj.slice(s![0, 29, .., ..]);
        let seen: Vec<f64> = day_30.iter().copied().filter(|v| !v.is_nan()).collect();
        let mean = seen.iter().sum::<f64>() / seen.len().max(1) as f64;
        println!("Posterior mean of I on day 30: {mean:.1}");
    }

    #[cfg(feature = "csv")]
    {
        mini_monty::io::csv::save_samples(&samples, "sir_samples.csv")?;
        println!("Saved samples to sir_samples.csv");
    }

    Ok(())
}

/*!
Particle-filter likelihoods.

[`FilterLikelihood`] turns a [`ParticleFilter`] plus a [`Packer`] into a
stochastic [`Density`]: each evaluation unpacks the parameter vector, runs the
filter with fresh randomness and returns the log marginal likelihood estimate.
Forking for another chain creates a filter seeded from that chain's random
stream.

When the filter saves trajectories, the final state or snapshots, the model
observes them for one particle picked at random from the surviving set:
`trajectories` is `state × time`, `state` is a vector, and `snapshots` is
`state × snapshot`.
*/

use ndarray::{Array1, Array2, Axis};

use crate::error::{MontyError, Result};
use crate::filter::ParticleFilter;
use crate::model::{Density, Domain, MontyModel, Observation};
use crate::packer::Packer;
use crate::rng::RngStream;
use crate::system::Generator;

pub struct FilterLikelihood<G: Generator> {
    filter: ParticleFilter<G>,
    packer: Packer,
    rng: RngStream,
}

impl<G: Generator + 'static> FilterLikelihood<G> {
    pub fn new(filter: ParticleFilter<G>, packer: Packer) -> Self {
        // One past the particle streams and the resampling stream.
        let index = filter.n_particles() as u64 + 1;
        let rng = RngStream::new(filter.options().seed, index);
        Self { filter, packer, rng }
    }

    pub fn filter(&self) -> &ParticleFilter<G> {
        &self.filter
    }

    pub fn packer(&self) -> &Packer {
        &self.packer
    }

    /// A model over the packer's parameters with an unbounded domain.
    pub fn into_model(self) -> Result<MontyModel> {
        let names = self.packer.names();
        let domain = Domain::unbounded(names.len());
        MontyModel::new(names, domain, self)
    }
}

impl<G: Generator + 'static> Density for FilterLikelihood<G> {
    fn density(&mut self, x: &[f64]) -> Result<f64> {
        let pars = self.packer.unpack(x)?;
        self.filter.run(&pars)
    }

    fn is_stochastic(&self) -> bool {
        true
    }

    fn observer_keys(&self) -> Vec<String> {
        let options = self.filter.options();
        let mut keys = Vec::new();
        if options.save_trajectories {
            keys.push("trajectories".to_string());
        }
        if options.save_state {
            keys.push("state".to_string());
        }
        if !options.save_snapshots.is_empty() {
            keys.push("snapshots".to_string());
        }
        keys
    }

    fn observe(&mut self) -> Result<Observation> {
        let mut out = Observation::new();
        let keys = self.observer_keys();
        if keys.is_empty() {
            return Ok(out);
        }
        let n = self.filter.n_particles();
        let particle = ((self.rng.random_real() * n as f64) as usize).min(n - 1);
        let degenerate = matches!(
            self.filter.last_status(),
            Err(MontyError::DegenerateFilter { .. })
        );
        let options = self.filter.options();

        if options.save_trajectories {
            let value = if degenerate {
                let n_state = self.filter.trajectory_index().len();
                Array2::from_elem((n_state, self.filter.data().len()), f64::NAN)
            } else {
                self.filter
                    .last_trajectories()?
                    .index_axis(Axis(1), particle)
                    .to_owned()
            };
            out.insert("trajectories".to_string(), value.into_dyn());
        }
        if options.save_state {
            let value = if degenerate {
                Array1::from_elem(self.filter.n_state(), f64::NAN)
            } else {
                self.filter.last_state()?.column(particle).to_owned()
            };
            out.insert("state".to_string(), value.into_dyn());
        }
        if !options.save_snapshots.is_empty() {
            let value = if degenerate {
                Array2::from_elem(
                    (self.filter.n_state(), options.save_snapshots.len()),
                    f64::NAN,
                )
            } else {
                self.filter
                    .last_snapshots()?
                    .index_axis(Axis(1), particle)
                    .to_owned()
            };
            out.insert("snapshots".to_string(), value.into_dyn());
        }
        Ok(out)
    }

    fn fork(&self, rng: &mut RngStream) -> Result<Box<dyn Density>> {
        let filter = self.filter.fork(rng.random_seed())?;
        Ok(Box::new(FilterLikelihood::new(filter, self.packer.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Chain, MarkovChain};
    use crate::data::ObservationData;
    use crate::filter::FilterOptions;
    use crate::params::Parameters;
    use crate::samplers::RandomWalk;

    /// Slowly drifting level observed with unit-variance noise.
    struct Level;

    impl Generator for Level {
        fn state_names(&self) -> Vec<String> {
            vec!["x".into()]
        }
        fn initial(&self, _t: f64, p: &Parameters, _rng: &mut RngStream, s: &mut [f64]) -> Result<()> {
            s[0] = p.scalar("mu")?;
            Ok(())
        }
        fn update(
            &self,
            _t: f64,
            _dt: f64,
            s: &[f64],
            _p: &Parameters,
            rng: &mut RngStream,
            next: &mut [f64],
        ) -> Result<()> {
            next[0] = s[0] + rng.normal(0.0, 0.1)?;
            Ok(())
        }
        fn data_streams(&self) -> Vec<String> {
            vec!["y".into()]
        }
        fn compare(
            &self,
            _t: f64,
            s: &[f64],
            _stream: &str,
            y: f64,
            _p: &Parameters,
            _rng: &mut RngStream,
        ) -> Result<f64> {
            Ok(-0.5 * (y - s[0]).powi(2))
        }
    }

    fn likelihood(options: FilterOptions) -> FilterLikelihood<Level> {
        let data =
            ObservationData::from_columns(0.0, &[1.0, 2.0], &[("y", vec![1.0, 1.1])]).unwrap();
        let filter = ParticleFilter::new(Level, data, options).unwrap();
        FilterLikelihood::new(filter, Packer::new(["mu"]).unwrap())
    }

    #[test]
    fn density_is_stochastic_and_peaks_near_truth() {
        let mut model = likelihood(FilterOptions::default().with_particles(50))
            .into_model()
            .unwrap();
        assert!(model.properties().is_stochastic);
        let near = model.density(&[1.0]).unwrap();
        let again = model.density(&[1.0]).unwrap();
        let far = model.density(&[5.0]).unwrap();
        assert_ne!(near, again);
        assert!(near > far);
    }

    #[test]
    fn observer_reports_one_particle() {
        let options = FilterOptions::default()
            .with_particles(20)
            .with_trajectories(true)
            .with_state(true);
        let mut model = likelihood(options).into_model().unwrap();
        assert_eq!(model.observer_keys(), vec!["trajectories", "state"]);
        model.density(&[1.0]).unwrap();
        let obs = model.observe().unwrap();
        assert_eq!(obs["trajectories"].shape(), &[1, 2]);
        assert_eq!(obs["state"].shape(), &[1]);
        assert_eq!(obs["trajectories"][[0, 1]], obs["state"][[0]]);
    }

    #[test]
    fn forks_use_independent_streams() {
        let model = likelihood(FilterOptions::default().with_particles(30).with_reproducible(true))
            .into_model()
            .unwrap();
        let mut a = model.fork(&mut RngStream::new(1, 0)).unwrap();
        let mut b = model.fork(&mut RngStream::new(1, 1)).unwrap();
        let mut a2 = model.fork(&mut RngStream::new(1, 0)).unwrap();
        let la = a.density(&[1.0]).unwrap();
        assert_ne!(la, b.density(&[1.0]).unwrap());
        assert_eq!(la, a2.density(&[1.0]).unwrap());
    }

    #[test]
    fn chains_from_different_root_seeds_see_different_filter_noise() {
        let model = likelihood(FilterOptions::default().with_particles(30).with_reproducible(true))
            .into_model()
            .unwrap();
        let start = |seed: u64| {
            let mut rng = RngStream::new(seed, 0);
            let fork = model.fork(&mut rng).unwrap();
            let rw = RandomWalk::isotropic(1, 0.1).unwrap();
            Chain::new(fork, rw, rng, Some(vec![1.0])).unwrap().current_density()
        };
        assert_eq!(start(1), start(1));
        assert_ne!(start(1), start(999));
    }

    #[test]
    fn consecutive_forks_of_one_stream_differ() {
        let model = likelihood(FilterOptions::default().with_particles(30).with_reproducible(true))
            .into_model()
            .unwrap();
        let mut rng = RngStream::new(5, 0);
        let mut first = model.fork(&mut rng).unwrap();
        let mut second = model.fork(&mut rng).unwrap();
        assert_ne!(first.density(&[1.0]).unwrap(), second.density(&[1.0]).unwrap());
    }
}

//! MCMC samplers implementing [`crate::core::Sampler`].
//!
//! - [`random_walk::RandomWalk`]: Gaussian random-walk Metropolis with a
//!   boundary policy for bounded domains.
//! - [`adaptive::AdaptiveRandomWalk`]: random walk whose proposal covariance
//!   and scale are learned while sampling.
//! - [`hmc::Hmc`]: Hamiltonian Monte Carlo with a fixed leapfrog schedule.
//! - [`tempering::ParallelTempering`]: a ladder of tempered random walks with
//!   non-reversible neighbour swaps.

pub mod adaptive;
pub mod hmc;
pub mod random_walk;
pub mod tempering;

pub use adaptive::AdaptiveRandomWalk;
pub use hmc::Hmc;
pub use random_walk::{Boundaries, RandomWalk};
pub use tempering::ParallelTempering;

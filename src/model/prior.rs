//! Priors built from independent named univariate distributions.

use crate::distributions::Univariate;
use crate::error::{MontyError, Result};
use crate::model::{Density, Domain, MontyModel};
use crate::rng::RngStream;

/// A product of independent univariate distributions, one per parameter, in
/// insertion order. Density, gradient and direct sampling are all analytic;
/// the model domain is the product of the supports.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prior {
    names: Vec<String>,
    distributions: Vec<Univariate>,
}

impl Prior {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, distribution: Univariate) -> Result<Self> {
        let name = name.into();
        if self.names.contains(&name) {
            return Err(MontyError::NameCollision(name));
        }
        self.names.push(name);
        self.distributions.push(distribution);
        Ok(self)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn distributions(&self) -> &[Univariate] {
        &self.distributions
    }

    pub fn domain(&self) -> Domain {
        let (lower, upper) = self.distributions.iter().map(Univariate::support).unzip();
        Domain::new(lower, upper).unwrap_or_else(|_| Domain::unbounded(self.names.len()))
    }

    pub fn into_model(self) -> MontyModel {
        let domain = self.domain();
        let names = self.names.clone();
        MontyModel {
            parameters: names,
            domain,
            inner: super::Inner::Leaf(Box::new(self)),
        }
    }
}

impl Density for Prior {
    fn density(&mut self, x: &[f64]) -> Result<f64> {
        Ok(self
            .distributions
            .iter()
            .zip(x)
            .map(|(d, &v)| d.log_density(v))
            .sum())
    }

    fn has_gradient(&self) -> bool {
        true
    }

    fn gradient(&mut self, x: &[f64]) -> Result<Vec<f64>> {
        Ok(self
            .distributions
            .iter()
            .zip(x)
            .map(|(d, &v)| d.gradient(v))
            .collect())
    }

    fn has_direct_sample(&self) -> bool {
        true
    }

    fn direct_sample(&mut self, rng: &mut RngStream) -> Result<Vec<f64>> {
        self.distributions.iter().map(|d| d.sample(rng)).collect()
    }

    fn fork(&self, _rng: &mut RngStream) -> Result<Box<dyn Density>> {
        Ok(Box::new(self.clone()))
    }
}

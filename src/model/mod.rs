/*!
# Models

A [`MontyModel`] is the uniform interface samplers work against: a list of
parameter names, a box [`Domain`], a log-density, and optionally a gradient,
direct sampling and an observer that reports extra per-evaluation output
(for example particle trajectories).

Models come from three places:

- closures, via [`MontyModel::from_fn`];
- priors over independent named distributions, via [`prior::Prior`];
- particle filters, via [`likelihood::FilterLikelihood`].

Two models over the same parameters can be added: the sum's density is the
sum of densities, its domain the intersection of domains, its gradient the sum
of gradients (only when both have one) and its observations the union of
both observers' outputs.

```rust
use mini_monty::distributions::Univariate;
use mini_monty::model::{prior::Prior, MontyModel};

let prior = Prior::new()
    .with("mu", Univariate::normal(0.0, 10.0).unwrap())
    .unwrap()
    .into_model();
let likelihood = MontyModel::from_fn(["mu"], |x: &[f64]| -0.5 * (x[0] - 3.0).powi(2))
    .with_gradient(|x: &[f64]| vec![-(x[0] - 3.0)])
    .build()
    .unwrap();

let mut posterior = (prior + likelihood).unwrap();
assert!(posterior.properties().has_gradient);
assert!(!posterior.properties().has_direct_sample);
let lp = posterior.density(&[3.0]).unwrap();
assert!(lp.is_finite());
```
*/

pub mod domain;
pub mod likelihood;
pub mod prior;

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Add;
use std::sync::Arc;

use ndarray::ArrayD;

use crate::error::{MontyError, Result};
use crate::rng::RngStream;

pub use domain::Domain;

/// Observer output: named arrays describing the last density evaluation.
pub type Observation = BTreeMap<String, ArrayD<f64>>;

/// A log-density with optional capabilities.
///
/// `density` takes `&mut self` so that stochastic densities (particle
/// filters) can advance their own random streams.
pub trait Density: Send {
    fn density(&mut self, x: &[f64]) -> Result<f64>;

    fn has_gradient(&self) -> bool {
        false
    }

    fn gradient(&mut self, _x: &[f64]) -> Result<Vec<f64>> {
        Err(MontyError::MissingCapability("gradient"))
    }

    fn has_direct_sample(&self) -> bool {
        false
    }

    fn direct_sample(&mut self, _rng: &mut RngStream) -> Result<Vec<f64>> {
        Err(MontyError::MissingCapability("direct sampling"))
    }

    /// Whether repeated calls at the same point may return different values.
    fn is_stochastic(&self) -> bool {
        false
    }

    /// Keys produced by [`Density::observe`].
    fn observer_keys(&self) -> Vec<String> {
        Vec::new()
    }

    /// Output associated with the most recent call to `density`.
    fn observe(&mut self) -> Result<Observation> {
        Ok(Observation::new())
    }

    /// An independent copy for use on another chain; stochastic densities
    /// seed their random streams from `rng`.
    fn fork(&self, rng: &mut RngStream) -> Result<Box<dyn Density>>;
}

/// Capabilities of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelProperties {
    pub has_gradient: bool,
    pub has_direct_sample: bool,
    pub is_stochastic: bool,
    pub has_observer: bool,
}

enum Inner {
    Leaf(Box<dyn Density>),
    Sum(Box<MontyModel>, Box<MontyModel>),
}

pub struct MontyModel {
    parameters: Vec<String>,
    domain: Domain,
    inner: Inner,
}

impl fmt::Debug for MontyModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MontyModel")
            .field("parameters", &self.parameters)
            .field("domain", &self.domain)
            .field("properties", &self.properties())
            .finish()
    }
}

impl MontyModel {
    /// Wrap any [`Density`] over the named parameters.
    pub fn new<S: Into<String>>(
        parameters: impl IntoIterator<Item = S>,
        domain: Domain,
        density: impl Density + 'static,
    ) -> Result<Self> {
        Self::from_boxed(
            parameters.into_iter().map(Into::into).collect(),
            domain,
            Box::new(density),
        )
    }

    fn from_boxed(parameters: Vec<String>, domain: Domain, density: Box<dyn Density>) -> Result<Self> {
        if domain.dim() != parameters.len() {
            return Err(MontyError::shape("domain", parameters.len(), domain.dim()));
        }
        for (i, name) in parameters.iter().enumerate() {
            if parameters[..i].contains(name) {
                return Err(MontyError::NameCollision(name.clone()));
            }
        }
        Ok(Self {
            parameters,
            domain,
            inner: Inner::Leaf(density),
        })
    }

    /// Start building a model from a log-density closure.
    pub fn from_fn<S, F>(parameters: impl IntoIterator<Item = S>, density: F) -> FnModel
    where
        S: Into<String>,
        F: Fn(&[f64]) -> f64 + Send + Sync + 'static,
    {
        FnModel {
            parameters: parameters.into_iter().map(Into::into).collect(),
            domain: None,
            density: Arc::new(density),
            gradient: None,
            direct_sample: None,
        }
    }

    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    pub fn dim(&self) -> usize {
        self.parameters.len()
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn properties(&self) -> ModelProperties {
        match &self.inner {
            Inner::Leaf(d) => ModelProperties {
                has_gradient: d.has_gradient(),
                has_direct_sample: d.has_direct_sample(),
                is_stochastic: d.is_stochastic(),
                has_observer: !d.observer_keys().is_empty(),
            },
            Inner::Sum(a, b) => {
                let (a, b) = (a.properties(), b.properties());
                ModelProperties {
                    has_gradient: a.has_gradient && b.has_gradient,
                    has_direct_sample: false,
                    is_stochastic: a.is_stochastic || b.is_stochastic,
                    has_observer: a.has_observer || b.has_observer,
                }
            }
        }
    }

    fn check_len(&self, x: &[f64]) -> Result<()> {
        if x.len() != self.dim() {
            return Err(MontyError::shape("parameter vector", self.dim(), x.len()));
        }
        Ok(())
    }

    /// Log-density at `x`. The domain is not enforced here.
    pub fn density(&mut self, x: &[f64]) -> Result<f64> {
        self.check_len(x)?;
        match &mut self.inner {
            Inner::Leaf(d) => d.density(x),
            Inner::Sum(a, b) => {
                // A zero-density first operand (usually the prior) settles it.
                let da = a.density(x)?;
                if da == f64::NEG_INFINITY {
                    return Ok(da);
                }
                Ok(da + b.density(x)?)
            }
        }
    }

    /// Log-density at each row of a `draw × parameter` batch.
    pub fn density_batch(&mut self, xs: &[Vec<f64>]) -> Result<Vec<f64>> {
        xs.iter().map(|x| self.density(x)).collect()
    }

    pub fn gradient(&mut self, x: &[f64]) -> Result<Vec<f64>> {
        self.check_len(x)?;
        match &mut self.inner {
            Inner::Leaf(d) => {
                let g = d.gradient(x)?;
                if g.len() != x.len() {
                    return Err(MontyError::shape("gradient", x.len(), g.len()));
                }
                Ok(g)
            }
            Inner::Sum(a, b) => {
                let ga = a.gradient(x)?;
                let gb = b.gradient(x)?;
                Ok(ga.iter().zip(&gb).map(|(p, q)| p + q).collect())
            }
        }
    }

    pub fn direct_sample(&mut self, rng: &mut RngStream) -> Result<Vec<f64>> {
        match &mut self.inner {
            Inner::Leaf(d) => {
                let x = d.direct_sample(rng)?;
                self.check_len(&x)?;
                Ok(x)
            }
            Inner::Sum(..) => Err(MontyError::MissingCapability("direct sampling")),
        }
    }

    pub fn observer_keys(&self) -> Vec<String> {
        match &self.inner {
            Inner::Leaf(d) => d.observer_keys(),
            Inner::Sum(a, b) => {
                let mut keys = a.observer_keys();
                keys.extend(b.observer_keys());
                keys
            }
        }
    }

    /// Observer output for the most recent density evaluation.
    pub fn observe(&mut self) -> Result<Observation> {
        match &mut self.inner {
            Inner::Leaf(d) => d.observe(),
            Inner::Sum(a, b) => {
                let mut out = a.observe()?;
                out.extend(b.observe()?);
                Ok(out)
            }
        }
    }

    /// An independent copy for another chain, seeded from that chain's
    /// stream.
    pub fn fork(&self, rng: &mut RngStream) -> Result<MontyModel> {
        let inner = match &self.inner {
            Inner::Leaf(d) => Inner::Leaf(d.fork(rng)?),
            Inner::Sum(a, b) => Inner::Sum(Box::new(a.fork(rng)?), Box::new(b.fork(rng)?)),
        };
        Ok(MontyModel {
            parameters: self.parameters.clone(),
            domain: self.domain.clone(),
            inner,
        })
    }

    /// The two operands of a sum, in the order they were added.
    pub fn split(&self) -> Option<(&MontyModel, &MontyModel)> {
        match &self.inner {
            Inner::Sum(a, b) => Some((&**a, &**b)),
            Inner::Leaf(_) => None,
        }
    }

    pub fn split_mut(&mut self) -> Option<(&mut MontyModel, &mut MontyModel)> {
        match &mut self.inner {
            Inner::Sum(a, b) => Some((&mut **a, &mut **b)),
            Inner::Leaf(_) => None,
        }
    }

    /// Restrict the domain further.
    pub fn restrict(mut self, domain: &Domain) -> Result<Self> {
        self.domain = self.domain.intersect(domain, &self.parameters)?;
        Ok(self)
    }

    /// `a + b`: densities add, domains intersect.
    pub fn combine(a: MontyModel, b: MontyModel) -> Result<MontyModel> {
        if a.parameters != b.parameters {
            if a.dim() != b.dim() {
                return Err(MontyError::shape("combined model parameters", a.dim(), b.dim()));
            }
            return match b.parameters.iter().find(|n| !a.parameters.contains(n)) {
                Some(name) => Err(MontyError::UnknownName(name.clone())),
                None => Err(MontyError::invalid(
                    "combined models must list their parameters in the same order",
                )),
            };
        }
        let keys_a = a.observer_keys();
        if let Some(k) = b.observer_keys().into_iter().find(|k| keys_a.contains(k)) {
            return Err(MontyError::NameCollision(k));
        }
        let domain = a.domain.intersect(&b.domain, &a.parameters)?;
        Ok(MontyModel {
            parameters: a.parameters.clone(),
            domain,
            inner: Inner::Sum(Box::new(a), Box::new(b)),
        })
    }
}

impl Add for MontyModel {
    type Output = Result<MontyModel>;

    fn add(self, rhs: MontyModel) -> Self::Output {
        MontyModel::combine(self, rhs)
    }
}

type DensityFn = Arc<dyn Fn(&[f64]) -> f64 + Send + Sync>;
type GradientFn = Arc<dyn Fn(&[f64]) -> Vec<f64> + Send + Sync>;
type SampleFn = Arc<dyn Fn(&mut RngStream) -> Vec<f64> + Send + Sync>;

/// Builder for a closure-backed model; see [`MontyModel::from_fn`].
#[derive(Clone)]
pub struct FnModel {
    parameters: Vec<String>,
    domain: Option<(Vec<f64>, Vec<f64>)>,
    density: DensityFn,
    gradient: Option<GradientFn>,
    direct_sample: Option<SampleFn>,
}

impl FnModel {
    pub fn with_gradient<F>(mut self, gradient: F) -> Self
    where
        F: Fn(&[f64]) -> Vec<f64> + Send + Sync + 'static,
    {
        self.gradient = Some(Arc::new(gradient));
        self
    }

    pub fn with_direct_sample<F>(mut self, sample: F) -> Self
    where
        F: Fn(&mut RngStream) -> Vec<f64> + Send + Sync + 'static,
    {
        self.direct_sample = Some(Arc::new(sample));
        self
    }

    pub fn with_domain(mut self, lower: Vec<f64>, upper: Vec<f64>) -> Self {
        self.domain = Some((lower, upper));
        self
    }

    pub fn build(self) -> Result<MontyModel> {
        let domain = match self.domain.clone() {
            Some((lower, upper)) => Domain::new(lower, upper)?,
            None => Domain::unbounded(self.parameters.len()),
        };
        let parameters = self.parameters.clone();
        MontyModel::from_boxed(parameters, domain, Box::new(self))
    }
}

impl Density for FnModel {
    fn density(&mut self, x: &[f64]) -> Result<f64> {
        Ok((self.density)(x))
    }

    fn has_gradient(&self) -> bool {
        self.gradient.is_some()
    }

    fn gradient(&mut self, x: &[f64]) -> Result<Vec<f64>> {
        match &self.gradient {
            Some(g) => Ok(g(x)),
            None => Err(MontyError::MissingCapability("gradient")),
        }
    }

    fn has_direct_sample(&self) -> bool {
        self.direct_sample.is_some()
    }

    fn direct_sample(&mut self, rng: &mut RngStream) -> Result<Vec<f64>> {
        match &self.direct_sample {
            Some(s) => Ok(s(rng)),
            None => Err(MontyError::MissingCapability("direct sampling")),
        }
    }

    fn fork(&self, _rng: &mut RngStream) -> Result<Box<dyn Density>> {
        Ok(Box::new(self.clone()))
    }
}

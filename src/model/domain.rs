//! Box constraints on a model's parameter space.

use crate::error::{MontyError, Result};

/// Per-dimension closed intervals `[lower, upper]`; bounds may be infinite.
#[derive(Debug, Clone, PartialEq)]
pub struct Domain {
    lower: Vec<f64>,
    upper: Vec<f64>,
}

impl Domain {
    pub fn unbounded(dim: usize) -> Self {
        Self {
            lower: vec![f64::NEG_INFINITY; dim],
            upper: vec![f64::INFINITY; dim],
        }
    }

    pub fn new(lower: Vec<f64>, upper: Vec<f64>) -> Result<Self> {
        if lower.len() != upper.len() {
            return Err(MontyError::shape("domain upper bounds", lower.len(), upper.len()));
        }
        for (i, (l, u)) in lower.iter().zip(&upper).enumerate() {
            if l.is_nan() || u.is_nan() || l > u {
                return Err(MontyError::invalid(format!(
                    "domain bounds in dimension {i} are not an interval: [{l}, {u}]"
                )));
            }
        }
        Ok(Self { lower, upper })
    }

    pub fn dim(&self) -> usize {
        self.lower.len()
    }

    pub fn lower(&self) -> &[f64] {
        &self.lower
    }

    pub fn upper(&self) -> &[f64] {
        &self.upper
    }

    pub fn is_bounded(&self) -> bool {
        self.lower.iter().chain(&self.upper).any(|b| b.is_finite())
    }

    pub fn contains(&self, x: &[f64]) -> bool {
        x.len() == self.dim()
            && x
                .iter()
                .zip(self.lower.iter().zip(&self.upper))
                .all(|(v, (l, u))| v >= l && v <= u)
    }

    /// `Err(OutOfDomain)` naming the first offending dimension.
    pub fn check(&self, x: &[f64]) -> Result<()> {
        if x.len() != self.dim() {
            return Err(MontyError::shape("parameter vector", self.dim(), x.len()));
        }
        for (dim, (&value, (&lower, &upper))) in
            x.iter().zip(self.lower.iter().zip(&self.upper)).enumerate()
        {
            if !(value >= lower && value <= upper) {
                return Err(MontyError::OutOfDomain {
                    dim,
                    value,
                    lower,
                    upper,
                });
            }
        }
        Ok(())
    }

    /// Component-wise intersection; `names` label dimensions in the error.
    pub fn intersect(&self, other: &Domain, names: &[String]) -> Result<Domain> {
        if other.dim() != self.dim() {
            return Err(MontyError::shape("domain dimension", self.dim(), other.dim()));
        }
        let lower: Vec<f64> = self.lower.iter().zip(&other.lower).map(|(a, b)| a.max(*b)).collect();
        let upper: Vec<f64> = self.upper.iter().zip(&other.upper).map(|(a, b)| a.min(*b)).collect();
        if let Some(dim) = (0..lower.len()).find(|&i| lower[i] > upper[i]) {
            return Err(MontyError::IncompatibleDomain {
                dim,
                name: names.get(dim).cloned().unwrap_or_default(),
            });
        }
        Ok(Domain { lower, upper })
    }

    /// Fold out-of-bounds coordinates back into the domain.
    ///
    /// A single violated bound maps `x` to `2 * bound - x`; if that overshoots
    /// the opposite bound the coordinate is folded repeatedly between both.
    pub fn reflect(&self, x: &mut [f64]) {
        for (v, (&l, &u)) in x.iter_mut().zip(self.lower.iter().zip(&self.upper)) {
            if *v < l {
                *v = 2.0 * l - *v;
            } else if *v > u {
                *v = 2.0 * u - *v;
            }
            if *v < l || *v > u {
                // Only reachable with two finite bounds.
                let width = u - l;
                if width == 0.0 {
                    *v = l;
                    continue;
                }
                let y = (*v - l).rem_euclid(2.0 * width);
                *v = if y > width { l + 2.0 * width - y } else { l + y };
            }
        }
    }
}

//! Named parameter values consumed by systems and produced by the packer.

use std::collections::BTreeMap;

use crate::error::{MontyError, Result};

/// A single named parameter: a scalar, or a dense array with an explicit shape
/// (stored in row-major order).
#[derive(Debug, Clone, PartialEq)]
pub enum ParValue {
    Scalar(f64),
    Array { values: Vec<f64>, shape: Vec<usize> },
}

impl ParValue {
    pub fn array(values: Vec<f64>, shape: Vec<usize>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != values.len() {
            return Err(MontyError::shape("array parameter", expected, values.len()));
        }
        Ok(ParValue::Array { values, shape })
    }

    /// Number of scalar entries.
    pub fn len(&self) -> usize {
        match self {
            ParValue::Scalar(_) => 1,
            ParValue::Array { values, .. } => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[f64] {
        match self {
            ParValue::Scalar(x) => std::slice::from_ref(x),
            ParValue::Array { values, .. } => values,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            ParValue::Scalar(_) => &[],
            ParValue::Array { shape, .. } => shape,
        }
    }
}

impl From<f64> for ParValue {
    fn from(x: f64) -> Self {
        ParValue::Scalar(x)
    }
}

impl From<Vec<f64>> for ParValue {
    fn from(values: Vec<f64>) -> Self {
        let shape = vec![values.len()];
        ParValue::Array { values, shape }
    }
}

/// An ordered mapping from parameter name to value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameters {
    values: BTreeMap<String, ParValue>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ParValue>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&ParValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Look up a scalar parameter.
    pub fn scalar(&self, name: &str) -> Result<f64> {
        match self.values.get(name) {
            Some(ParValue::Scalar(x)) => Ok(*x),
            Some(v) => Err(MontyError::shape(format!("parameter '{name}'"), 1, v.len())),
            None => Err(MontyError::UnknownName(name.to_string())),
        }
    }

    /// Look up an array parameter (a scalar is returned as a length-one slice).
    pub fn array(&self, name: &str) -> Result<&[f64]> {
        self.values
            .get(name)
            .map(ParValue::as_slice)
            .ok_or_else(|| MontyError::UnknownName(name.to_string()))
    }

    /// Overwrite or add every entry of `other`.
    pub fn merge(&mut self, other: &Parameters) {
        for (k, v) in other.iter() {
            self.values.insert(k.clone(), v.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParValue)> {
        self.values.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, f64)> for Parameters {
    fn from_iter<I: IntoIterator<Item = (S, f64)>>(iter: I) -> Self {
        let mut pars = Parameters::new();
        for (k, v) in iter {
            pars.insert(k, v);
        }
        pars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_and_array_lookup() {
        let pars = Parameters::new()
            .with("beta", 0.2)
            .with("contact", vec![1.0, 2.0, 3.0]);
        assert_eq!(pars.scalar("beta").unwrap(), 0.2);
        assert_eq!(pars.array("contact").unwrap(), &[1.0, 2.0, 3.0]);
        assert_eq!(pars.array("beta").unwrap(), &[0.2]);
        assert!(matches!(
            pars.scalar("contact"),
            Err(MontyError::ShapeMismatch { .. })
        ));
        assert!(matches!(pars.scalar("gamma"), Err(MontyError::UnknownName(_))));
    }

    #[test]
    fn merge_overwrites() {
        let mut pars: Parameters = [("a", 1.0), ("b", 2.0)].into_iter().collect();
        pars.merge(&Parameters::new().with("b", 5.0).with("c", 3.0));
        assert_eq!(pars.scalar("b").unwrap(), 5.0);
        assert_eq!(pars.len(), 3);
    }

    #[test]
    fn array_shape_is_checked() {
        assert!(ParValue::array(vec![1.0, 2.0], vec![2, 2]).is_err());
        let v = ParValue::array(vec![1.0; 6], vec![2, 3]).unwrap();
        assert_eq!(v.shape(), &[2, 3]);
        assert_eq!(v.len(), 6);
    }
}

/*!
Mapping between the flat parameter vectors that samplers move around and the
named [`Parameters`] that systems and density functions consume.

The vector layout is fixed at construction: scalars first, in declaration
order, then arrays in declaration order, each flattened row-major. Fixed
values are merged into every unpacked set but never appear in the vector.

```rust
use mini_monty::packer::Packer;
use mini_monty::params::Parameters;

let packer = Packer::new(["beta", "gamma"])
    .unwrap()
    .with_array("contact", vec![2])
    .unwrap()
    .with_fixed(Parameters::new().with("N", 1000.0))
    .unwrap();
assert_eq!(packer.len(), 4);
assert_eq!(packer.names(), vec!["beta", "gamma", "contact[1]", "contact[2]"]);

let pars = packer.unpack(&[0.2, 0.1, 1.0, 0.5]).unwrap();
assert_eq!(pars.scalar("N").unwrap(), 1000.0);
assert_eq!(packer.pack(&pars).unwrap(), vec![0.2, 0.1, 1.0, 0.5]);
```
*/

use std::collections::BTreeSet;

use ndarray::ArrayView2;

use crate::error::{MontyError, Result};
use crate::params::{ParValue, Parameters};

#[derive(Debug, Clone, PartialEq)]
pub struct Packer {
    scalars: Vec<String>,
    arrays: Vec<(String, Vec<usize>)>,
    fixed: Parameters,
    len: usize,
}

impl Packer {
    /// Create a packer over the given scalar names.
    pub fn new<S: Into<String>>(scalars: impl IntoIterator<Item = S>) -> Result<Self> {
        let scalars: Vec<String> = scalars.into_iter().map(Into::into).collect();
        let mut seen = BTreeSet::new();
        for name in &scalars {
            if !seen.insert(name.as_str()) {
                return Err(MontyError::NameCollision(name.clone()));
            }
        }
        let len = scalars.len();
        Ok(Self {
            scalars,
            arrays: Vec::new(),
            fixed: Parameters::new(),
            len,
        })
    }

    /// Append an array parameter of the given shape.
    pub fn with_array(mut self, name: impl Into<String>, shape: Vec<usize>) -> Result<Self> {
        let name = name.into();
        if self.is_declared(&name) || self.fixed.contains(&name) {
            return Err(MontyError::NameCollision(name));
        }
        if shape.is_empty() || shape.contains(&0) {
            return Err(MontyError::invalid(format!(
                "array '{name}' must have a non-empty shape with positive extents"
            )));
        }
        self.len += shape.iter().product::<usize>();
        self.arrays.push((name, shape));
        Ok(self)
    }

    /// Values merged into every unpacked parameter set.
    pub fn with_fixed(mut self, fixed: Parameters) -> Result<Self> {
        if let Some(name) = fixed.names().find(|n| self.is_declared(n)) {
            return Err(MontyError::NameCollision(name.to_string()));
        }
        self.fixed = fixed;
        Ok(self)
    }

    fn is_declared(&self, name: &str) -> bool {
        self.scalars.iter().any(|s| s == name) || self.arrays.iter().any(|(a, _)| a == name)
    }

    /// Length of the packed vector.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn fixed(&self) -> &Parameters {
        &self.fixed
    }

    /// One name per vector element; array elements are written `x[i]` (or
    /// `x[i,j]`), 1-based.
    pub fn names(&self) -> Vec<String> {
        let mut names = self.scalars.clone();
        for (name, shape) in &self.arrays {
            let n: usize = shape.iter().product();
            for flat in 0..n {
                let mut rest = flat;
                let mut idx = vec![0; shape.len()];
                for (d, &extent) in shape.iter().enumerate().rev() {
                    idx[d] = rest % extent + 1;
                    rest /= extent;
                }
                let idx: Vec<String> = idx.iter().map(ToString::to_string).collect();
                names.push(format!("{name}[{}]", idx.join(",")));
            }
        }
        names
    }

    /// Flatten named values into a vector. Fixed names are ignored; any other
    /// name not declared by the packer is an error.
    pub fn pack(&self, pars: &Parameters) -> Result<Vec<f64>> {
        if let Some(name) = pars
            .names()
            .find(|n| !self.is_declared(n) && !self.fixed.contains(n))
        {
            return Err(MontyError::UnknownName(name.to_string()));
        }
        let mut out = Vec::with_capacity(self.len);
        for name in &self.scalars {
            match pars.get(name) {
                Some(ParValue::Scalar(x)) => out.push(*x),
                Some(v) => return Err(MontyError::shape(format!("parameter '{name}'"), 1, v.len())),
                None => return Err(MontyError::shape(format!("parameter '{name}'"), 1, 0)),
            }
        }
        for (name, shape) in &self.arrays {
            let n: usize = shape.iter().product();
            let values = pars.get(name).map(ParValue::as_slice).unwrap_or(&[]);
            if values.len() != n {
                return Err(MontyError::shape(format!("parameter '{name}'"), n, values.len()));
            }
            out.extend_from_slice(values);
        }
        Ok(out)
    }

    /// Build named values from a vector, merging in the fixed values.
    pub fn unpack(&self, theta: &[f64]) -> Result<Parameters> {
        if theta.len() != self.len {
            return Err(MontyError::shape("parameter vector", self.len, theta.len()));
        }
        let mut pars = self.fixed.clone();
        let (scalars, mut rest) = theta.split_at(self.scalars.len());
        for (name, &x) in self.scalars.iter().zip(scalars) {
            pars.insert(name.clone(), x);
        }
        for (name, shape) in &self.arrays {
            let n: usize = shape.iter().product();
            let (values, tail) = rest.split_at(n);
            pars.insert(name.clone(), ParValue::array(values.to_vec(), shape.clone())?);
            rest = tail;
        }
        Ok(pars)
    }

    /// Unpack every column of a `parameter × draw` matrix.
    pub fn unpack_batch(&self, thetas: ArrayView2<f64>) -> Result<Vec<Parameters>> {
        if thetas.nrows() != self.len {
            return Err(MontyError::shape("parameter matrix rows", self.len, thetas.nrows()));
        }
        thetas
            .columns()
            .into_iter()
            .map(|col| self.unpack(&col.to_vec()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn packer() -> Packer {
        Packer::new(["a", "b"])
            .unwrap()
            .with_array("m", vec![2, 2])
            .unwrap()
            .with_fixed(Parameters::new().with("n", 10.0))
            .unwrap()
    }

    #[test]
    fn pack_ignores_fixed_values() {
        let p = packer();
        let pars = p.unpack(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(pars.scalar("n").unwrap(), 10.0);
        assert_eq!(pars.get("m").unwrap().shape(), &[2, 2]);
        assert_eq!(p.pack(&pars).unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn names_expand_arrays() {
        assert_eq!(
            packer().names(),
            vec!["a", "b", "m[1,1]", "m[1,2]", "m[2,1]", "m[2,2]"]
        );
    }

    #[test]
    fn collisions_are_rejected() {
        assert!(matches!(Packer::new(["a", "a"]), Err(MontyError::NameCollision(_))));
        let res = Packer::new(["a"]).unwrap().with_fixed(Parameters::new().with("a", 1.0));
        assert!(matches!(res, Err(MontyError::NameCollision(_))));
        let res = Packer::new(["a"]).unwrap().with_array("a", vec![3]);
        assert!(matches!(res, Err(MontyError::NameCollision(_))));
    }

    #[test]
    fn misuse_is_reported() {
        let p = packer();
        assert!(matches!(p.unpack(&[1.0]), Err(MontyError::ShapeMismatch { .. })));
        let extra = p
            .unpack(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
            .unwrap()
            .with("z", 1.0);
        assert!(matches!(p.pack(&extra), Err(MontyError::UnknownName(n)) if n == "z"));
        let short = Parameters::new()
            .with("a", 1.0)
            .with("b", 2.0)
            .with("m", vec![1.0, 2.0]);
        assert!(matches!(p.pack(&short), Err(MontyError::ShapeMismatch { .. })));
    }

    #[test]
    fn unpack_batch_reads_columns() {
        let p = Packer::new(["x", "y"]).unwrap();
        let sets = p.unpack_batch(array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]].view()).unwrap();
        assert_eq!(sets.len(), 3);
        assert_eq!(sets[2].scalar("y").unwrap(), 6.0);
    }
}

//! Error types shared by every component of the crate.
//!
//! Contract violations (bad shapes, unknown names, incompatible domains,
//! requests for artifacts that were never recorded) are reported as `Err`
//! before any simulation or sampling work starts. Numerical degeneracy during
//! sampling is *not* an error: it is recorded as a `-inf` log-density and the
//! run continues.

use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MontyError {
    /// `simulate`/`step_to` was asked to move to a time in the past, or was
    /// given times that are not strictly increasing.
    #[error("time {requested} is not after current time {current}")]
    TimeOrder { requested: f64, current: f64 },

    /// A distribution was asked to draw with invalid arguments.
    #[error("invalid parameters for {distribution} distribution: {reason}")]
    DistributionParameter {
        distribution: &'static str,
        reason: String,
    },

    /// A vector or array did not have the length/shape that was declared.
    #[error("shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    #[error("unknown name '{0}'")]
    UnknownName(String),

    #[error("name '{0}' is used more than once")]
    NameCollision(String),

    /// Composition of two models whose domains do not overlap in some dimension.
    #[error("domains do not intersect in dimension {dim} ('{name}')")]
    IncompatibleDomain { dim: usize, name: String },

    #[error("point is outside the model domain in dimension {dim}: {value} not in [{lower}, {upper}]")]
    OutOfDomain {
        dim: usize,
        value: f64,
        lower: f64,
        upper: f64,
    },

    /// Extraction of trajectories/state/snapshots that were not enabled
    /// before the filter ran.
    #[error("{0} were not saved; enable them before running the filter")]
    ArtifactNotSaved(&'static str),

    /// Every particle had zero likelihood at the given time.
    #[error("all particles have zero likelihood at time {time}")]
    DegenerateFilter { time: f64 },

    #[error("model does not support {0}")]
    MissingCapability(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, MontyError>;

impl MontyError {
    /// Whether a sampler may treat this error as a zero-density point and
    /// carry on, rather than abort the chain.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MontyError::DistributionParameter { .. }
                | MontyError::DegenerateFilter { .. }
                | MontyError::OutOfDomain { .. }
        )
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        MontyError::InvalidArgument(msg.into())
    }

    pub(crate) fn distribution(distribution: &'static str, reason: impl Into<String>) -> Self {
        MontyError::DistributionParameter {
            distribution,
            reason: reason.into(),
        }
    }

    pub(crate) fn shape(what: impl Into<String>, expected: usize, actual: usize) -> Self {
        MontyError::ShapeMismatch {
            what: what.into(),
            expected,
            actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_values() {
        let err = MontyError::TimeOrder {
            requested: 1.0,
            current: 2.0,
        };
        assert_eq!(err.to_string(), "time 1 is not after current time 2");

        let err = MontyError::shape("parameter vector", 3, 2);
        assert_eq!(
            err.to_string(),
            "shape mismatch for parameter vector: expected 3, got 2"
        );

        let err = MontyError::ArtifactNotSaved("trajectories");
        assert!(err.to_string().starts_with("trajectories were not saved"));
        assert!(!err.is_recoverable());
        assert!(MontyError::DegenerateFilter { time: 1.0 }.is_recoverable());
    }
}

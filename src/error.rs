use thiserror::Error;

/// Estimator error types
///
/// Numerical singularity is not represented here: the matrix primitives
/// report it through a `bool` and the estimator falls back to integrating.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EkfError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Sensor '{0}' has no measurement")]
    UnsetMeasurement(String),
}

/// Result type for estimator operations
pub type EkfResult<T> = Result<T, EkfError>;

/// Fails with [`EkfError::InvalidArgument`] unless `actual == expected`.
pub(crate) fn check_size(what: &str, actual: usize, expected: usize) -> EkfResult<()> {
    if actual != expected {
        return Err(EkfError::InvalidArgument(format!(
            "{what}: expected {expected} rows, got {actual}"
        )));
    }
    Ok(())
}

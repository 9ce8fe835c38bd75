use thiserror::Error;

/// Typed failure conditions of the likelihood core.
///
/// The conditions travel inside [`anyhow::Error`] and can be recovered with
/// `err.downcast_ref::<ModelError>()`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    /// Invalid model parameters or frequencies handed to the rate matrix builder,
    /// or a model description that does not fit the data.
    #[error("Invalid model configuration: {0}")]
    ModelConfiguration(String),
    /// Complex eigenvalues where a real decomposition was assumed, or a singular
    /// eigenvector basis.
    #[error("Numerical degeneracy: {0}")]
    NumericalDegeneracy(String),
    /// The parameter layout was changed or violated during an optimisation run.
    #[error("Model state inconsistency: {0}")]
    ModelStateInconsistency(String),
}

impl ModelError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ModelError::ModelStateInconsistency(_))
    }
}

/// Returns the [`ModelError`] carried by `err`, if any.
pub fn model_error(err: &anyhow::Error) -> Option<&ModelError> {
    err.downcast_ref::<ModelError>()
}

/// Malformed input data handed to the core, e.g. unaligned sequences or unknown taxa.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct DataError {
    pub message: String,
}

impl DataError {
    pub fn new(message: String) -> Self {
        Self { message }
    }
}

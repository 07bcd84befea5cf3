//! Error type shared by the whole crate.

/// Errors raised while configuring or running a VMC fit.
#[derive(Debug, thiserror::Error)]
pub enum VmcError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("shape mismatch: expected {expected}, found {found}")]
    ShapeMismatch { expected: usize, found: usize },

    #[error("LU factorization failed for batch entries {indices:?}")]
    SingularMatrix { indices: Vec<usize> },

    #[error("layer registration failed: {0}")]
    Registration(String),

    #[error("empty batch")]
    EmptyBatch,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, VmcError>;

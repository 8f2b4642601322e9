use thiserror::Error;

/// Failures assembling the host platform.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("missing or invalid environment variable {name}: {reason}")]
    Env { name: &'static str, reason: String },

    #[error("invalid address {0:?}")]
    Addr(String),
}

use candle_util::candle_core;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MultimilError>;

#[derive(Error, Debug)]
pub enum MultimilError {
    /// Invalid model or data configuration, raised at construction
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A call-site invariant does not hold
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MultimilError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }
}

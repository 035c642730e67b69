use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("shape mismatch for {what}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("rollout buffer overflow: {capacity} steps stored without a clear")]
    BufferOverflow { capacity: usize },

    #[error("non-finite {what} ({value}) in update {update}")]
    NonFinite {
        what: &'static str,
        update: usize,
        value: f32,
    },

    #[error("checkpoint {path:?} matched none of this network's parameters")]
    UnusableCheckpoint { path: PathBuf },

    #[error("invalid config: {0}")]
    Config(String),

    #[error("coordinator protocol violation: {0}")]
    Protocol(&'static str),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

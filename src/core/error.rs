use thiserror::Error;

/// Failures surfaced by the registry, tokenizer facade and generation engine.
///
/// The host boundary in [`crate::api`] collapses these into sentinels; everything
/// below it carries the real cause.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("model registry is full ({capacity} models loaded)")]
    CapacityExceeded { capacity: usize },

    #[error("failed to load model from {path}: {reason}")]
    LoadFailed { path: String, reason: String },

    #[error("invalid model handle {0}")]
    InvalidHandle(i64),

    #[error("text needs at least {required} tokens but the tokenizer buffer holds {capacity}")]
    TokenizeOverflow { required: usize, capacity: usize },

    #[error("decode failed at position {position}: {reason}")]
    DecodeFailed { position: usize, reason: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl Error {
    pub fn load_failed(path: impl Into<String>, reason: impl ToString) -> Self {
        Error::LoadFailed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn decode_failed(position: usize, reason: impl ToString) -> Self {
        Error::DecodeFailed {
            position,
            reason: reason.to_string(),
        }
    }
}

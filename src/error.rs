//! Error taxonomy for catalog registration and checkpoint resolution.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::Dtype;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, LoaderError>;

/// Every failure a resolution call can surface. A resolution either returns a
/// fully populated [`crate::ResolvedModel`] or one of these; there is no
/// partially loaded state.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// A catalog key was registered twice without the override flag.
    #[error("model type `{0}` is already registered in the catalog")]
    DuplicateKey(String),

    /// Lookup of an unregistered model type.
    #[error("unknown model type `{0}`")]
    UnknownModel(String),

    /// A dependency constraint declared by the catalog entry is not met by
    /// the hosting runtime.
    #[error("model type `{key}` requires `{requirement}`, installed: {installed}")]
    UnsatisfiedRequirement {
        key: String,
        requirement: String,
        installed: String,
    },

    /// The caller asked for a precision that conflicts with the entry's
    /// pinned dtype.
    #[error("model type `{key}` is pinned to {declared}, requested {requested}")]
    PrecisionMismatch {
        key: String,
        declared: Dtype,
        requested: Dtype,
    },

    /// Caller-supplied context length exceeds what the model supports.
    #[error("requested max length {requested} exceeds the model limit {supported}")]
    ContextLengthExceeded { requested: usize, supported: usize },

    /// The tokenizer ended resolution without an end-of-sequence token.
    #[error("tokenizer for `{0}` has no eos token after reconciliation")]
    MissingEos(String),

    /// Adapter weights target modules the base model does not have.
    #[error("adapter targets module `{module}` which is absent from the `{key}` module tree")]
    AdapterIncompatible { key: String, module: String },

    /// A quantization family needs a runtime extension that is not compiled
    /// in or installed.
    #[error("`{key}` needs the `{extension}` runtime extension, which is unavailable")]
    MissingExtension { key: String, extension: String },

    /// A load-time patch could not be applied, which means the runtime
    /// library version does not match what the family loader expects.
    #[error("loader for `{key}` is incompatible with the runtime: {reason}")]
    LoaderIncompatible { key: String, reason: String },

    /// Checkpoint directory is held by another operation (merge/export vs. load).
    #[error("checkpoint directory {0} is locked by another operation")]
    CheckpointBusy(PathBuf),

    /// Checkpoint metadata was missing or malformed.
    #[error("invalid checkpoint at {path}: {reason}")]
    InvalidCheckpoint { path: PathBuf, reason: String },

    /// Remote hub failure surfaced by the primary provider.
    #[error("hub error: {0}")]
    Hub(#[from] hf_hub::api::tokio::ApiError),

    /// Remote hub failure surfaced by the mirror provider.
    #[error("download failed for `{file}`: {reason}")]
    Download { file: String, reason: String },

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("runtime error: {0}")]
    Runtime(#[from] candle_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LoaderError {
    pub(crate) fn invalid_checkpoint(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidCheckpoint {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

// `tokenizers::Error` is a boxed trait object, so it cannot ride the
// derived `#[from]` path.
impl From<tokenizers::Error> for LoaderError {
    fn from(e: tokenizers::Error) -> Self {
        Self::Tokenizer(e.to_string())
    }
}

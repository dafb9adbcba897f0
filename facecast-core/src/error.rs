use thiserror::Error;

/// All errors produced by facecast-core.
#[derive(Debug, Error)]
pub enum FacecastError {
    /// Malformed or inconsistent configuration document.
    #[error("config error: {0}")]
    Config(String),

    /// An operation needed a resource (model, solve data) that was never loaded.
    #[error("{0} not loaded")]
    Uninitialized(&'static str),

    /// Unrecognised magic, version or type descriptor in a binary container.
    #[error("format error: {0}")]
    Format(String),

    /// Index, length or name outside the accepted range.
    #[error("range error: {0}")]
    Range(String),

    /// The inference engine failed to run. Never retried.
    #[error("inference error: {0}")]
    Inference(String),

    #[error("ONNX session error: {0}")]
    OnnxSession(String),

    #[error("model file not found: {path}")]
    ModelNotFound { path: std::path::PathBuf },

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FacecastError {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub(crate) fn range(msg: impl Into<String>) -> Self {
        Self::Range(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, FacecastError>;

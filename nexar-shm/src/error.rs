use crate::types::Rank;

pub type Result<T> = std::result::Result<T, ShmCommError>;

#[derive(Debug, thiserror::Error)]
pub enum ShmCommError {
    #[error("shared segment {path}: {reason}")]
    Segment { path: String, reason: String },

    #[error("cross-process memory error: {message}")]
    Xmem {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("topology error: {reason}")]
    Topology { reason: String },

    #[error("no locality is common to all participants")]
    NoCommonLocality,

    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    #[error("bootstrap exchange failed: {reason}")]
    Bootstrap { reason: String },

    #[error("record encode failed: {0}")]
    EncodeFailed(String),

    #[error("record decode failed: {0}")]
    DecodeFailed(String),

    #[error("initialization aborted during {stage}: a participant reported failure")]
    InitAborted { stage: &'static str },

    #[error("unsupported data type: {dtype:?} for operation {op}")]
    UnsupportedDType {
        dtype: crate::types::DataType,
        op: &'static str,
    },

    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("invalid rank {rank}: world size is {world_size}")]
    InvalidRank { rank: Rank, world_size: u32 },

    #[error("{operation} not supported by the shared-memory engine: {reason}")]
    Unsupported {
        operation: &'static str,
        reason: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShmCommError {
    /// Create a `Segment` error for the given backing path.
    pub fn segment(path: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Self::Segment {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    /// Create an `Xmem` error with just a message.
    pub fn xmem(msg: impl Into<String>) -> Self {
        Self::Xmem {
            message: msg.into(),
            source: None,
        }
    }

    /// Create an `Xmem` error with a message and a source error.
    pub fn xmem_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Xmem {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn topology(reason: impl Into<String>) -> Self {
        Self::Topology {
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    pub fn bootstrap(reason: impl Into<String>) -> Self {
        Self::Bootstrap {
            reason: reason.into(),
        }
    }
}

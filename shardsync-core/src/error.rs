use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Local root or local file path is missing or of the wrong kind.
    #[error("path error: {0}")]
    Path(String),

    /// Snapshot cache is a directory or cannot be parsed.
    #[error("snapshot cache format error: {0}")]
    CacheFormat(String),

    /// Fewer than `data_shards` blobbers agree on a path or answered at all.
    #[error("consensus not reached for {path}: {detail}")]
    Consensus { path: String, detail: String },

    #[error("blobber {blobber_id} request failed: {message}")]
    Blobber { blobber_id: String, message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

impl SyncError {
    pub fn consensus(path: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Consensus {
            path: path.into(),
            detail: detail.into(),
        }
    }

    pub fn blobber(blobber_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Blobber {
            blobber_id: blobber_id.into(),
            message: message.into(),
        }
    }
}

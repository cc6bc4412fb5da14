use thiserror::Error;

/// Error taxonomy for the archiving pipeline.
///
/// Handler failures travel back to the queue manager as `"<kind>: <detail>"`
/// strings (see [`ArchiveError::as_handler_error`]); the metrics histogram
/// keys on the text before the first colon, so `kind()` values are stable.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("queue is full")]
    QueueFull,
    #[error("duplicate url already queued: {0}")]
    Duplicate(String),
    #[error("queue manager is shutting down")]
    Shutdown,
    #[error("missing guild configuration: {0}")]
    ConfigMissing(String),
    #[error("unsupported url: {0}")]
    UnsupportedUrl(String),
    #[error("download failed: {0}")]
    DownloadFailed(String),
    #[error("verification failed: {0}")]
    VerificationFailed(String),
    #[error("compression failed: {0}")]
    CompressionError(String),
    #[error("hardware acceleration failed: {0}")]
    HardwareAccelFailed(String),
    #[error("upload failed: {0}")]
    UploadFailed(String),
    #[error("archive index error: {0}")]
    IndexError(String),
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("required external tool missing: {0}")]
    ToolMissing(String),
    #[error("persisted state unreadable: {0}")]
    PersistenceCorrupted(String),
}

impl ArchiveError {
    /// Stable kind tag used for metrics bucketing and handler error strings.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::QueueFull => "QueueFull",
            Self::Duplicate(_) => "Duplicate",
            Self::Shutdown => "Shutdown",
            Self::ConfigMissing(_) => "ConfigMissing",
            Self::UnsupportedUrl(_) => "UnsupportedURL",
            Self::DownloadFailed(_) => "DownloadFailed",
            Self::VerificationFailed(_) => "VerificationFailed",
            Self::CompressionError(_) => "CompressionError",
            Self::HardwareAccelFailed(_) => "HardwareAccelFailed",
            Self::UploadFailed(_) => "UploadFailed",
            Self::IndexError(_) => "IndexError",
            Self::Timeout(_) => "Timeout",
            Self::ToolMissing(_) => "ToolMissing",
            Self::PersistenceCorrupted(_) => "PersistenceCorrupted",
        }
    }

    /// Format for the queue handler contract: `"<kind>: <detail>"`.
    pub fn as_handler_error(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }

    /// Fatal errors abort initialization; everything else is handled by the
    /// retry/recovery machinery.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ToolMissing(_))
    }
}

impl From<rusqlite::Error> for ArchiveError {
    fn from(err: rusqlite::Error) -> Self {
        Self::IndexError(err.to_string())
    }
}

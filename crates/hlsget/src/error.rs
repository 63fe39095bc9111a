use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("segment fetch error: {reason}")]
    SegmentFetch { reason: String },

    #[error("merge failed: {reason}")]
    Merge { reason: String },

    #[error("storage error: {reason}")]
    Storage { reason: String },

    #[error("download not found: {id}")]
    NotFound { id: String },

    #[error("invalid state for {operation}: download is {status}")]
    InvalidState {
        operation: &'static str,
        status: String,
    },

    #[error("download has no segments")]
    NoSegments,

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl DownloadError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn playlist(reason: impl Into<String>) -> Self {
        Self::Playlist {
            reason: reason.into(),
        }
    }

    pub fn segment_fetch(reason: impl Into<String>) -> Self {
        Self::SegmentFetch {
            reason: reason.into(),
        }
    }

    pub fn merge(reason: impl Into<String>) -> Self {
        Self::Merge {
            reason: reason.into(),
        }
    }

    pub fn storage(reason: impl Into<String>) -> Self {
        Self::Storage {
            reason: reason.into(),
        }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    /// Whether another attempt at the same operation could succeed.
    ///
    /// Cancellation and caller mistakes (bad URLs, wrong lifecycle state) are
    /// permanent; transport, status, and empty-body failures are transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled
            | Self::InvalidUrl { .. }
            | Self::NotFound { .. }
            | Self::InvalidState { .. }
            | Self::NoSegments => false,
            Self::HttpStatus { .. }
            | Self::Network { .. }
            | Self::Io { .. }
            | Self::Playlist { .. }
            | Self::SegmentFetch { .. }
            | Self::Merge { .. }
            | Self::Storage { .. }
            | Self::Internal { .. } => true,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<sqlx::Error> for DownloadError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage {
            reason: err.to_string(),
        }
    }
}

pub type Result<T, E = DownloadError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_is_not_retryable() {
        assert!(!DownloadError::Cancelled.is_retryable());
        assert!(DownloadError::Cancelled.is_cancelled());
    }

    #[test]
    fn transient_errors_are_retryable() {
        assert!(DownloadError::segment_fetch("HTTP 500").is_retryable());
        assert!(
            DownloadError::http_status(StatusCode::BAD_GATEWAY, "http://a/seg.ts", "segment fetch")
                .is_retryable()
        );
    }

    #[test]
    fn lifecycle_errors_are_permanent() {
        let err = DownloadError::InvalidState {
            operation: "retry_merge",
            status: "downloading".to_string(),
        };
        assert!(!err.is_retryable());
    }
}

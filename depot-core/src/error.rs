use thiserror::Error;

/// Errors shared across the broker, publisher, and subscriber services.
#[derive(Error, Debug)]
pub enum DepotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid path: {0}")]
    PathInvalid(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("etag mismatch for {path}: recorded {recorded:?}, current {current:?}")]
    EtagMismatch {
        path: String,
        recorded: String,
        current: String,
    },

    #[error("{0}")]
    SliceUnsupported(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("corrupt chunk: {0}")]
    CorruptChunk(String),

    #[error("cache quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("upstream rejected credentials")]
    AuthRejected,

    #[error("container error: {0}")]
    Container(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DepotError {
    /// Stable machine-readable code carried in client-facing error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PathInvalid(_) => "path_invalid",
            Self::NotFound(_) => "not_found",
            Self::EtagMismatch { .. } => "etag_mismatch",
            Self::SliceUnsupported(_) => "slice_unsupported",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::CorruptChunk(_) => "corrupt_chunk",
            Self::QuotaExceeded(_) => "quota_exceeded",
            Self::AuthRejected => "auth_rejected",
            Self::Io(_) | Self::Container(_) | Self::Serialization(_) | Self::Internal(_) => {
                "internal"
            }
        }
    }

    /// HTTP status the error surfaces as when it reaches a client.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::PathInvalid(_) | Self::SliceUnsupported(_) => 400,
            Self::AuthRejected => 401,
            Self::NotFound(_) => 404,
            Self::EtagMismatch { .. } => 409,
            Self::CorruptChunk(_) => 502,
            Self::UpstreamUnavailable(_) => 503,
            Self::QuotaExceeded(_) => 507,
            Self::Io(_) | Self::Container(_) | Self::Serialization(_) | Self::Internal(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, DepotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_statuses() {
        let err = DepotError::PathInvalid("../x".into());
        assert_eq!(err.code(), "path_invalid");
        assert_eq!(err.http_status(), 400);

        let err = DepotError::EtagMismatch {
            path: "a".into(),
            recorded: "1:1".into(),
            current: "2:2".into(),
        };
        assert_eq!(err.code(), "etag_mismatch");
        assert_eq!(err.http_status(), 409);

        let err = DepotError::QuotaExceeded("cache full".into());
        assert_eq!(err.http_status(), 507);
    }
}

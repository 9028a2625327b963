//! Errors returned by [`MetricsApi`](crate::MetricsApi) implementations.

/// Client error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The API rejected the call because the caller exceeded its request rate.
    #[error("request limit reached in region {region}")]
    Throttled {
        /// Region that throttled the call.
        region: String,
    },

    /// The API processed the call and returned an error.
    #[error("remote error ({code}): {message}")]
    Remote {
        /// Error code reported by the API.
        code: String,
        /// Error message reported by the API.
        message: String,
    },

    /// No client could be created for the region.
    #[error("no client available for region '{0}'")]
    Unavailable(String),

    /// The API returned something that could not be interpreted.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Convenience alias for results of client calls.
pub type Result<T, E = Error> = std::result::Result<T, E>;

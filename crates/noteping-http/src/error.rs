//! Error types for the HTTP backend

use thiserror::Error;

/// Failures building an [`HttpBackend`](crate::HttpBackend)
#[derive(Debug, Error)]
pub enum HttpError {
    /// Configured base URL does not parse
    #[error("invalid backend base URL {url:?}: {source}")]
    InvalidBaseUrl {
        /// The configured value
        url: String,
        /// Parse failure
        #[source]
        source: url::ParseError,
    },

    /// Base URL cannot carry paths (e.g. `mailto:`)
    #[error("backend base URL {0:?} cannot be a base")]
    NotABase(String),

    /// TLS or client initialization failed
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

//! Error types for transport and helper operations

use std::error::Error;

/// Transport-level errors that occur during HTTP communication
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum TransportError {
    /// Failed to establish connection to server
    #[error("Connection error: {0}")]
    #[diagnostic(
        code(browserid_common::connect),
        help("check network connectivity and that the local proxy is running")
    )]
    Connect(String),

    /// Request timed out
    #[error("Request timeout")]
    #[diagnostic(code(browserid_common::timeout))]
    Timeout,

    /// Request construction failed (malformed URI, headers, etc.)
    #[error("Invalid request: {0}")]
    #[diagnostic(code(browserid_common::invalid_request))]
    InvalidRequest(String),

    /// Other transport error
    #[error("Transport error: {0}")]
    #[diagnostic(code(browserid_common::other))]
    Other(Box<dyn Error + Send + Sync>),
}

impl TransportError {
    /// Convert an arbitrary client error into a transport error.
    ///
    /// Errors that already are a [`TransportError`] (or a `reqwest::Error`, with
    /// the `reqwest-client` feature) keep their classification; anything else
    /// lands in [`TransportError::Other`].
    pub fn from_client<E>(err: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        let boxed: Box<dyn Error + Send + Sync> = Box::new(err);
        let boxed = match boxed.downcast::<TransportError>() {
            Ok(e) => return *e,
            Err(other) => other,
        };
        #[cfg(feature = "reqwest-client")]
        let boxed = match boxed.downcast::<reqwest::Error>() {
            Ok(e) => return TransportError::from(*e),
            Err(other) => other,
        };
        TransportError::Other(boxed)
    }
}

#[cfg(feature = "reqwest-client")]
impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::Connect(e.to_string())
        } else if e.is_builder() || e.is_request() {
            Self::InvalidRequest(e.to_string())
        } else {
            Self::Other(Box::new(e))
        }
    }
}

impl From<http::Error> for TransportError {
    fn from(e: http::Error) -> Self {
        Self::InvalidRequest(e.to_string())
    }
}

/// Errors reported by an external proxy helper
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum HelperError {
    /// The helper process is not installed
    #[error("proxy helper is not installed")]
    #[diagnostic(
        code(browserid_common::helper_not_installed),
        help("install the proxy helper application or route traffic directly")
    )]
    NotInstalled,

    /// The helper refuses to be started by other applications
    #[error("proxy helper does not accept start requests")]
    #[diagnostic(
        code(browserid_common::helper_starts_disabled),
        help("enable background starts in the proxy helper's settings")
    )]
    StartsDisabled,

    /// Sending the start request failed
    #[error("failed to request proxy helper start: {0}")]
    #[diagnostic(code(browserid_common::helper_start_failed))]
    StartFailed(String),

    /// The helper reported a status string we do not understand
    #[error("unknown proxy helper status: {0:?}")]
    #[diagnostic(
        code(browserid_common::helper_status),
        help("expected one of OFF, ON, STARTING, STOPPING, STARTS_DISABLED")
    )]
    InvalidStatus(String),
}

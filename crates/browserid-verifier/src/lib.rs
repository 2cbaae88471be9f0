//! Remote BrowserID assertion verification
//!
//! Posts an `{audience, assertion}` pair to a verifier service and reports the
//! verdict, either as a future or through a single-shot delegate.
//!
//! ## Quick start
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use browserid_verifier::RemoteVerifierClient;
//!
//! let client: RemoteVerifierClient = RemoteVerifierClient::default();
//!
//! let verified = client
//!     .verify_async("https://example.com", "eyJhbGciOi...~eyJhbGciOi...")
//!     .await?;
//! println!("{} verified for {}", verified.email.unwrap_or_default(), verified.audience);
//! # Ok(())
//! # }
//! ```
//!
//! ## Delegate style
//!
//! [`RemoteVerifierClient::verify`] validates its inputs, dispatches the
//! request onto the current Tokio runtime and returns immediately. Exactly one
//! of [`VerifierDelegate::handle_success`] or [`VerifierDelegate::handle_error`]
//! runs later, on a runtime worker thread:
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use browserid_verifier::{RemoteVerifierClient, Verified, VerifierError};
//!
//! let client: RemoteVerifierClient = RemoteVerifierClient::default();
//! let report = |result: Result<Verified, VerifierError>| match result {
//!     Ok(verified) => println!("ok: {:?}", verified.email),
//!     Err(e) => eprintln!("verification failed: {e}"),
//! };
//! client.verify("https://example.com", "assertion", report)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Customization
//!
//! ```
//! use browserid_verifier::RemoteVerifierClient;
//! use browserid_verifier::verifier::{ProtocolVersion, VerifierOptions};
//! use browserid_common::http_client::{ClientOptions, build_reqwest_client};
//! use browserid_common::proxy::FixedProxy;
//! use std::sync::Arc;
//!
//! // Route verifier traffic through the local Tor proxy
//! let http = build_reqwest_client(
//!     &ClientOptions::new().proxy(Arc::new(FixedProxy::default())).build(),
//! ).unwrap();
//!
//! let client = RemoteVerifierClient::new(http, VerifierOptions::default())
//!     .with_protocol(ProtocolVersion::V2)
//!     .with_validate_audience(true);
//! ```

#![warn(missing_docs)]
pub mod verifier;

pub use browserid_common::{self as common, http_client::HttpClient};
pub use verifier::{
    AssertionVerifier, Rejection, VerificationRequest, Verified, VerifierDelegate, VerifierError,
    VerifierErrorKind, VerifierOptions, VerifierResponse,
};

use crate::verifier::ProtocolVersion;
use browserid_common::error::TransportError;
use tokio::sync::oneshot;
use url::Url;

/// Verification client speaking to a remote verifier over an injected transport.
///
/// Calls share no mutable state: every verification builds and owns its own
/// request, so the client can be cloned and used from many tasks at once.
#[derive(Debug, Clone)]
pub struct RemoteVerifierClient<T = reqwest::Client> {
    http: T,
    opts: VerifierOptions,
}

impl<T> RemoteVerifierClient<T> {
    /// Create a client over `http` with the given options
    pub fn new(http: T, opts: VerifierOptions) -> Self {
        #[cfg(feature = "tracing")]
        tracing::info!(
            endpoint = %opts.endpoint,
            protocol = ?opts.protocol,
            validate_audience = opts.validate_audience,
            "verifier client created"
        );

        Self { http, opts }
    }

    /// Set the verifier endpoint
    pub fn with_endpoint(mut self, endpoint: Url) -> Self {
        self.opts.endpoint = endpoint;
        self
    }

    /// Set the protocol version
    pub fn with_protocol(mut self, protocol: ProtocolVersion) -> Self {
        self.opts.protocol = protocol;
        self
    }

    /// Enable/disable audience validation of successful responses
    pub fn with_validate_audience(mut self, enable: bool) -> Self {
        self.opts.validate_audience = enable;
        self
    }

    /// The configured verifier endpoint
    pub fn endpoint(&self) -> &Url {
        &self.opts.endpoint
    }

    /// The underlying transport
    pub fn http(&self) -> &T {
        &self.http
    }

    /// Build the HTTP request for a verification without sending it
    pub fn build_request(
        &self,
        request: &VerificationRequest,
    ) -> Result<http::Request<Vec<u8>>, VerifierError> {
        let body = request.encode(self.opts.protocol)?;
        http::Request::builder()
            .method(http::Method::POST)
            .uri(self.opts.endpoint.as_str())
            .header(http::header::CONTENT_TYPE, self.opts.protocol.content_type())
            .header(http::header::ACCEPT, "application/json")
            .body(body)
            .map_err(|e| VerifierError::Encode(e.to_string()))
    }

    fn interpret(
        &self,
        response: http::Response<Vec<u8>>,
        audience: String,
    ) -> Result<Verified, VerifierError> {
        let response = VerifierResponse::from_http(response, Some(audience));
        if self.opts.validate_audience {
            response.parse_validated()
        } else {
            response.parse()
        }
    }
}

impl Default for RemoteVerifierClient<reqwest::Client> {
    fn default() -> Self {
        Self::new(reqwest::Client::new(), VerifierOptions::default())
    }
}

impl<T: HttpClient + Sync> RemoteVerifierClient<T> {
    /// Verify `assertion` for `audience` and await the verdict.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip(self, assertion), fields(endpoint = %self.opts.endpoint)))]
    pub async fn verify_async(
        &self,
        audience: &str,
        assertion: &str,
    ) -> Result<Verified, VerifierError> {
        let request = VerificationRequest::new(audience, assertion)?;
        self.verify_request(&request).await
    }

    async fn dispatch(
        &self,
        request: http::Request<Vec<u8>>,
        audience: String,
    ) -> Result<Verified, VerifierError> {
        #[cfg(feature = "tracing")]
        tracing::debug!(uri = %request.uri(), "sending verification request");

        let response = match self.http.send_http(request).await {
            Ok(response) => response,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "verification request failed");
                return Err(VerifierError::transport(e));
            }
        };
        self.interpret(response, audience)
    }
}

impl<T> RemoteVerifierClient<T>
where
    T: HttpClient + Clone + Send + Sync + 'static,
{
    /// Verify `assertion` for `audience`, reporting the outcome to `delegate`.
    ///
    /// Empty inputs, request encoding problems, and the absence of a Tokio
    /// runtime are returned here, before anything is sent; the delegate is
    /// dropped unused in that case. Otherwise the request is dispatched and
    /// this returns `Ok(())` at once. The delegate then receives exactly one
    /// call, from a runtime worker thread. If the runtime shuts down first, that
    /// call is a cancellation error made while the runtime is dropped.
    /// Transport failures are not retried.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip(self, assertion, delegate), fields(endpoint = %self.opts.endpoint)))]
    pub fn verify<D: VerifierDelegate>(
        &self,
        audience: &str,
        assertion: &str,
        delegate: D,
    ) -> Result<(), VerifierError> {
        let request = VerificationRequest::new(audience, assertion)?;
        let http_request = self.build_request(&request)?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| VerifierError::NoRuntime)?;

        let client = self.clone();
        let audience = request.audience().to_string();
        let work = async move { client.dispatch(http_request, audience).await };
        #[cfg(feature = "tracing")]
        let work = tracing::Instrument::in_current_span(work);
        let work = runtime.spawn(work);

        // The delegate lives in its own task so a panicking transport still
        // produces an error callback. The guard covers the task being dropped
        // unpolled, e.g. when the runtime shuts down.
        let guard = DeliveryGuard::new(delegate);
        let deliver = async move {
            let result = match work.await {
                Ok(result) => result,
                Err(join_error) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %join_error, "verification task did not complete");
                    Err(VerifierError::Transport(TransportError::Other(Box::new(
                        join_error,
                    ))))
                }
            };
            guard.deliver(result);
        };
        #[cfg(feature = "tracing")]
        let deliver = tracing::Instrument::in_current_span(deliver);
        runtime.spawn(deliver);
        Ok(())
    }

    /// Verify `assertion` for `audience`, delivering the outcome on a oneshot channel.
    ///
    /// Synchronous failures are returned as in [`verify`](Self::verify).
    pub fn verify_oneshot(
        &self,
        audience: &str,
        assertion: &str,
    ) -> Result<oneshot::Receiver<Result<Verified, VerifierError>>, VerifierError> {
        let (tx, rx) = oneshot::channel();
        let delegate = move |result: Result<Verified, VerifierError>| {
            // The receiver may have been dropped; nobody is waiting then.
            let _ = tx.send(result);
        };
        self.verify(audience, assertion, delegate)?;
        Ok(rx)
    }
}

impl<T: HttpClient + Sync> AssertionVerifier for RemoteVerifierClient<T> {
    fn options(&self) -> &VerifierOptions {
        &self.opts
    }

    async fn verify_request(
        &self,
        request: &VerificationRequest,
    ) -> Result<Verified, VerifierError> {
        let http_request = self.build_request(request)?;
        self.dispatch(http_request, request.audience().to_string())
            .await
    }
}

/// Owns a delegate until an outcome is handed over.
///
/// Dropping the guard before delivery reports a cancellation error, so a
/// dispatched verification always ends in exactly one callback.
struct DeliveryGuard<D: VerifierDelegate>(Option<D>);

impl<D: VerifierDelegate> DeliveryGuard<D> {
    fn new(delegate: D) -> Self {
        Self(Some(delegate))
    }

    fn deliver(mut self, result: Result<Verified, VerifierError>) {
        if let Some(delegate) = self.0.take() {
            delegate.deliver(result);
        }
    }
}

impl<D: VerifierDelegate> Drop for DeliveryGuard<D> {
    fn drop(&mut self) {
        if let Some(delegate) = self.0.take() {
            #[cfg(feature = "tracing")]
            tracing::warn!("verification cancelled before completion");
            delegate.handle_error(VerifierError::Transport(TransportError::Other(
                "verification cancelled".into(),
            )));
        }
    }
}

//! Assertion verification: request encoding, response interpretation, and the
//! delegate through which asynchronous results are delivered.
//!
//! A verification is a single POST of `{audience, assertion}` to a verifier
//! endpoint. The verifier answers with a JSON object whose `status` is either
//! `"okay"` (the assertion is valid for the audience) or `"failure"` (it is
//! not, with a `reason`). Anything else is treated as a malformed response.
//!
//! Parsing returns a [`VerifierResponse`] so callers can inspect the raw body
//! and optionally validate the verified audience against the requested one.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;

use bon::Builder;
use browserid_common::error::TransportError;
use bytes::Bytes;
use http::StatusCode;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

/// Default verifier endpoint (JSON protocol)
pub const DEFAULT_VERIFIER_URL: &str = "https://verifier.accounts.firefox.com/v2";

/// Legacy verifier endpoint (form-encoded protocol)
pub const LEGACY_VERIFIER_URL: &str = "https://verifier.login.persona.org/verify";

const JSON_KEY_STATUS: &str = "status";
const STATUS_OKAY: &str = "okay";
const STATUS_FAILURE: &str = "failure";

/// Coarse classification of a [`VerifierError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerifierErrorKind {
    /// A required input was missing or unusable; nothing was sent
    InvalidArgument,
    /// The request could not be completed or the answer could not be understood
    TransportFailure,
    /// The verifier answered and did not accept the assertion
    VerificationRejected,
}

/// Errors that can occur during assertion verification.
///
/// `InvalidArgument`, `NoRuntime` and `Encode` are returned synchronously from
/// the call that would have sent the request. Everything else happens after
/// dispatch and reaches the caller through the delegate.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum VerifierError {
    #[error("invalid argument: {0}")]
    #[diagnostic(
        code(browserid_verifier::invalid_argument),
        help("audience and assertion must both be non-empty")
    )]
    InvalidArgument(&'static str),
    #[error("no async runtime available to dispatch the verification")]
    #[diagnostic(
        code(browserid_verifier::no_runtime),
        help("call verify() from within a Tokio runtime, or use verify_async()")
    )]
    NoRuntime,
    #[error("failed to encode verification request: {0}")]
    #[diagnostic(code(browserid_verifier::encode))]
    Encode(String),
    #[error("HTTP error: {0}")]
    #[diagnostic(
        code(browserid_verifier::transport),
        help("check network connectivity, proxy settings and TLS configuration")
    )]
    Transport(#[from] TransportError),
    #[error("verifier returned HTTP {status}")]
    #[diagnostic(
        code(browserid_verifier::http_status),
        help("verify the endpoint URL and protocol version")
    )]
    HttpStatus {
        status: StatusCode,
        body: Option<Bytes>,
    },
    #[error("malformed verifier response: {0}")]
    #[diagnostic(
        code(browserid_verifier::malformed_response),
        help("expected a JSON object with status \"okay\" or \"failure\"")
    )]
    MalformedResponse(String),
    #[error("assertion rejected: {}", .0.reason.as_deref().unwrap_or("no reason given"))]
    #[diagnostic(code(browserid_verifier::rejected))]
    Rejected(Rejection),
    /// The verifier vouched for a different audience than the one requested
    #[error("verified audience {actual:?} does not match requested audience {expected:?}")]
    #[diagnostic(
        code(browserid_verifier::audience_mismatch),
        help("do not trust this assertion for the requested audience")
    )]
    AudienceMismatch { expected: String, actual: String },
}

impl VerifierError {
    /// Classify this error
    pub fn kind(&self) -> VerifierErrorKind {
        match self {
            VerifierError::InvalidArgument(_)
            | VerifierError::NoRuntime
            | VerifierError::Encode(_) => VerifierErrorKind::InvalidArgument,
            VerifierError::Transport(_)
            | VerifierError::HttpStatus { .. }
            | VerifierError::MalformedResponse(_) => VerifierErrorKind::TransportFailure,
            VerifierError::Rejected(_) | VerifierError::AudienceMismatch { .. } => {
                VerifierErrorKind::VerificationRejected
            }
        }
    }

    /// Wrap any client error as a transport failure
    pub fn transport<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        VerifierError::Transport(TransportError::from_client(err))
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        VerifierError::MalformedResponse(msg.into())
    }
}

/// Wire protocol spoken to the verifier.
///
/// Version 1 posts form-encoded data; version 2 posts JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProtocolVersion {
    /// `application/x-www-form-urlencoded` body
    V1,
    /// `application/json` body
    #[default]
    V2,
}

impl ProtocolVersion {
    /// Well-known endpoint for this protocol version
    pub fn default_endpoint(&self) -> Url {
        match self {
            ProtocolVersion::V1 => Url::parse(LEGACY_VERIFIER_URL).expect("valid url"),
            ProtocolVersion::V2 => Url::parse(DEFAULT_VERIFIER_URL).expect("valid url"),
        }
    }

    /// Content type of the request body
    pub fn content_type(&self) -> &'static str {
        match self {
            ProtocolVersion::V1 => "application/x-www-form-urlencoded",
            ProtocolVersion::V2 => "application/json",
        }
    }
}

/// Configurable verifier options.
///
/// - `endpoint`: the verifier URL; fixed for the lifetime of a client.
/// - `protocol`: body encoding (JSON by default).
/// - `validate_audience`: if true (default), a verified response naming a
///   different audience than the requested one is reported as
///   [`VerifierError::AudienceMismatch`].
#[derive(Debug, Clone, Builder)]
#[builder(start_fn = new)]
pub struct VerifierOptions {
    /// Verifier endpoint
    pub endpoint: Url,
    /// Protocol version used to encode requests
    #[builder(default)]
    pub protocol: ProtocolVersion,
    /// Check the audience in successful responses
    #[builder(default = true)]
    pub validate_audience: bool,
}

impl Default for VerifierOptions {
    fn default() -> Self {
        Self::new()
            .endpoint(ProtocolVersion::V2.default_endpoint())
            .protocol(ProtocolVersion::V2)
            .validate_audience(true)
            .build()
    }
}

/// A single verification request.
///
/// Both fields are required and non-empty; no other validation is applied.
/// The assertion is never shown by `Debug`.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct VerificationRequest {
    audience: String,
    assertion: String,
}

impl VerificationRequest {
    /// Create a request, rejecting empty inputs
    pub fn new(
        audience: impl Into<String>,
        assertion: impl Into<String>,
    ) -> Result<Self, VerifierError> {
        let audience = audience.into();
        let assertion = assertion.into();
        if audience.is_empty() {
            return Err(VerifierError::InvalidArgument("audience cannot be empty"));
        }
        if assertion.is_empty() {
            return Err(VerifierError::InvalidArgument("assertion cannot be empty"));
        }
        Ok(Self {
            audience,
            assertion,
        })
    }

    /// Expected recipient of the assertion
    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// The opaque assertion token
    pub fn assertion(&self) -> &str {
        &self.assertion
    }

    /// Encode the request body for `protocol`
    pub fn encode(&self, protocol: ProtocolVersion) -> Result<Vec<u8>, VerifierError> {
        match protocol {
            ProtocolVersion::V1 => serde_html_form::to_string(self)
                .map(String::into_bytes)
                .map_err(|e| VerifierError::Encode(e.to_string())),
            ProtocolVersion::V2 => {
                serde_json::to_vec(self).map_err(|e| VerifierError::Encode(e.to_string()))
            }
        }
    }
}

impl fmt::Debug for VerificationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationRequest")
            .field("audience", &self.audience)
            .field("assertion", &format_args!("<{} bytes>", self.assertion.len()))
            .finish()
    }
}

/// A successful verification.
///
/// Only `audience` is interpreted. The remaining fields of the verifier's
/// answer are kept as-is in `extra`; `email`, `issuer` and `expires` are
/// lifted out when present because every known verifier sends them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verified {
    /// Audience the verifier vouched for
    #[serde(default)]
    pub audience: String,
    /// Identity asserted by the token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Party that issued the identity certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    /// Expiry of the assertion, milliseconds since the epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,
    /// Everything else the verifier returned
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A verifier's refusal to accept an assertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    /// Human-readable reason, if the verifier gave one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Everything else the verifier returned
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Verifier response for deferred parsing.
///
/// Carries the raw response bytes and the HTTP status, plus the requested
/// audience (if supplied) to enable validation. Use `parse()` to interpret the
/// body, or `parse_validated()` to also require that a verified audience
/// matches the requested one.
#[derive(Debug, Clone)]
pub struct VerifierResponse {
    #[allow(missing_docs)]
    pub buffer: Bytes,
    #[allow(missing_docs)]
    pub status: StatusCode,
    /// Audience we asked about; used to fill and validate the result
    pub requested_audience: Option<String>,
}

impl VerifierResponse {
    /// Capture an HTTP response
    pub fn from_http(
        response: http::Response<Vec<u8>>,
        requested_audience: Option<String>,
    ) -> Self {
        let status = response.status();
        Self {
            buffer: Bytes::from(response.into_body()),
            status,
            requested_audience,
        }
    }

    /// Interpret the verifier's answer.
    ///
    /// A missing `audience` in a successful answer is filled in from the
    /// requested audience.
    pub fn parse(&self) -> Result<Verified, VerifierError> {
        if !self.status.is_success() {
            return Err(VerifierError::HttpStatus {
                status: self.status,
                body: (!self.buffer.is_empty()).then(|| self.buffer.clone()),
            });
        }
        let value: Value = serde_json::from_slice(&self.buffer)
            .map_err(|e| VerifierError::malformed(format!("invalid JSON: {e}")))?;
        let Value::Object(mut obj) = value else {
            return Err(VerifierError::malformed("expected a JSON object"));
        };
        let status = match obj.remove(JSON_KEY_STATUS) {
            Some(Value::String(s)) => s,
            Some(other) => {
                return Err(VerifierError::malformed(format!(
                    "expected string status, got {other}"
                )));
            }
            None => return Err(VerifierError::malformed("missing status")),
        };
        match status.as_str() {
            STATUS_OKAY => {
                let mut verified: Verified = serde_json::from_value(Value::Object(obj))
                    .map_err(|e| VerifierError::malformed(e.to_string()))?;
                if verified.audience.is_empty() {
                    if let Some(requested) = &self.requested_audience {
                        verified.audience = requested.clone();
                    }
                }
                Ok(verified)
            }
            STATUS_FAILURE => {
                let rejection: Rejection = serde_json::from_value(Value::Object(obj))
                    .map_err(|e| VerifierError::malformed(e.to_string()))?;
                Err(VerifierError::Rejected(rejection))
            }
            other => Err(VerifierError::malformed(format!(
                "expected status okay or failure, got {other:?}"
            ))),
        }
    }

    /// Interpret the answer and check the verified audience.
    ///
    /// On mismatch, returns [`VerifierError::AudienceMismatch`]; the verified
    /// result is not handed out.
    pub fn parse_validated(&self) -> Result<Verified, VerifierError> {
        let verified = self.parse()?;
        if let Some(expected) = &self.requested_audience {
            if verified.audience != *expected {
                return Err(VerifierError::AudienceMismatch {
                    expected: expected.clone(),
                    actual: verified.audience,
                });
            }
        }
        Ok(verified)
    }
}

/// Receiver of a single verification outcome.
///
/// Both methods consume the delegate, so exactly one of them runs per
/// verification. They may be called from any thread.
///
/// Any `FnOnce(Result<Verified, VerifierError>)` closure is a delegate.
pub trait VerifierDelegate: Send + 'static {
    /// The verifier accepted the assertion
    fn handle_success(self, verified: Verified);

    /// The verification failed or was rejected
    fn handle_error(self, error: VerifierError);

    /// Route a result to the matching handler
    fn deliver(self, result: Result<Verified, VerifierError>)
    where
        Self: Sized,
    {
        match result {
            Ok(verified) => self.handle_success(verified),
            Err(error) => self.handle_error(error),
        }
    }
}

impl<F> VerifierDelegate for F
where
    F: FnOnce(Result<Verified, VerifierError>) + Send + 'static,
{
    fn handle_success(self, verified: Verified) {
        self(Ok(verified))
    }

    fn handle_error(self, error: VerifierError) {
        self(Err(error))
    }
}

/// Trait for assertion verification, for pluggable implementations.
pub trait AssertionVerifier {
    /// Access options for validation decisions
    fn options(&self) -> &VerifierOptions;

    /// Verify one request
    fn verify_request(
        &self,
        request: &VerificationRequest,
    ) -> impl Future<Output = Result<Verified, VerifierError>> + Send
    where
        Self: Sync;

    /// Verify an audience/assertion pair
    fn verify_assertion(
        &self,
        audience: &str,
        assertion: &str,
    ) -> impl Future<Output = Result<Verified, VerifierError>> + Send
    where
        Self: Sync,
    {
        let request = VerificationRequest::new(audience, assertion);
        async move { self.verify_request(&request?).await }
    }
}

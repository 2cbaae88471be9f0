//! Availability of an external proxy helper process.
//!
//! Some deployments route traffic through a proxy that is run by a separate,
//! cooperating application (a Tor client, for example). This crate does not
//! know how that application is detected or launched; it only needs to ask
//! whether it is there and, if so, to request that it start.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{HelperError, TransportError};
use crate::http_client::HttpClient;

/// Status reported by a proxy helper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HelperStatus {
    /// Not running
    Off,
    /// Running and accepting connections
    On,
    /// Start in progress
    Starting,
    /// Stop in progress
    Stopping,
    /// The user disabled starts requested by other applications
    StartsDisabled,
    /// The helper did not report a status
    Unknown,
}

impl HelperStatus {
    /// Wire form of the status, as the helper reports it
    pub fn as_str(&self) -> &'static str {
        match self {
            HelperStatus::Off => "OFF",
            HelperStatus::On => "ON",
            HelperStatus::Starting => "STARTING",
            HelperStatus::Stopping => "STOPPING",
            HelperStatus::StartsDisabled => "STARTS_DISABLED",
            HelperStatus::Unknown => "UNKNOWN",
        }
    }

    /// Whether the helper is up or on its way up
    pub fn is_running(&self) -> bool {
        matches!(self, HelperStatus::On | HelperStatus::Starting)
    }
}

impl fmt::Display for HelperStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HelperStatus {
    type Err = HelperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OFF" => Ok(HelperStatus::Off),
            "ON" => Ok(HelperStatus::On),
            "STARTING" => Ok(HelperStatus::Starting),
            "STOPPING" => Ok(HelperStatus::Stopping),
            "STARTS_DISABLED" => Ok(HelperStatus::StartsDisabled),
            other => Err(HelperError::InvalidStatus(other.to_string())),
        }
    }
}

/// A cooperating process that provides the local proxy.
pub trait ProxyHelper {
    /// Whether the helper is installed and could be started
    fn is_available(&self) -> bool;

    /// Ask the helper to start. Returns once the request is sent, not once
    /// the helper is running.
    fn request_start(&self) -> Result<(), HelperError>;

    /// Last known status, if the helper reports one.
    ///
    /// Helpers that cannot report a status keep the default
    /// [`HelperStatus::Unknown`]. [`ensure_started`] requests a start on
    /// every call for those; [`HelperGuardedClient`] requests it only once.
    fn status(&self) -> HelperStatus {
        HelperStatus::Unknown
    }
}

impl<H: ProxyHelper + ?Sized> ProxyHelper for &H {
    fn is_available(&self) -> bool {
        (**self).is_available()
    }

    fn request_start(&self) -> Result<(), HelperError> {
        (**self).request_start()
    }

    fn status(&self) -> HelperStatus {
        (**self).status()
    }
}

impl<H: ProxyHelper + ?Sized> ProxyHelper for std::sync::Arc<H> {
    fn is_available(&self) -> bool {
        self.as_ref().is_available()
    }

    fn request_start(&self) -> Result<(), HelperError> {
        self.as_ref().request_start()
    }

    fn status(&self) -> HelperStatus {
        self.as_ref().status()
    }
}

/// Request a helper start if one is needed.
///
/// Returns `Ok(false)` when the helper is not available (nothing is
/// requested), and `Ok(true)` when it is running, starting, or a start was
/// just requested.
pub fn ensure_started<H: ProxyHelper + ?Sized>(helper: &H) -> Result<bool, HelperError> {
    if !helper.is_available() {
        return Ok(false);
    }
    match helper.status() {
        status if status.is_running() => Ok(true),
        HelperStatus::StartsDisabled => Err(HelperError::StartsDisabled),
        _status => {
            #[cfg(feature = "tracing")]
            tracing::info!(status = %_status, "requesting proxy helper start");
            helper.request_start()?;
            Ok(true)
        }
    }
}

/// HTTP client that makes sure the proxy helper is up before each request.
///
/// An unavailable helper, or one that refuses to start, fails the request with
/// [`TransportError::Connect`]; nothing is sent in that case.
#[derive(Debug, Clone)]
pub struct HelperGuardedClient<C, H> {
    inner: C,
    helper: H,
    // Shared between clones.
    start_requested: Arc<AtomicBool>,
}

impl<C, H> HelperGuardedClient<C, H> {
    /// Wrap `inner`, consulting `helper` before every request
    pub fn new(inner: C, helper: H) -> Self {
        Self {
            inner,
            helper,
            start_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The wrapped client
    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// The helper consulted before requests
    pub fn helper(&self) -> &H {
        &self.helper
    }

    fn check_helper(&self) -> Result<(), TransportError>
    where
        H: ProxyHelper,
    {
        // A helper without status reporting is assumed up once asked to start.
        if self.start_requested.load(Ordering::Acquire)
            && self.helper.is_available()
            && self.helper.status() == HelperStatus::Unknown
        {
            return Ok(());
        }
        match ensure_started(&self.helper) {
            Ok(true) => {
                self.start_requested.store(true, Ordering::Release);
                Ok(())
            }
            Ok(false) => Err(TransportError::Connect(
                HelperError::NotInstalled.to_string(),
            )),
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "proxy helper unavailable");
                Err(TransportError::Connect(e.to_string()))
            }
        }
    }
}

impl<C, H> HttpClient for HelperGuardedClient<C, H>
where
    C: HttpClient + Send + Sync,
    H: ProxyHelper + Send + Sync,
{
    type Error = TransportError;

    fn send_http(
        &self,
        request: http::Request<Vec<u8>>,
    ) -> impl Future<Output = core::result::Result<http::Response<Vec<u8>>, Self::Error>> + Send
    {
        let checked = self.check_helper();
        async move {
            checked?;
            self.inner
                .send_http(request)
                .await
                .map_err(TransportError::from_client)
        }
    }
}

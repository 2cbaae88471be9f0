//! Minimal HTTP client abstraction shared across crates.

use std::fmt::{self, Display};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bon::Builder;

use crate::error::TransportError;
use crate::proxy::ProxyProvider;

/// HTTP client trait for sending raw HTTP requests.
#[cfg_attr(not(target_arch = "wasm32"), trait_variant::make(Send))]
pub trait HttpClient {
    /// Error type returned by the HTTP client
    type Error: std::error::Error + Display + Send + Sync + 'static;

    /// Send an HTTP request and return the response.
    fn send_http(
        &self,
        request: http::Request<Vec<u8>>,
    ) -> impl Future<Output = core::result::Result<http::Response<Vec<u8>>, Self::Error>>;
}

#[cfg(feature = "reqwest-client")]
impl HttpClient for reqwest::Client {
    type Error = TransportError;

    async fn send_http(
        &self,
        request: http::Request<Vec<u8>>,
    ) -> core::result::Result<http::Response<Vec<u8>>, Self::Error> {
        // Convert http::Request to reqwest::Request
        let (parts, body) = request.into_parts();

        let mut req = self.request(parts.method, parts.uri.to_string()).body(body);

        // Copy headers
        for (name, value) in parts.headers.iter() {
            req = req.header(name.as_str(), value.as_bytes());
        }

        let resp = req.send().await?;

        let mut builder = http::Response::builder().status(resp.status());

        for (name, value) in resp.headers().iter() {
            builder = builder.header(name.as_str(), value.as_bytes());
        }

        let body = resp.bytes().await?.to_vec();

        Ok(builder.body(body)?)
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl<T: HttpClient + Sync> HttpClient for Arc<T> {
    type Error = T::Error;

    fn send_http(
        &self,
        request: http::Request<Vec<u8>>,
    ) -> impl Future<Output = core::result::Result<http::Response<Vec<u8>>, Self::Error>> + Send
    {
        self.as_ref().send_http(request)
    }
}

#[cfg(target_arch = "wasm32")]
impl<T: HttpClient> HttpClient for Arc<T> {
    type Error = T::Error;

    fn send_http(
        &self,
        request: http::Request<Vec<u8>>,
    ) -> impl Future<Output = core::result::Result<http::Response<Vec<u8>>, Self::Error>> {
        self.as_ref().send_http(request)
    }
}

fn default_user_agent() -> String {
    format!("browserid-common/{}", env!("CARGO_PKG_VERSION"))
}

/// Options for building a [`reqwest::Client`] transport.
///
/// - `timeout`: overall request timeout; expiry surfaces as [`TransportError::Timeout`]
/// - `connect_timeout`: limit on establishing the connection (proxy included)
/// - `user_agent`: value of the `user-agent` header
/// - `proxy`: route-selection strategy consulted for every outbound request.
///   `None` connects directly and ignores any system proxy configuration.
#[derive(Clone, Builder)]
#[builder(start_fn = new)]
pub struct ClientOptions {
    /// Overall request timeout
    pub timeout: Option<Duration>,
    /// Connection establishment timeout
    pub connect_timeout: Option<Duration>,
    /// User agent sent with every request
    #[builder(default = default_user_agent())]
    pub user_agent: String,
    /// Per-target proxy strategy
    pub proxy: Option<Arc<dyn ProxyProvider>>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::new().build()
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("timeout", &self.timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("user_agent", &self.user_agent)
            .field("proxy", &self.proxy.as_ref().map(|_| "<provider>"))
            .finish()
    }
}

/// Build a [`reqwest::Client`] from [`ClientOptions`].
///
/// The proxy provider is installed through [`reqwest::Proxy::custom`], so each
/// request asks the provider where to go; a `None` answer connects directly.
#[cfg(feature = "reqwest-client")]
pub fn build_reqwest_client(opts: &ClientOptions) -> Result<reqwest::Client, TransportError> {
    let mut builder = reqwest::Client::builder().user_agent(opts.user_agent.as_str());

    #[cfg(not(target_arch = "wasm32"))]
    {
        if let Some(timeout) = opts.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(timeout) = opts.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        builder = builder.no_proxy();
        if let Some(provider) = &opts.proxy {
            let provider = provider.clone();
            builder = builder.proxy(reqwest::Proxy::custom(move |target| {
                provider.proxy_for(target).map(|addr| addr.to_url())
            }));
        }
    }

    #[cfg(feature = "tracing")]
    tracing::info!(
        timeout = ?opts.timeout,
        proxied = opts.proxy.is_some(),
        "transport client created"
    );

    Ok(builder.build()?)
}

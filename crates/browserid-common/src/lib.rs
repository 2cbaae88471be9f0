//! Common plumbing for the BrowserID verifier crates
//!
//! This crate holds the seams the verifier depends on but does not own:
//!
//! - [`http_client::HttpClient`]: the raw request/response transport
//! - [`proxy::ProxyProvider`]: per-target proxy selection for outbound connections
//! - [`helper::ProxyHelper`]: presence and start requests for a cooperating proxy process
//!
//! ## Routing through a local proxy
//!
//! ```no_run
//! use browserid_common::http_client::{ClientOptions, build_reqwest_client};
//! use browserid_common::proxy::FixedProxy;
//! use std::sync::Arc;
//!
//! let opts = ClientOptions::new()
//!     .proxy(Arc::new(FixedProxy::default()))
//!     .build();
//! let client = build_reqwest_client(&opts)?;
//! # Ok::<(), browserid_common::error::TransportError>(())
//! ```

#![warn(missing_docs)]
pub use url;

pub mod error;
/// HTTP client abstraction used by the verifier crates.
pub mod http_client;
pub mod helper;
pub mod proxy;

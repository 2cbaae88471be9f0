use std::sync::Arc;
use std::time::Duration;

use browserid_common::http_client::{ClientOptions, build_reqwest_client};
use browserid_common::proxy::{FixedProxy, ProxyAddress};
use browserid_verifier::verifier::{ProtocolVersion, VerifierOptions};
use browserid_verifier::{RemoteVerifierClient, Verified, VerifierError};
use clap::Parser;
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
#[command(author, version, about = "Verify a BrowserID assertion against a remote verifier")]
struct Args {
    /// Audience the assertion was issued for (e.g., https://example.com)
    audience: String,

    /// The assertion to verify
    assertion: String,

    /// Verifier endpoint (defaults to the protocol's well-known endpoint)
    #[arg(long)]
    endpoint: Option<Url>,

    /// Use the legacy form-encoded protocol
    #[arg(long)]
    legacy: bool,

    /// Route the request through an HTTP proxy, e.g. 127.0.0.1:8118
    #[arg(long)]
    proxy: Option<ProxyAddress>,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .with_env_filter(EnvFilter::from_env("BROWSERID_LOG"))
        .init();
    let args = Args::parse();

    let protocol = if args.legacy {
        ProtocolVersion::V1
    } else {
        ProtocolVersion::V2
    };
    let opts = VerifierOptions::new()
        .endpoint(args.endpoint.unwrap_or_else(|| protocol.default_endpoint()))
        .protocol(protocol)
        .build();

    let mut client_opts = ClientOptions::new()
        .timeout(Duration::from_secs(args.timeout))
        .build();
    if let Some(proxy) = args.proxy {
        println!("Routing through proxy {proxy}");
        client_opts.proxy = Some(Arc::new(FixedProxy(proxy)));
    }
    let http = build_reqwest_client(&client_opts)?;
    let client = RemoteVerifierClient::new(http, opts);

    println!("Verifying against {}", client.endpoint());
    let rx = client.verify_oneshot(&args.audience, &args.assertion)?;
    let result: Result<Verified, VerifierError> = rx.await.into_diagnostic()?;

    match result {
        Ok(verified) => {
            println!("Verified");
            println!("  Audience: {}", verified.audience);
            if let Some(email) = &verified.email {
                println!("  Email: {}", email);
            }
            if let Some(issuer) = &verified.issuer {
                println!("  Issuer: {}", issuer);
            }
            if let Some(expires) = verified.expires {
                println!("  Expires (ms since epoch): {}", expires);
            }
            for (key, value) in &verified.extra {
                println!(
                    "  {}: {}",
                    key,
                    serde_json::to_string_pretty(value).into_diagnostic()?
                );
            }
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

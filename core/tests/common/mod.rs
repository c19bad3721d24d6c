//! Shared test utilities for dropwire integration tests.
//!
//! Provides a local axum upstream, tracing setup, and a reachability check
//! for the tests that talk to the public `httpbin.org` upstream.

// Each integration test is compiled as its own crate, so not every test file
// uses every function from this shared module. Suppress dead_code warnings.
#![allow(dead_code)]

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use axum::extract::Path;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::get;
use axum::Router;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

/// Public upstream used by the network-dependent tests.
pub const PUBLIC_UPSTREAM_HOST: &str = "httpbin.org";
pub const PUBLIC_UPSTREAM_PORT: u16 = 80;

/// Body returned by the local upstream's root route.
pub const UPSTREAM_GREETING: &str = "hello from upstream";

/// Install a fmt subscriber that writes through the test harness.
///
/// Defaults to `info`; override with `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

/// Check if a TCP port is reachable on the given host.
///
/// Returns `true` if a TCP connection can be established within 2 seconds.
pub fn is_port_reachable(host: &str, port: u16) -> bool {
    let Ok(mut addrs) = (host, port).to_socket_addrs() else {
        return false;
    };
    addrs.any(|addr| TcpStream::connect_timeout(&addr, Duration::from_secs(2)).is_ok())
}

/// Skip the current test if the public upstream is not reachable.
///
/// Prints a message to stderr and returns early (runtime check instead of
/// `#[ignore]`, so the tests run wherever the network allows).
macro_rules! require_network {
    () => {
        if !common::is_port_reachable(common::PUBLIC_UPSTREAM_HOST, common::PUBLIC_UPSTREAM_PORT) {
            eprintln!(
                "SKIPPED: {}:{} not reachable (network access required)",
                common::PUBLIC_UPSTREAM_HOST,
                common::PUBLIC_UPSTREAM_PORT
            );
            return;
        }
    };
}
pub(crate) use require_network;

/// A local HTTP server standing in for the real upstream.
///
/// Routes:
/// - `/` → 200 with [`UPSTREAM_GREETING`]
/// - `/status/{code}` → empty response with that status
/// - `/host` → echoes the `Host` header it received
pub struct LocalUpstream {
    addr: SocketAddr,
    server: JoinHandle<()>,
}

impl LocalUpstream {
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("local upstream should bind");
        let addr = listener.local_addr().expect("local upstream address");

        let app = Router::new()
            .route("/", get(|| async { UPSTREAM_GREETING }))
            .route("/status/:code", get(status))
            .route("/host", get(echo_host));

        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("local upstream stopped: {e}");
            }
        });

        Self { addr, server }
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl Drop for LocalUpstream {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn status(Path(code): Path<u16>) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_REQUEST)
}

async fn echo_host(headers: HeaderMap) -> String {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Reserve a port that nothing is listening on.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind for free port");
    listener.local_addr().expect("free port address").port()
}

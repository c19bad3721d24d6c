//! Client-under-test harness.
//!
//! Wraps a `reqwest` client with an explicit Built → Running → Closed
//! lifecycle. Each [`HttpClient::send`] runs on its own tracked task and
//! hands back a [`PendingResponse`]; closing the client cancels every
//! request still in flight.

pub mod pending;
pub mod response;
pub mod trial;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::errors::ClientError;

use self::pending::{
    new_status_cell, transition, PendingResponse, RequestOutcome, RequestStatus, StatusCell,
};
use self::response::Response;
use self::trial::Target;

#[derive(Debug)]
enum ClientState {
    Built,
    Running {
        inner: reqwest::Client,
        runtime: Handle,
    },
    Closed,
}

/// HTTP client under test.
#[derive(Debug)]
pub struct HttpClient {
    config: ClientConfig,
    state: ClientState,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    next_request_id: AtomicU64,
}

impl HttpClient {
    /// Validate `config` and prepare a client. No network activity happens
    /// until a request is sent.
    pub fn build(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        Ok(Self {
            config,
            state: ClientState::Built,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            next_request_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, ClientState::Running { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ClientState::Closed)
    }

    /// Build the underlying client and bind it to the current tokio runtime.
    ///
    /// Calling `start` on a running client does nothing.
    pub fn start(&mut self) -> Result<(), ClientError> {
        match self.state {
            ClientState::Running { .. } => return Ok(()),
            ClientState::Closed => return Err(ClientError::Closed),
            ClientState::Built => {}
        }

        let runtime = Handle::try_current().map_err(|_| ClientError::NoRuntime)?;
        let inner = build_inner(&self.config)?;
        self.state = ClientState::Running { inner, runtime };

        if self.config.is_unbounded() {
            warn!("HTTP client started without any timeouts; a silent peer will hang requests");
        } else {
            debug!(
                "HTTP client started (connect {:?}, request {:?}, read {:?})",
                self.config.connect_timeout(),
                self.config.request_timeout(),
                self.config.read_timeout()
            );
        }
        Ok(())
    }

    /// Issue a GET for `path` on `host:port` without waiting for it.
    pub fn send(&self, host: &str, port: u16, path: &str) -> Result<PendingResponse, ClientError> {
        let (inner, runtime) = match &self.state {
            ClientState::Running { inner, runtime } => (inner.clone(), runtime),
            ClientState::Built => return Err(ClientError::NotStarted),
            ClientState::Closed => return Err(ClientError::Closed),
        };

        let url = request_url(host, port, path)?;
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let label = format!("GET {url}");

        let status = new_status_cell();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let cancel = self.shutdown.child_token();

        debug!("Request #{} issued: {}", id, label);
        self.tasks.spawn_on(
            run_request(
                inner,
                url,
                label.clone(),
                Arc::clone(&status),
                outcome_tx,
                cancel.clone(),
            ),
            runtime,
        );

        Ok(PendingResponse::new(label, status, outcome_rx, cancel))
    }

    pub fn send_to(&self, target: &Target) -> Result<PendingResponse, ClientError> {
        self.send(&target.host, target.port, &target.path)
    }

    /// Number of requests whose tasks are still running.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Release the client. In-flight requests resolve as cancelled and any
    /// later `send` fails with [`ClientError::Closed`]. Closing twice is a
    /// no-op.
    pub fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        self.state = ClientState::Closed;
        self.shutdown.cancel();
        self.tasks.close();
        debug!(
            "HTTP client closed ({} requests still unwinding)",
            self.tasks.len()
        );
    }

    /// Close the client and wait until every request task has finished.
    pub async fn close_and_wait(&mut self) {
        self.close();
        self.tasks.wait().await;
    }
}

impl Drop for HttpClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_inner(config: &ClientConfig) -> Result<reqwest::Client, ClientError> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = config.connect_timeout() {
        builder = builder.connect_timeout(timeout);
    }
    if let Some(timeout) = config.request_timeout() {
        builder = builder.timeout(timeout);
    }
    if let Some(timeout) = config.read_timeout() {
        builder = builder.read_timeout(timeout);
    }
    if let Some(max) = config.pool.max_idle_per_host {
        builder = builder.pool_max_idle_per_host(max);
    }
    if let Some(idle) = config.pool.idle_timeout() {
        builder = builder.pool_idle_timeout(idle);
    }
    if let Some(keepalive) = config.pool.tcp_keepalive() {
        builder = builder.tcp_keepalive(keepalive);
    }
    if !config.use_system_proxy {
        builder = builder.no_proxy();
    }
    builder
        .build()
        .map_err(|e| ClientError::Build(e.to_string()))
}

/// Build and validate `http://host:port/path`.
fn request_url(host: &str, port: u16, path: &str) -> Result<String, ClientError> {
    if host.is_empty() || host.contains(|c: char| c.is_whitespace() || c == '/') {
        return Err(ClientError::InvalidTarget(format!("bad host {host:?}")));
    }
    if port == 0 {
        return Err(ClientError::InvalidTarget("port must not be 0".to_string()));
    }

    let authority = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    let path = if path.is_empty() {
        "/".to_string()
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };

    let url = format!("http://{authority}{path}");
    reqwest::Url::parse(&url).map_err(|e| ClientError::InvalidTarget(format!("{url}: {e}")))?;
    Ok(url)
}

async fn execute(client: &reqwest::Client, url: &str) -> Result<Response, ClientError> {
    let resp = client.get(url).send().await?;
    Ok(Response::read(resp).await?)
}

async fn run_request(
    client: reqwest::Client,
    url: String,
    label: String,
    status: StatusCell,
    outcome_tx: oneshot::Sender<RequestOutcome>,
    cancel: CancellationToken,
) {
    let result = tokio::select! {
        _ = cancel.cancelled() => None,
        result = execute(&client, &url) => Some(result),
    };

    let outcome = match result {
        Some(Ok(response)) => {
            if transition(&status, RequestStatus::Completed) {
                info!("{} -> {}", label, response.status);
                RequestOutcome::Completed(response)
            } else {
                RequestOutcome::Cancelled
            }
        }
        Some(Err(err)) => {
            if transition(&status, RequestStatus::Failed) {
                warn!("{} -> {}", label, err);
                RequestOutcome::Failed(err)
            } else {
                RequestOutcome::Cancelled
            }
        }
        None => {
            transition(&status, RequestStatus::Cancelled);
            info!("{} cancelled", label);
            RequestOutcome::Cancelled
        }
    };

    // The caller may have dropped its handle; nothing to deliver then.
    let _ = outcome_tx.send(outcome);
}

//! Single-request trials: build a client, send one GET, observe what
//! happens, and release everything regardless of the result.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::response::Response;
use super::HttpClient;
use crate::config::ClientConfig;
use crate::errors::ClientError;
use crate::fixture::MockUpstream;

/// Where a trial request goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            path: path.into(),
        }
    }

    /// Target the given fixture instead of its upstream.
    pub fn via(fixture: &MockUpstream, path: impl Into<String>) -> Self {
        Self::new(fixture.host(), fixture.port(), path)
    }
}

/// What a trial observed.
#[derive(Debug)]
pub enum TrialOutcome {
    /// A response arrived.
    Completed(Response),
    /// The request failed (or the client could not be set up).
    Failed(ClientError),
    /// Still pending when the wait limit ran out.
    Hung(Duration),
}

impl TrialOutcome {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Completed(response) => Some(response.status),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn is_hung(&self) -> bool {
        matches!(self, Self::Hung(_))
    }

    pub fn error(&self) -> Option<&ClientError> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Run one GET against `target` with a fresh client built from `config`.
///
/// With `wait_limit` set, a request still pending after that long is
/// reported as [`TrialOutcome::Hung`] and cancelled. Without it the trial
/// waits as long as the client does, which is forever for an unbounded
/// config talking to a silent peer. The client is closed on every path.
pub async fn run_trial(
    config: ClientConfig,
    target: &Target,
    wait_limit: Option<Duration>,
) -> TrialOutcome {
    let mut client = match HttpClient::build(config) {
        Ok(client) => client,
        Err(err) => return TrialOutcome::Failed(err),
    };

    let result: Result<Response, ClientError> = async {
        client.start()?;
        let mut pending = client.send_to(target)?;
        match wait_limit {
            Some(limit) => pending.wait_timeout(limit).await,
            None => pending.wait().await,
        }
    }
    .await;

    client.close();

    match result {
        Ok(response) => TrialOutcome::Completed(response),
        Err(ClientError::Hung { waited }) => TrialOutcome::Hung(waited),
        Err(err) => TrialOutcome::Failed(err),
    }
}

fn default_path() -> String {
    "/".to_string()
}

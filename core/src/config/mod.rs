use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{ClientError, CoreError, FixtureError};
use crate::fixture::rules::FaultRule;

/// Connection pool tuning for the client under test.
///
/// `None` leaves the client library's default in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_idle_per_host: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_keepalive_ms: Option<u64>,
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    pub fn tcp_keepalive(&self) -> Option<Duration> {
        self.tcp_keepalive_ms.map(Duration::from_millis)
    }
}

/// Configuration for the HTTP client under test.
///
/// The default has no timeouts at all: a request to a peer that never
/// answers stays pending forever.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// Limit on establishing the TCP connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,
    /// Limit on the whole request, from connect to the end of the body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
    /// Limit on each individual read from the connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_timeout_ms: Option<u64>,
    #[serde(default)]
    pub pool: PoolConfig,
    /// Honour `HTTP_PROXY`-style environment variables. Off by default so
    /// loopback fixtures are always reached directly.
    #[serde(default)]
    pub use_system_proxy: bool,
}

impl ClientConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = Some(duration_ms(timeout));
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = Some(duration_ms(timeout));
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = Some(duration_ms(timeout));
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }

    /// True when no timeout of any kind is configured.
    pub fn is_unbounded(&self) -> bool {
        self.connect_timeout_ms.is_none()
            && self.request_timeout_ms.is_none()
            && self.read_timeout_ms.is_none()
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        let timeouts = [
            ("connectTimeoutMs", self.connect_timeout_ms),
            ("requestTimeoutMs", self.request_timeout_ms),
            ("readTimeoutMs", self.read_timeout_ms),
            ("pool.idleTimeoutMs", self.pool.idle_timeout_ms),
            ("pool.tcpKeepaliveMs", self.pool.tcp_keepalive_ms),
        ];
        for (field, value) in timeouts {
            if value == Some(0) {
                return Err(ClientError::InvalidConfig(format!(
                    "{field} must be greater than zero"
                )));
            }
        }
        Ok(())
    }
}

/// Configuration for the mock upstream fixture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureConfig {
    /// Host that passed-through requests are forwarded to.
    pub target_host: String,
    pub target_port: u16,
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    /// Port to listen on; `0` picks a free ephemeral port.
    #[serde(default)]
    pub listen_port: u16,
    #[serde(default = "default_upstream_connect_timeout_ms")]
    pub upstream_connect_timeout_ms: u64,
    #[serde(default = "default_head_read_timeout_ms")]
    pub head_read_timeout_ms: u64,
    #[serde(default = "default_max_head_bytes")]
    pub max_head_bytes: usize,
    /// Replace the client's `Host` header with the target's on pass-through.
    #[serde(default = "default_true")]
    pub rewrite_host_header: bool,
}

impl FixtureConfig {
    /// A fixture proxying to `target_host:target_port` on an ephemeral port.
    pub fn new(target_host: impl Into<String>, target_port: u16) -> Self {
        Self {
            target_host: target_host.into(),
            target_port,
            listen_host: default_listen_host(),
            listen_port: 0,
            upstream_connect_timeout_ms: default_upstream_connect_timeout_ms(),
            head_read_timeout_ms: default_head_read_timeout_ms(),
            max_head_bytes: default_max_head_bytes(),
            rewrite_host_header: true,
        }
    }

    /// A fixture proxying to `target_host:target_port`, listening on `listen_port`.
    pub fn proxying(target_host: impl Into<String>, target_port: u16, listen_port: u16) -> Self {
        Self {
            listen_port,
            ..Self::new(target_host, target_port)
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    pub fn target_addr(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }

    /// Value for the `Host` header of forwarded requests.
    pub fn target_authority(&self) -> String {
        if self.target_port == 80 {
            self.target_host.clone()
        } else {
            self.target_addr()
        }
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_connect_timeout_ms)
    }

    pub fn head_read_timeout(&self) -> Duration {
        Duration::from_millis(self.head_read_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), FixtureError> {
        if self.target_host.trim().is_empty() {
            return Err(FixtureError::InvalidConfig(
                "targetHost must not be empty".to_string(),
            ));
        }
        if self.target_port == 0 {
            return Err(FixtureError::InvalidConfig(
                "targetPort must not be 0".to_string(),
            ));
        }
        if self.upstream_connect_timeout_ms == 0 || self.head_read_timeout_ms == 0 {
            return Err(FixtureError::InvalidConfig(
                "fixture timeouts must be greater than zero".to_string(),
            ));
        }
        if self.max_head_bytes < MIN_HEAD_BYTES {
            return Err(FixtureError::InvalidConfig(format!(
                "maxHeadBytes must be at least {MIN_HEAD_BYTES}"
            )));
        }
        Ok(())
    }
}

/// A complete harness setup: client settings plus an optional fixture and
/// the fault rules to register on it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarnessConfig {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixture: Option<FixtureConfig>,
    #[serde(default)]
    pub rules: Vec<FaultRule>,
}

impl HarnessConfig {
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&contents)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        self.client.validate()?;
        if let Some(fixture) = &self.fixture {
            fixture.validate()?;
        }
        for rule in &self.rules {
            rule.validate()?;
        }
        if !self.rules.is_empty() && self.fixture.is_none() {
            return Err(CoreError::Config(
                "rules require a fixture section".to_string(),
            ));
        }
        Ok(())
    }
}

/// Smallest head buffer that still fits a minimal request line.
const MIN_HEAD_BYTES: usize = 64;

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}

fn default_upstream_connect_timeout_ms() -> u64 {
    5000
}

fn default_head_read_timeout_ms() -> u64 {
    5000
}

fn default_max_head_bytes() -> usize {
    64 * 1024
}

fn default_true() -> bool {
    true
}

//! Mock upstream fixture: a local proxy in front of a real target that can
//! inject faults into matching requests.
//!
//! The fixture binds a listener, accepts connections on a background task,
//! reads each request head, and consults its rule table. Unmatched requests
//! are relayed to the target untouched. Dropping the fixture cancels every
//! task it spawned; [`MockUpstream::stop`] additionally waits for them.

pub mod http;
mod relay;
pub mod rules;
pub mod stats;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::FixtureConfig;
use crate::errors::FixtureError;

use self::rules::{FaultBehavior, FaultRule, RequestMatcher, RuleTable, Times};
use self::stats::{FixtureStats, FixtureStatsSnapshot};

/// Listen backlog for the fixture socket.
const LISTEN_BACKLOG: i32 = 1024;

/// Pause after a failed `accept` before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// A request the fixture received, and what it did with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedRequest {
    pub method: String,
    pub target: String,
    /// `Host` header as sent by the client.
    pub host: Option<String>,
    pub peer: SocketAddr,
    pub behavior: FaultBehavior,
}

/// State shared between the fixture handle and its tasks.
pub(crate) struct Shared {
    pub(crate) config: FixtureConfig,
    pub(crate) rules: Mutex<RuleTable>,
    pub(crate) journal: Mutex<Vec<RecordedRequest>>,
    pub(crate) stats: FixtureStats,
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A running mock upstream.
pub struct MockUpstream {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    stopped: bool,
}

impl MockUpstream {
    /// Bind the listener and start accepting connections.
    ///
    /// Must be called from within a tokio runtime. Fails with
    /// [`FixtureError::Bind`] if the listen port is already taken.
    pub async fn start(config: &FixtureConfig) -> Result<Self, FixtureError> {
        config.validate()?;

        let listener = bind_listener(config).await?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            config: config.clone(),
            rules: Mutex::new(RuleTable::default()),
            journal: Mutex::new(Vec::new()),
            stats: FixtureStats::new(),
        });
        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();

        tasks.spawn(accept_loop(
            listener,
            Arc::clone(&shared),
            shutdown.clone(),
            tasks.clone(),
        ));

        info!(
            "Mock upstream listening on {} (target {})",
            local_addr,
            config.target_addr()
        );

        Ok(Self {
            local_addr,
            shared,
            shutdown,
            tasks,
            stopped: false,
        })
    }

    /// Start a fixture and register `rules` in order.
    pub async fn start_with_rules(
        config: &FixtureConfig,
        rules: impl IntoIterator<Item = FaultRule>,
    ) -> Result<Self, FixtureError> {
        let fixture = Self::start(config).await?;
        for rule in rules {
            fixture.register_rule(rule)?;
        }
        Ok(fixture)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Host to use when sending requests to this fixture.
    pub fn host(&self) -> String {
        self.local_addr.ip().to_string()
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    pub fn config(&self) -> &FixtureConfig {
        &self.shared.config
    }

    pub fn is_running(&self) -> bool {
        !self.stopped && !self.shutdown.is_cancelled()
    }

    /// Append a rule to the rule table.
    pub fn register_rule(&self, rule: FaultRule) -> Result<(), FixtureError> {
        rule.validate()?;
        debug!(
            "Registering rule on {}: {:?} x {:?} -> {}",
            self.local_addr,
            rule.matcher,
            rule.times,
            rule.behavior.label()
        );
        lock(&self.shared.rules).push(rule);
        Ok(())
    }

    /// Start a rule for requests accepted by `matcher`, at most `times` times.
    ///
    /// ```ignore
    /// fixture.when(RequestMatcher::any(), Times::Unlimited).drop_connection()?;
    /// ```
    pub fn when(&self, matcher: RequestMatcher, times: Times) -> Expectation<'_> {
        Expectation {
            fixture: self,
            matcher,
            times,
        }
    }

    pub fn rule_count(&self) -> usize {
        lock(&self.shared.rules).len()
    }

    pub fn clear_rules(&self) {
        lock(&self.shared.rules).clear();
    }

    /// Requests received so far, in arrival order.
    pub fn recorded_requests(&self) -> Vec<RecordedRequest> {
        lock(&self.shared.journal).clone()
    }

    pub fn clear_recorded(&self) {
        lock(&self.shared.journal).clear();
    }

    /// Remove all rules and forget recorded requests.
    pub fn reset(&self) {
        self.clear_rules();
        self.clear_recorded();
    }

    pub fn stats(&self) -> FixtureStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Stop accepting, close every connection, and wait for all fixture
    /// tasks to finish. Calling it again is a no-op.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("Mock upstream on {} stopped", self.local_addr);
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        if !self.stopped {
            self.shutdown.cancel();
            self.tasks.close();
        }
    }
}

/// Pending rule created by [`MockUpstream::when`].
#[must_use = "an expectation does nothing until a behavior is applied"]
pub struct Expectation<'a> {
    fixture: &'a MockUpstream,
    matcher: RequestMatcher,
    times: Times,
}

impl Expectation<'_> {
    pub fn respond(self, behavior: FaultBehavior) -> Result<(), FixtureError> {
        self.fixture
            .register_rule(FaultRule::new(self.matcher, self.times, behavior))
    }

    pub fn drop_connection(self) -> Result<(), FixtureError> {
        self.respond(FaultBehavior::DropConnection)
    }

    pub fn delay(self, duration: Duration) -> Result<(), FixtureError> {
        self.respond(FaultBehavior::delay(duration))
    }

    pub fn status(self, status: u16) -> Result<(), FixtureError> {
        self.respond(FaultBehavior::fixed_status(status))
    }

    pub fn pass_through(self) -> Result<(), FixtureError> {
        self.respond(FaultBehavior::PassThrough)
    }
}

async fn bind_listener(config: &FixtureConfig) -> Result<TcpListener, FixtureError> {
    let listen = config.listen_addr();
    let addr = tokio::net::lookup_host(&listen)
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| FixtureError::InvalidAddress(listen.clone()))?;

    let bind_err = |source: std::io::Error| FixtureError::Bind {
        addr: addr.to_string(),
        source,
    };

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_err)?;
    // Lets a stopped fixture's port be rebound while old connections sit in
    // TIME_WAIT. Windows semantics differ (port stealing), so unix only.
    #[cfg(unix)]
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;

    TcpListener::from_std(socket.into()).map_err(bind_err)
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Shutdown requested, closing fixture listener");
                break;
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer)) => {
                        debug!("Fixture accepted connection from {}", peer);
                        tasks.spawn(relay::handle_connection(
                            stream,
                            peer,
                            Arc::clone(&shared),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!("Fixture accept error: {}", e);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                }
            }
        }
    }
}

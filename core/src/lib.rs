//! Fault-injection test kit for asynchronous HTTP clients.
//!
//! [`fixture::MockUpstream`] is a local proxy in front of a real upstream
//! that can reset, delay or short-circuit matching requests.
//! [`client::HttpClient`] is the client under test, with explicit timeouts
//! and pool settings, whose requests resolve through a
//! [`client::pending::PendingResponse`].

pub mod client;
pub mod config;
pub mod errors;
pub mod fixture;

pub use client::pending::{PendingResponse, RequestOutcome, RequestStatus};
pub use client::response::Response;
pub use client::trial::{run_trial, Target, TrialOutcome};
pub use client::HttpClient;
pub use config::{ClientConfig, FixtureConfig, HarnessConfig, PoolConfig};
pub use errors::{ClientError, CoreError, FixtureError, TransportErrorKind};
pub use fixture::rules::{FaultBehavior, FaultRule, RequestMatcher, Times};
pub use fixture::MockUpstream;

//! Fault rules: which requests a fault applies to, how often, and what the
//! fixture does with the connection.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::FixtureError;

/// What the fixture does with a connection whose request matched a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FaultBehavior {
    /// Forward the request to the target unchanged.
    PassThrough,
    /// Reset the connection without writing any HTTP framing.
    DropConnection,
    /// Hold the request for the given time, then forward it.
    Delay {
        #[serde(rename = "delayMs")]
        delay_ms: u64,
    },
    /// Answer with an empty response carrying this status code.
    FixedStatus { status: u16 },
}

impl FaultBehavior {
    pub fn delay(duration: Duration) -> Self {
        Self::Delay {
            delay_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn fixed_status(status: u16) -> Self {
        Self::FixedStatus { status }
    }

    /// Short label used in logs and the request journal.
    pub fn label(&self) -> String {
        match self {
            Self::PassThrough => "pass-through".to_string(),
            Self::DropConnection => "drop-connection".to_string(),
            Self::Delay { delay_ms } => format!("delay({delay_ms}ms)"),
            Self::FixedStatus { status } => format!("status({status})"),
        }
    }
}

/// How many times a rule may fire before it is retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "count", rename_all = "camelCase")]
pub enum Times {
    #[default]
    Unlimited,
    Exactly(u32),
}

/// Selects requests by method and path. Unset fields match anything.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMatcher {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Exact path, compared without the query string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
}

impl RequestMatcher {
    /// Matches every request.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
    }

    pub fn is_any(&self) -> bool {
        self.method.is_none() && self.path.is_none() && self.path_prefix.is_none()
    }

    pub fn matches(&self, method: &str, target: &str) -> bool {
        let path = target.split_once('?').map_or(target, |(p, _)| p);

        if let Some(m) = &self.method {
            if !m.eq_ignore_ascii_case(method) {
                return false;
            }
        }
        if let Some(p) = &self.path {
            if p != path {
                return false;
            }
        }
        if let Some(prefix) = &self.path_prefix {
            if !path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        true
    }
}

/// A matcher, a firing budget and the behaviour to apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultRule {
    #[serde(default)]
    pub matcher: RequestMatcher,
    #[serde(default)]
    pub times: Times,
    pub behavior: FaultBehavior,
}

impl FaultRule {
    pub fn new(matcher: RequestMatcher, times: Times, behavior: FaultBehavior) -> Self {
        Self {
            matcher,
            times,
            behavior,
        }
    }

    /// Apply `behavior` to every request, forever.
    pub fn always(behavior: FaultBehavior) -> Self {
        Self::new(RequestMatcher::any(), Times::Unlimited, behavior)
    }

    pub fn validate(&self) -> Result<(), FixtureError> {
        if self.times == Times::Exactly(0) {
            return Err(FixtureError::InvalidConfig(
                "rule would never fire: times is exactly 0".to_string(),
            ));
        }
        if let FaultBehavior::FixedStatus { status } = self.behavior {
            if !(100..=999).contains(&status) {
                return Err(FixtureError::InvalidConfig(format!(
                    "invalid status code {status}"
                )));
            }
        }
        Ok(())
    }
}

struct RuleEntry {
    rule: FaultRule,
    remaining: Option<u32>,
}

/// Ordered rule set. The first live rule that matches a request wins.
#[derive(Default)]
pub(crate) struct RuleTable {
    entries: Vec<RuleEntry>,
}

impl RuleTable {
    pub fn push(&mut self, rule: FaultRule) {
        let remaining = match rule.times {
            Times::Unlimited => None,
            Times::Exactly(n) => Some(n),
        };
        self.entries.push(RuleEntry { rule, remaining });
    }

    /// Pick the behaviour for a request, consuming one use of the rule.
    pub fn select(&mut self, method: &str, target: &str) -> Option<FaultBehavior> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.rule.matcher.matches(method, target))?;

        let entry = &mut self.entries[index];
        let behavior = entry.rule.behavior.clone();
        if let Some(remaining) = entry.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                self.entries.remove(index);
            }
        }
        Some(behavior)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_matcher_matches_everything() {
        let m = RequestMatcher::any();
        assert!(m.is_any());
        assert!(m.matches("GET", "/"));
        assert!(m.matches("POST", "/anything?x=1"));
    }

    #[test]
    fn matcher_by_method_and_path() {
        let m = RequestMatcher::any().method("get").path("/status");
        assert!(m.matches("GET", "/status"));
        assert!(m.matches("GET", "/status?code=200"));
        assert!(!m.matches("POST", "/status"));
        assert!(!m.matches("GET", "/status/200"));
    }

    #[test]
    fn matcher_by_prefix() {
        let m = RequestMatcher::any().path_prefix("/api/");
        assert!(m.matches("GET", "/api/users"));
        assert!(!m.matches("GET", "/health"));
    }

    #[test]
    fn first_matching_rule_wins() {
        let mut table = RuleTable::default();
        table.push(FaultRule::new(
            RequestMatcher::any().path("/slow"),
            Times::Unlimited,
            FaultBehavior::delay(Duration::from_millis(100)),
        ));
        table.push(FaultRule::always(FaultBehavior::DropConnection));

        assert_eq!(
            table.select("GET", "/slow"),
            Some(FaultBehavior::Delay { delay_ms: 100 })
        );
        assert_eq!(
            table.select("GET", "/"),
            Some(FaultBehavior::DropConnection)
        );
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn exactly_rules_retire_after_budget() {
        let mut table = RuleTable::default();
        table.push(FaultRule::new(
            RequestMatcher::any(),
            Times::Exactly(2),
            FaultBehavior::DropConnection,
        ));

        let drop = Some(FaultBehavior::DropConnection);
        assert_eq!(table.select("GET", "/"), drop);
        assert_eq!(table.select("GET", "/"), drop);
        assert_eq!(table.select("GET", "/"), None);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn unmatched_request_selects_nothing() {
        let mut table = RuleTable::default();
        table.push(FaultRule::new(
            RequestMatcher::any().method("POST"),
            Times::Unlimited,
            FaultBehavior::fixed_status(503),
        ));
        assert_eq!(table.select("GET", "/"), None);
    }

    #[test]
    fn rule_validation() {
        let rule = FaultRule::new(
            RequestMatcher::any(),
            Times::Exactly(0),
            FaultBehavior::DropConnection,
        );
        assert!(rule.validate().is_err());
        assert!(FaultRule::always(FaultBehavior::fixed_status(42))
            .validate()
            .is_err());
        assert!(FaultRule::always(FaultBehavior::fixed_status(503))
            .validate()
            .is_ok());
    }

    #[test]
    fn behavior_serde_shape() {
        let json = serde_json::to_value(FaultBehavior::delay(Duration::from_secs(2))).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "type": "delay", "delayMs": 2000 })
        );

        let parsed: FaultBehavior =
            serde_json::from_str(r#"{ "type": "fixedStatus", "status": 502 }"#).unwrap();
        assert_eq!(parsed, FaultBehavior::fixed_status(502));
    }

    #[test]
    fn times_serde_shape() {
        let parsed: Times = serde_json::from_str(r#"{ "type": "exactly", "count": 3 }"#).unwrap();
        assert_eq!(parsed, Times::Exactly(3));
        let parsed: Times = serde_json::from_str(r#"{ "type": "unlimited" }"#).unwrap();
        assert_eq!(parsed, Times::Unlimited);
    }

    #[test]
    fn behavior_labels() {
        assert_eq!(FaultBehavior::DropConnection.label(), "drop-connection");
        assert_eq!(FaultBehavior::fixed_status(503).label(), "status(503)");
    }
}

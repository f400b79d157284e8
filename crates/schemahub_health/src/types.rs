use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted health aggregate for one upstream. The in-process rolling window
/// feeding `error_rate` lives in the tracker, not here.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct UpstreamHealth {
    pub upstream: String,
    pub timestamp: DateTime<Utc>,
    pub status: HealthStatus,
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_ts: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_ts: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_message: Option<String>,
    pub avg_response_time_ms: f64,
    pub error_rate: f64,
    pub request_count: u64,
    /// Epoch seconds after which the persisted row may be reaped.
    pub ttl: i64,
    pub reopen_count: u32,
}

impl UpstreamHealth {
    pub fn new_healthy(upstream: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            upstream: upstream.into(),
            timestamp,
            status: HealthStatus::Healthy,
            circuit_state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_success_ts: None,
            last_failure_ts: None,
            last_error_message: None,
            avg_response_time_ms: 0.0,
            error_rate: 0.0,
            request_count: 0,
            ttl: 0,
            reopen_count: 0,
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use schemahub_time::Clock;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::metrics::{CIRCUIT_OPENED, CIRCUIT_STATE, UPSTREAM_ERROR_RATE};
use crate::tracker::HealthTracker;
use crate::types::{CircuitState, HealthStatus, UpstreamHealth};

/// Consecutive failures that open the circuit. Independent of the exchange
/// client's per-request retry budget.
pub const MAX_RETRIES: u32 = 5;
/// Consecutive half-open successes that close the circuit.
pub const SUCCESS_THRESHOLD: u32 = 3;
/// Initial open-circuit cooldown; doubles per reopen.
pub const CIRCUIT_OPEN_COOLDOWN: Duration = Duration::from_secs(10);
/// Backoff cap after repeated reopens.
pub const MAX_CIRCUIT_COOLDOWN: Duration = Duration::from_secs(120);
pub const DEGRADED_ERROR_RATE: f64 = 0.10;
pub const UNHEALTHY_ERROR_RATE: f64 = 0.30;

/// Wait handed to callers that lose the half-open race.
const TRANSITION_LOSER_WAIT: Duration = Duration::from_secs(30);
const MAX_ERROR_MESSAGE_LEN: usize = 500;
const RESPONSE_TIME_EMA_ALPHA: f64 = 0.2;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Circuit breaker over the shared health tracker. Callers ask for a wait
/// before each upstream attempt and report every outcome back.
pub struct CircuitBreaker {
    tracker: Arc<HealthTracker>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(
        tracker: Arc<HealthTracker>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { tracker, config, clock }
    }

    /// How long the caller must sleep before its next attempt against
    /// `upstream`. Zero means proceed now.
    pub async fn get_wait_time(&self, upstream: &str, attempt: u32) -> Duration {
        if !self.config.enabled {
            return Duration::ZERO;
        }
        let health = self.tracker.get_health(upstream).await;
        match health.circuit_state {
            CircuitState::Closed => Duration::ZERO,
            // The probe is whoever arrives here; extra callers are accepted
            // as additional recovery evidence.
            CircuitState::HalfOpen => Duration::ZERO,
            CircuitState::Open => {
                let Some(last_failure) = health.last_failure_ts else {
                    warn!(upstream, "Circuit open without a recorded failure; proceeding.");
                    return Duration::ZERO;
                };
                let cooldown = cooldown_for(health.reopen_count);
                let since_failure = (self.clock.now_utc() - last_failure)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if since_failure < cooldown {
                    let remaining = cooldown - since_failure;
                    warn!(
                        upstream,
                        attempt,
                        remaining_secs = remaining.as_secs(),
                        cooldown_secs = cooldown.as_secs(),
                        reopen_count = health.reopen_count,
                        "Circuit open; waiting out the cooldown."
                    );
                    return remaining;
                }
                if self
                    .tracker
                    .conditional_transition(upstream, CircuitState::Open, CircuitState::HalfOpen)
                    .await
                {
                    info!(upstream, cooldown_secs = cooldown.as_secs(), "Probing recovery.");
                    Duration::ZERO
                } else {
                    info!(upstream, "Recovery probe already in flight; backing off.");
                    TRANSITION_LOSER_WAIT
                }
            }
        }
    }

    /// Records a successful call; may close a half-open circuit.
    pub async fn record_success(&self, upstream: &str, response_time_ms: f64) {
        let mut health = self.tracker.get_health(upstream).await;
        health.consecutive_successes += 1;
        health.consecutive_failures = 0;
        health.last_success_ts = Some(self.clock.now_utc());
        health.request_count += 1;
        health.avg_response_time_ms = if health.avg_response_time_ms == 0.0 {
            response_time_ms
        } else {
            (1.0 - RESPONSE_TIME_EMA_ALPHA) * health.avg_response_time_ms
                + RESPONSE_TIME_EMA_ALPHA * response_time_ms
        };
        health.error_rate = self.tracker.observe(upstream, true);

        match health.circuit_state {
            CircuitState::HalfOpen if health.consecutive_successes >= SUCCESS_THRESHOLD => {
                health.circuit_state = CircuitState::Closed;
                health.status = HealthStatus::Healthy;
                health.reopen_count = 0;
                info!(
                    upstream,
                    consecutive_successes = health.consecutive_successes,
                    "Circuit closed; upstream recovered."
                );
            }
            CircuitState::Closed => {
                health.status = status_for(health.error_rate);
            }
            _ => {}
        }

        self.publish_gauges(&health);
        self.tracker.update_health(&mut health).await;
    }

    /// Records a failed call; may open the circuit.
    pub async fn record_failure(&self, upstream: &str, error_message: &str) {
        let mut health = self.tracker.get_health(upstream).await;
        health.consecutive_failures += 1;
        health.consecutive_successes = 0;
        health.last_failure_ts = Some(self.clock.now_utc());
        health.last_error_message = Some(truncate(error_message, MAX_ERROR_MESSAGE_LEN));
        health.request_count += 1;
        health.error_rate = self.tracker.observe(upstream, false);

        let circuit_opened = match health.circuit_state {
            CircuitState::Closed if health.consecutive_failures >= MAX_RETRIES => {
                error!(
                    upstream,
                    consecutive_failures = health.consecutive_failures,
                    error_message,
                    "Circuit opened."
                );
                true
            }
            CircuitState::HalfOpen => {
                error!(upstream, error_message, "Recovery probe failed; circuit reopened.");
                true
            }
            _ => false,
        };
        if circuit_opened {
            health.circuit_state = CircuitState::Open;
            health.status = HealthStatus::Unhealthy;
            health.reopen_count += 1;
            CIRCUIT_OPENED.increment(1);
            info!(
                upstream,
                reopen_count = health.reopen_count,
                next_cooldown_secs = cooldown_for(health.reopen_count).as_secs(),
                "Cooldown extended."
            );
        }

        self.publish_gauges(&health);
        self.tracker.update_health(&mut health).await;
    }

    fn publish_gauges(&self, health: &UpstreamHealth) {
        UPSTREAM_ERROR_RATE.set(health.error_rate);
        let state_value = match health.circuit_state {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        };
        CIRCUIT_STATE.set(state_value);
    }
}

/// Cooldown ladder: 10s on the first open, doubling per reopen, capped at
/// `MAX_CIRCUIT_COOLDOWN`. `reopen_count` is already incremented when the
/// circuit opens, so the exponent is one less.
pub(crate) fn cooldown_for(reopen_count: u32) -> Duration {
    let secs = CIRCUIT_OPEN_COOLDOWN
        .as_secs()
        .checked_shl(reopen_count.saturating_sub(1))
        .unwrap_or(u64::MAX)
        .min(MAX_CIRCUIT_COOLDOWN.as_secs());
    Duration::from_secs(secs)
}

fn status_for(error_rate: f64) -> HealthStatus {
    if error_rate < DEGRADED_ERROR_RATE {
        HealthStatus::Healthy
    } else if error_rate < UNHEALTHY_ERROR_RATE {
        HealthStatus::Degraded
    } else {
        HealthStatus::Unhealthy
    }
}

fn truncate(message: &str, max_len: usize) -> String {
    if message.len() <= max_len {
        return message.to_owned();
    }
    let mut cut = max_len;
    while !message.is_char_boundary(cut) {
        cut -= 1;
    }
    message[..cut].to_owned()
}

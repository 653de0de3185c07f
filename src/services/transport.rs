use std::future::Future;
use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Response, StatusCode};
use tokio::sync::Mutex;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, warn};

/// Bounds on how long and how often a call is retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed after "429 Too Many Requests" before giving up.
    pub max_throttle_retries: u32,
    /// Upper bound on an honored server-advertised retry delay.
    pub max_retry_after: Duration,
    /// Total attempts allowed when calls fail transiently (timeouts, resets, 5xx).
    pub max_transient_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_throttle_retries: 3,
            max_retry_after: Duration::from_secs(60),
            max_transient_attempts: 4,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based) after a 429.
    ///
    /// Uses the server's advice when present, otherwise `min(2 * attempt, 5)` seconds.
    pub fn throttle_delay(&self, retry_after: Option<Duration>, attempt: u32) -> Duration {
        retry_after
            .unwrap_or_else(|| Duration::from_secs(u64::from((2 * attempt).min(5))))
            .min(self.max_retry_after)
    }

    /// Exponential backoff before retry number `attempt` (1-based) after a transient failure.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// How a single remote call failed, as seen by the retry loop.
#[derive(Debug, Clone, PartialEq)]
pub enum CallError {
    /// The server asked us to slow down.
    Throttled { retry_after: Option<Duration> },
    /// Worth retrying with backoff.
    Transient(String),
    /// Retrying cannot help (bad credential, malformed request).
    Fatal(String),
}

impl From<reqwest::Error> for CallError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() || e.is_redirect() {
            CallError::Fatal(e.to_string())
        } else {
            CallError::Transient(e.to_string())
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum TransportError {
    #[error("Rate limited: gave up after {attempts} throttled attempts")]
    RateLimitedExhausted { attempts: u32 },

    #[error("Request failed after {attempts} attempts: {last_error}")]
    TransportFailed { attempts: u32, last_error: String },

    #[error("Request rejected: {0}")]
    NonRetriable(String),
}

/// Pacing state shared by every call made through one transport.
#[derive(Debug)]
struct RateState {
    interval: Duration,
    /// Slot handed to the most recent request.
    last_request: Option<Instant>,
    /// No request may start before this instant (set by server throttling).
    blocked_until: Option<Instant>,
    dispatched: u64,
    throttled: u64,
    retries: u64,
}

/// Counters observed on a transport so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub dispatched: u64,
    pub throttled: u64,
    pub retries: u64,
}

/// Outbound call discipline for remote model APIs: request pacing plus
/// bounded 429 and transient-failure retries.
///
/// Slots are reserved under the lock and waited for outside it, so concurrent
/// callers are paced process-wide without serializing the calls themselves.
pub struct RateLimitedTransport {
    state: Mutex<RateState>,
    policy: RetryPolicy,
}

impl RateLimitedTransport {
    /// `pause` overrides the interval implied by `requests_per_minute`.
    pub fn new(requests_per_minute: u32, pause: Option<Duration>, policy: RetryPolicy) -> Self {
        // Rounded up so that no 60 s window ever holds more than `requests_per_minute` slots.
        let interval = pause.unwrap_or_else(|| {
            Duration::from_nanos(60_000_000_000u64.div_ceil(u64::from(requests_per_minute.max(1))))
        });
        Self {
            state: Mutex::new(RateState {
                interval,
                last_request: None,
                blocked_until: None,
                dispatched: 0,
                throttled: 0,
                retries: 0,
            }),
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn interval(&self) -> Duration {
        self.state.lock().await.interval
    }

    pub async fn stats(&self) -> TransportStats {
        let state = self.state.lock().await;
        TransportStats {
            dispatched: state.dispatched,
            throttled: state.throttled,
            retries: state.retries,
        }
    }

    /// Reserve the next request slot and wait for it.
    async fn acquire_slot(&self) {
        let slot = {
            let mut state = self.state.lock().await;
            let mut slot = Instant::now();
            if let Some(last) = state.last_request {
                slot = slot.max(last + state.interval);
            }
            if let Some(blocked) = state.blocked_until {
                slot = slot.max(blocked);
            }
            state.last_request = Some(slot);
            state.dispatched += 1;
            slot
        };
        sleep_until(slot).await;
    }

    async fn note_throttled(&self) {
        self.state.lock().await.throttled += 1;
    }

    /// Hold back every caller of this transport until `until`.
    async fn block_until(&self, until: Instant) {
        let mut state = self.state.lock().await;
        state.retries += 1;
        state.blocked_until = Some(state.blocked_until.map_or(until, |b| b.max(until)));
    }

    async fn note_retry(&self) {
        self.state.lock().await.retries += 1;
    }

    /// Run `call` under pacing and the retry policy.
    ///
    /// `call` is invoked once per attempt and must rebuild its request each time.
    pub async fn execute<T, F, Fut>(&self, mut call: F) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let mut throttled = 0u32;
        let mut transient = 0u32;

        loop {
            self.acquire_slot().await;

            match call().await {
                Ok(value) => return Ok(value),
                Err(CallError::Throttled { retry_after }) => {
                    throttled += 1;
                    metrics::counter!("transport_throttled_total").increment(1);
                    self.note_throttled().await;
                    if throttled > self.policy.max_throttle_retries {
                        warn!(attempts = throttled, "Rate limit retries exhausted");
                        return Err(TransportError::RateLimitedExhausted { attempts: throttled });
                    }

                    let delay = self.policy.throttle_delay(retry_after, throttled);
                    warn!(
                        attempt = throttled,
                        max_retries = self.policy.max_throttle_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Rate limited by remote service, waiting"
                    );
                    metrics::counter!("transport_retries_total").increment(1);
                    self.block_until(Instant::now() + delay).await;
                }
                Err(CallError::Transient(message)) => {
                    transient += 1;
                    if transient >= self.policy.max_transient_attempts {
                        warn!(attempts = transient, error = %message, "Transient failures exhausted retry budget");
                        return Err(TransportError::TransportFailed {
                            attempts: transient,
                            last_error: message,
                        });
                    }

                    let delay = self.policy.backoff(transient);
                    warn!(
                        attempt = transient,
                        max_attempts = self.policy.max_transient_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Transient request failure, backing off"
                    );
                    metrics::counter!("transport_retries_total").increment(1);
                    self.note_retry().await;
                    sleep(delay).await;
                }
                Err(CallError::Fatal(message)) => {
                    debug!(error = %message, "Non-retriable request failure");
                    return Err(TransportError::NonRetriable(message));
                }
            }
        }
    }
}

/// Map an HTTP response onto the retry taxonomy, passing successes through.
pub async fn classify_response(response: Response) -> Result<Response, CallError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(CallError::Throttled {
            retry_after: parse_retry_after(response.headers()),
        });
    }

    let body = response.text().await.unwrap_or_default();
    let message = format!("{}: {}", status, truncate(&body, 500));
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        Err(CallError::Transient(message))
    } else {
        Err(CallError::Fatal(message))
    }
}

/// Read the advertised retry delay: `retry-after-ms` first, then `Retry-After` seconds.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let read = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
    };

    // Values too large for a Duration saturate; the policy caps them later.
    let seconds = |secs: f64| Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
    read("retry-after-ms")
        .map(|ms| seconds(ms / 1000.0))
        .or_else(|| read(RETRY_AFTER.as_str()).map(seconds))
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#![forbid(unsafe_code)]

//! Fan-out client over the mirror pool. One logical fetch walks the
//! ranked mirrors in order until a mirror answers 2xx JSON; broken
//! answers (redirects, auth walls, HTML interstitials, transport errors)
//! skip to the next mirror. A pool-wide circuit breaker stops hopeless
//! hammering after every mirror has failed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::header;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::mirrors::{MirrorPool, PIPED_USER_AGENT};

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// What a mirror answered, preserved so the proxy layer can pass it
/// through verbatim.
#[derive(Debug, Clone)]
pub struct ProxiedResponse {
    pub status: StatusCode,
    pub content_type: String,
    pub body: Bytes,
}

impl ProxiedResponse {
    /// The aggregated-failure answer when no mirror produced anything
    /// worth relaying.
    pub fn synthetic_unavailable() -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            content_type: "application/json".to_string(),
            body: Bytes::from_static(br#"{"error":"All Piped API instances unavailable"}"#),
        }
    }
}

#[derive(Debug)]
pub enum UpstreamOutcome {
    /// Some mirror answered 2xx JSON.
    Success(ProxiedResponse),
    /// Every mirror failed; carries the last real upstream error
    /// response, if any mirror produced one.
    PoolExhausted(Option<ProxiedResponse>),
    /// The breaker was open; no network attempt was made.
    CircuitOpen,
}

impl UpstreamOutcome {
    /// Collapses the outcome into a passthrough response. `CircuitOpen`
    /// stays `None`: it is "nothing was tried", not an upstream answer.
    pub fn into_proxied(self) -> Option<ProxiedResponse> {
        match self {
            Self::Success(response) => Some(response),
            Self::PoolExhausted(Some(response)) => Some(response),
            Self::PoolExhausted(None) => Some(ProxiedResponse::synthetic_unavailable()),
            Self::CircuitOpen => None,
        }
    }
}

enum BreakerState {
    Closed,
    Open { since: Instant },
}

/// Pool-wide binary breaker. Trips when an entire fan-out pass (plus
/// retries) fails, resets lazily once the cooldown has elapsed; the next
/// fetch then walks the full pool again. There is deliberately no
/// half-open single-mirror stage.
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            state: Mutex::new(BreakerState::Closed),
            cooldown,
        }
    }

    /// True when a fetch may proceed. An expired cooldown flips the
    /// state back to closed as a side effect.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            BreakerState::Closed => true,
            BreakerState::Open { since } => {
                if since.elapsed() >= self.cooldown {
                    *state = BreakerState::Closed;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn trip(&self) {
        *self.state.lock() = BreakerState::Open {
            since: Instant::now(),
        };
        warn!(cooldown_ms = self.cooldown.as_millis() as u64, "piped circuit open");
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.state.lock(), BreakerState::Open { since } if since.elapsed() < self.cooldown)
    }
}

/// How many full fan-out passes one fetch may make, and the pause
/// between them.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// Strict single pass per fetch.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    /// One retry after a short pause once the whole pool has failed.
    fn default() -> Self {
        Self {
            max_attempts: 2,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Ordered failover client. Pool and breaker are injected so several
/// clients with distinct pools can coexist (and tests can inspect both).
pub struct UpstreamClient {
    pool: Arc<MirrorPool>,
    breaker: Arc<CircuitBreaker>,
    http: reqwest::Client,
    request_timeout: Duration,
    retry: RetryPolicy,
}

enum Attempt {
    Accepted(ProxiedResponse),
    /// Categorically unusable answer; never retained as the last error.
    Skip(String),
    /// Real upstream error response, retained for the caller.
    Rejected(ProxiedResponse),
}

enum PassOutcome {
    Success(ProxiedResponse),
    Failed(Option<ProxiedResponse>),
}

impl UpstreamClient {
    pub fn new(
        pool: Arc<MirrorPool>,
        breaker: Arc<CircuitBreaker>,
        http: reqwest::Client,
        request_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            pool,
            breaker,
            http,
            request_timeout,
            retry,
        }
    }

    pub fn pool(&self) -> &MirrorPool {
        &self.pool
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Fetches `path_and_query` from the first mirror that answers 2xx
    /// JSON. Each pass tries every mirror exactly once; the breaker trips
    /// only after the final pass fails.
    pub async fn fetch(&self, path_and_query: &str) -> UpstreamOutcome {
        if !self.breaker.allow() {
            return UpstreamOutcome::CircuitOpen;
        }

        let mut last_error = None;
        let attempts = self.retry.max_attempts.max(1);
        for attempt in 1..=attempts {
            match self.fan_out(path_and_query).await {
                PassOutcome::Success(response) => return UpstreamOutcome::Success(response),
                PassOutcome::Failed(error) => {
                    if error.is_some() {
                        last_error = error;
                    }
                }
            }
            if attempt < attempts && !self.retry.delay.is_zero() {
                tokio::time::sleep(self.retry.delay).await;
            }
        }

        self.breaker.trip();
        UpstreamOutcome::PoolExhausted(last_error)
    }

    /// Typed fetch for internal callers. Any failure, including an
    /// undecodable success body, is `None`.
    pub async fn fetch_json<T: DeserializeOwned>(&self, path_and_query: &str) -> Option<T> {
        match self.fetch(path_and_query).await {
            UpstreamOutcome::Success(response) => match serde_json::from_slice(&response.body) {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!(path = %truncate_for_log(path_and_query), error = %err,
                        "piped response failed to decode");
                    None
                }
            },
            _ => None,
        }
    }

    async fn fan_out(&self, path_and_query: &str) -> PassOutcome {
        let mirrors = self.pool.snapshot();
        let mut last_error = None;
        for base in mirrors.iter() {
            match self.attempt(base, path_and_query).await {
                Attempt::Accepted(response) => return PassOutcome::Success(response),
                Attempt::Skip(reason) => {
                    warn!(mirror = %base, path = %truncate_for_log(path_and_query), %reason,
                        "piped request failed");
                }
                Attempt::Rejected(response) => {
                    warn!(mirror = %base, path = %truncate_for_log(path_and_query),
                        status = response.status.as_u16(), "piped request rejected");
                    last_error = Some(response);
                }
            }
        }
        PassOutcome::Failed(last_error)
    }

    async fn attempt(&self, base: &str, path_and_query: &str) -> Attempt {
        let url = join_mirror_url(base, path_and_query);
        let response = match self
            .http
            .get(&url)
            .timeout(self.request_timeout)
            .header(header::USER_AGENT, PIPED_USER_AGENT)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => return Attempt::Skip(format!("network error: {err}")),
        };

        let status = response.status();
        if status.is_redirection() {
            return Attempt::Skip(format!("redirect {status}"));
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Attempt::Skip(format!("auth wall {status}"));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("application/json")
            .to_string();
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(err) => return Attempt::Skip(format!("body read failed: {err}")),
        };

        if content_type.contains("text/html") {
            return Attempt::Skip("html body".to_string());
        }
        if status.is_success() {
            if content_type.contains("json") {
                return Attempt::Accepted(ProxiedResponse {
                    status,
                    content_type,
                    body,
                });
            }
            return Attempt::Skip(format!("unexpected content type {content_type}"));
        }
        Attempt::Rejected(ProxiedResponse {
            status,
            content_type,
            body,
        })
    }
}

fn join_mirror_url(base: &str, path_and_query: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path_and_query.trim_start_matches('/')
    )
}

/// Query-component encoding matching the strictness of JS
/// `encodeURIComponent`; mirror search endpoints choke on raw spaces.
pub fn encode_query_component(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z'
            | b'a'..=b'z'
            | b'0'..=b'9'
            | b'-'
            | b'_'
            | b'.'
            | b'!'
            | b'~'
            | b'*'
            | b'\''
            | b'('
            | b')' => encoded.push(byte as char),
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

/// Upstream paths can carry long nextpage tokens; logs keep a prefix.
fn truncate_for_log(path: &str) -> &str {
    match path.char_indices().nth(60) {
        Some((index, _)) => &path[..index],
        None => path,
    }
}

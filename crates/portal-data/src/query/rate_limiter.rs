//! Client-side token bucket with a FIFO wait queue.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::enrich::price::{PriceRow, PriceSource};
use crate::error::{Error, RateLimitError, TransportError};
use crate::rpc::transport::RpcTransport;

/// Float slack so a token refilled after an exact sleep is not missed.
const TOKEN_EPSILON: f64 = 1e-9;

type Grant = Result<(), RateLimitError>;

struct Waiter {
    enqueued_at: Instant,
    tx: oneshot::Sender<Grant>,
}

struct State {
    tokens: f64,
    last_refill: Instant,
    queue: VecDeque<Waiter>,
    draining: bool,
}

struct Inner {
    max_tokens: f64,
    refill_per_sec: f64,
    queue_timeout: Duration,
    state: Mutex<State>,
}

impl Inner {
    fn refill(&self, state: &mut State, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.max_tokens);
        state.last_refill = now;
    }
}

/// Token bucket shared by every query. Cloning shares the bucket.
///
/// A request runs immediately when a token is available and nobody is
/// queued; otherwise it waits its turn. Requests queued for longer than the
/// queue timeout fail with [`RateLimitError::QueueTimeout`].
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl RateLimiter {
    pub fn new(max_tokens: u32, refill_per_sec: f64, queue_timeout: Duration) -> Self {
        let max_tokens = f64::from(max_tokens.max(1));
        Self {
            inner: Arc::new(Inner {
                max_tokens,
                refill_per_sec: refill_per_sec.max(0.0),
                queue_timeout,
                state: Mutex::new(State {
                    tokens: max_tokens,
                    last_refill: Instant::now(),
                    queue: VecDeque::new(),
                    draining: false,
                }),
            }),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            config.max_tokens,
            config.refill_per_sec,
            Duration::from_secs(config.queue_timeout_secs),
        )
    }

    /// Tokens available right now.
    pub fn available(&self) -> f64 {
        let mut state = self.inner.state.lock();
        self.inner.refill(&mut state, Instant::now());
        state.tokens
    }

    pub fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Wait for a token.
    pub async fn acquire(&self) -> Result<(), RateLimitError> {
        let rx = {
            let mut state = self.inner.state.lock();
            let now = Instant::now();
            self.inner.refill(&mut state, now);
            if state.queue.is_empty() && state.tokens >= 1.0 - TOKEN_EPSILON {
                state.tokens = (state.tokens - 1.0).max(0.0);
                return Ok(());
            }

            let (tx, rx) = oneshot::channel();
            state.queue.push_back(Waiter {
                enqueued_at: now,
                tx,
            });
            tracing::debug!(queued = state.queue.len(), "rate limited, request queued");
            if !state.draining {
                state.draining = true;
                tokio::spawn(drain(self.inner.clone()));
            }
            rx
        };

        match rx.await {
            Ok(grant) => grant,
            Err(_) => Err(RateLimitError::Dropped),
        }
    }

    /// Run `f` once a token is available.
    pub async fn execute<T, F, Fut>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        self.acquire().await?;
        f().await
    }
}

/// A transport or price source whose every outbound request takes a token
/// from a shared [`RateLimiter`] first.
#[derive(Clone)]
pub struct RateLimited<S> {
    inner: S,
    limiter: RateLimiter,
}

impl<S> RateLimited<S> {
    pub fn new(inner: S, limiter: RateLimiter) -> Self {
        Self { inner, limiter }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }
}

impl<T: RpcTransport> RpcTransport for RateLimited<T> {
    async fn send(&self, payload: Value) -> Result<Value, TransportError> {
        self.limiter.acquire().await?;
        self.inner.send(payload).await
    }
}

impl<P: PriceSource> PriceSource for RateLimited<P> {
    async fn fetch_token_data(&self, symbols: &[String]) -> Result<HashMap<String, PriceRow>, Error> {
        self.limiter.acquire().await?;
        self.inner.fetch_token_data(symbols).await
    }
}

/// Hands out tokens to queued waiters in order. At most one runs per bucket.
async fn drain(inner: Arc<Inner>) {
    loop {
        let wait = {
            let mut state = inner.state.lock();
            let now = Instant::now();
            inner.refill(&mut state, now);

            while let Some(front) = state.queue.front() {
                let waited = now.saturating_duration_since(front.enqueued_at);
                if waited < inner.queue_timeout {
                    break;
                }
                if let Some(expired) = state.queue.pop_front() {
                    tracing::warn!(waited_ms = waited.as_millis() as u64, "rate limiter queue timeout");
                    let _ = expired.tx.send(Err(RateLimitError::QueueTimeout {
                        waited_ms: waited.as_millis() as u64,
                    }));
                }
            }

            while state.tokens >= 1.0 - TOKEN_EPSILON {
                let Some(waiter) = state.queue.pop_front() else {
                    break;
                };
                state.tokens = (state.tokens - 1.0).max(0.0);
                if waiter.tx.send(Ok(())).is_err() {
                    // Caller gave up; the token goes back.
                    state.tokens = (state.tokens + 1.0).min(inner.max_tokens);
                }
            }

            let Some(front) = state.queue.front() else {
                state.draining = false;
                return;
            };

            let until_expiry = inner
                .queue_timeout
                .saturating_sub(now.saturating_duration_since(front.enqueued_at));
            if inner.refill_per_sec > 0.0 {
                let deficit = (1.0 - state.tokens).max(0.0);
                until_expiry.min(Duration::from_secs_f64(deficit / inner.refill_per_sec))
            } else {
                until_expiry
            }
        };

        tokio::time::sleep(wait).await;
    }
}

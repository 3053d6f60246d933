//! Handles to the eventual result of a DAG call.
//!
//! A [`ResponseFuture`] is bound to the response id the scheduler assigned
//! to one call. It is either created already resolved (the result was pushed
//! to this client) or resolves lazily by reading the KVS until the result
//! appears. The store is eventually consistent, so "absent" just means "not
//! yet": the future keeps polling with exponential backoff until the value
//! shows up, the wait bound elapses, or the caller cancels.
//!
//! Resolution happens at most once. Concurrent [`get`](ResponseFuture::get)
//! calls share one polling loop, and once a value is cached every later call
//! returns it without touching the store.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::kvs::KvsClient;
use crate::error::{Error, Result};

/// Shortest delay between two store reads.
const MIN_BACKOFF: Duration = Duration::from_millis(1);

/// How a [`ResponseFuture`] polls the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollPolicy {
    /// Delay after the first empty read, in milliseconds.
    pub initial_backoff_ms: u64,

    /// Upper bound on the delay between reads, in milliseconds.
    pub max_backoff_ms: u64,

    /// Growth factor applied to the delay after each empty read.
    pub multiplier: f64,

    /// Total time to wait before giving up, in milliseconds. `None` waits
    /// until cancelled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_wait_ms: Option<u64>,

    /// Transient store failures tolerated before giving up.
    pub max_store_errors: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 10,
            max_backoff_ms: 1_000,
            multiplier: 2.0,
            max_wait_ms: Some(60_000), // 1 minute
            max_store_errors: 5,
        }
    }
}

impl PollPolicy {
    /// Delay after the first empty read, never below one millisecond.
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms).max(MIN_BACKOFF)
    }

    /// Upper bound on the delay between reads, never below
    /// [`initial_backoff`](Self::initial_backoff).
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms).max(self.initial_backoff())
    }

    /// Total wait bound, if any.
    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait_ms.map(Duration::from_millis)
    }

    /// Delay to use after `current`.
    pub fn next_backoff(&self, current: Duration) -> Duration {
        let max = self.max_backoff();
        Duration::try_from_secs_f64(current.as_secs_f64() * self.multiplier)
            .map_or(max, |next| next.min(max))
            .max(MIN_BACKOFF)
    }

    /// Sets the total wait bound.
    pub fn with_max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.max_wait_ms = max_wait.map(|d| d.as_millis() as u64);
        self
    }

    /// Sets the backoff range. Both bounds are rounded down to whole
    /// milliseconds, with a floor of one millisecond.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff_ms = (initial.as_millis() as u64).max(1);
        self.max_backoff_ms = (max.as_millis() as u64).max(1);
        self
    }

    /// Sets the tolerated number of transient store failures.
    pub fn with_max_store_errors(mut self, max_store_errors: u32) -> Self {
        self.max_store_errors = max_store_errors;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !(self.multiplier >= 1.0 && self.multiplier.is_finite()) {
            return Err(Error::Config(format!(
                "poll multiplier must be a finite value >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.initial_backoff_ms == 0 || self.initial_backoff_ms > self.max_backoff_ms {
            return Err(Error::Config(
                "poll backoff must satisfy 0 < initial_backoff_ms <= max_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Resolution state of a [`ResponseFuture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureState {
    /// The result has not been observed yet.
    Pending,
    /// The result is cached.
    Resolved,
}

/// The eventual result of one DAG call.
///
/// # Examples
///
/// ```
/// use cloudburst_client::client::{MemoryKvs, PollPolicy, ResponseFuture};
/// use cloudburst_client::types::Lattice;
/// use std::sync::Arc;
///
/// # async fn example() -> cloudburst_client::Result<()> {
/// let store = Arc::new(MemoryKvs::new());
/// store.put("resp-1", Lattice::lww(1, "42"))?;
///
/// let future = ResponseFuture::new("resp-1", store, PollPolicy::default());
/// assert_eq!(&future.get().await?[..], b"42");
/// # Ok(())
/// # }
/// ```
pub struct ResponseFuture {
    response_id: String,
    store: Arc<dyn KvsClient>,
    policy: PollPolicy,
    value: OnceCell<Bytes>,
}

impl std::fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseFuture")
            .field("response_id", &self.response_id)
            .field("state", &self.state())
            .field("policy", &self.policy)
            .finish()
    }
}

impl ResponseFuture {
    /// A pending future that will poll `store` for `response_id`.
    pub fn new(
        response_id: impl Into<String>,
        store: Arc<dyn KvsClient>,
        policy: PollPolicy,
    ) -> Self {
        Self {
            response_id: response_id.into(),
            store,
            policy,
            value: OnceCell::new(),
        }
    }

    /// A future whose result is already known.
    pub fn resolved(
        response_id: impl Into<String>,
        store: Arc<dyn KvsClient>,
        policy: PollPolicy,
        value: Bytes,
    ) -> Self {
        Self {
            response_id: response_id.into(),
            store,
            policy,
            value: OnceCell::new_with(Some(value)),
        }
    }

    /// The response id this future resolves.
    pub fn response_id(&self) -> &str {
        &self.response_id
    }

    /// Current state.
    pub fn state(&self) -> FutureState {
        if self.value.initialized() {
            FutureState::Resolved
        } else {
            FutureState::Pending
        }
    }

    /// Whether the result is cached.
    pub fn is_resolved(&self) -> bool {
        self.state() == FutureState::Resolved
    }

    /// The cached result, without waiting.
    pub fn try_get(&self) -> Option<Bytes> {
        self.value.get().cloned()
    }

    /// Resolves the future with `value`.
    ///
    /// Returns `false`, leaving the existing result untouched, if the
    /// future was already resolved.
    pub fn resolve_with(&self, value: Bytes) -> bool {
        self.value.set(value).is_ok()
    }

    /// Waits for the result.
    ///
    /// # Errors
    ///
    /// - [`Error::ResolutionTimeout`] when the wait bound elapses or too many
    ///   transient store failures occur.
    /// - [`Error::Store`] when the stored value cannot be reconciled.
    pub async fn get(&self) -> Result<Bytes> {
        self.get_with_cancel(&CancellationToken::new()).await
    }

    /// Waits for the result, giving up with [`Error::Cancelled`] once
    /// `cancel` fires.
    pub async fn get_with_cancel(&self, cancel: &CancellationToken) -> Result<Bytes> {
        self.value
            .get_or_try_init(|| self.poll_store(cancel))
            .await
            .cloned()
    }

    async fn poll_store(&self, cancel: &CancellationToken) -> Result<Bytes> {
        let started = Instant::now();
        let deadline = self.policy.max_wait().map(|wait| started + wait);
        let mut backoff = self.policy.initial_backoff();
        let mut attempts = 0u32;
        let mut store_errors = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(self.cancelled());
            }

            attempts += 1;
            match self.store.get(&self.response_id).await {
                Ok(Some(lattice)) => {
                    let value = lattice.reconcile(&self.response_id)?;
                    tracing::debug!(
                        response_id = %self.response_id,
                        attempts,
                        bytes = value.len(),
                        "resolved response from store"
                    );
                    return Ok(value);
                },
                Ok(None) => {
                    tracing::trace!(response_id = %self.response_id, attempts, "response not visible yet");
                },
                Err(err) if err.is_transient() => {
                    store_errors += 1;
                    if store_errors > self.policy.max_store_errors {
                        tracing::warn!(
                            response_id = %self.response_id,
                            error = %err,
                            store_errors,
                            "giving up after repeated store failures"
                        );
                        return Err(self.timed_out(started, attempts));
                    }
                    tracing::debug!(response_id = %self.response_id, error = %err, "transient store failure");
                },
                Err(err) => return Err(err.into()),
            }

            let delay = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(self.timed_out(started, attempts));
                    }
                    backoff.min(deadline - now)
                },
                None => backoff,
            };

            tokio::select! {
                () = cancel.cancelled() => return Err(self.cancelled()),
                () = tokio::time::sleep(delay) => {},
            }
            backoff = self.policy.next_backoff(backoff);
        }
    }

    fn timed_out(&self, started: Instant, attempts: u32) -> Error {
        Error::ResolutionTimeout {
            response_id: self.response_id.clone(),
            waited: started.elapsed(),
            attempts,
        }
    }

    fn cancelled(&self) -> Error {
        Error::Cancelled {
            response_id: self.response_id.clone(),
        }
    }
}

impl IntoFuture for ResponseFuture {
    type Output = Result<Bytes>;
    type IntoFuture = BoxFuture<'static, Result<Bytes>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.get().await })
    }
}

use crate::{BoxError, Error, Limiter};
use endpoint::Context;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Shared counter store for the distributed limiter. One atomic
/// increment-and-expire per decision: the TTL is set when the key is first
/// created and left untouched afterwards, so the counter dies with its
/// window.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Increment `key` by `n`, creating it with `ttl` if absent or expired,
    /// and return the post-increment value.
    async fn incr_by(&self, key: &str, n: u64, ttl: Duration) -> Result<u64, BoxError>;
}

/// In-process Store used by tests and single-node deployments.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (u64, Instant)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn incr_by(&self, key: &str, n: u64, ttl: Duration) -> Result<u64, BoxError> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();

        let value = match entries.get_mut(key) {
            Some((count, expires_at)) if *expires_at > now => {
                *count += n;
                *count
            }
            _ => {
                entries.insert(key.to_string(), (n, now + ttl));
                n
            }
        };
        Ok(value)
    }
}

/// Rate limiter whose state lives in a shared store, keyed by subject.
/// Decisions are serialized by the store; admissions per window stay within
/// the limit up to the store's own consistency.
pub struct Distributed {
    store: Arc<dyn Store>,
    key: String,
    limit: u64,
    window: Duration,
}

impl Distributed {
    pub fn new(store: Arc<dyn Store>, key: impl Into<String>, limit: u64, window: Duration) -> Self {
        Self {
            store,
            key: key.into(),
            limit,
            window,
        }
    }
}

#[async_trait::async_trait]
impl Limiter for Distributed {
    async fn allow_n(&self, _cx: &Context, n: u32) -> bool {
        match self.store.incr_by(&self.key, u64::from(n), self.window).await {
            Ok(value) => value <= self.limit,
            Err(error) => {
                // Fail open: an unreachable store must not take the service down.
                tracing::warn!(key = %self.key, %error, "rate limit store error");
                true
            }
        }
    }

    async fn wait(&self, cx: &Context) -> Result<(), Error> {
        let poll = self.window.min(Duration::from_millis(100));
        loop {
            if self.allow(cx).await {
                return Ok(());
            }
            tokio::select! {
                () = cx.done() => {
                    return Err(cx.err().unwrap_or(endpoint::Error::Cancelled).into())
                }
                () = tokio::time::sleep(poll) => (),
            }
        }
    }
}

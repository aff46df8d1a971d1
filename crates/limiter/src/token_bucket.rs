use crate::{Error, Limiter};
use endpoint::Context;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Token bucket: bursts up to `capacity`, sustained throughput bounded by
/// `rate` tokens per second. Refill is computed lazily from the monotonic
/// clock on every decision; tokens never exceed capacity.
pub struct TokenBucket {
    capacity: f64,
    rate: f64,
    state: Mutex<State>,
}

struct State {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// `rate` is tokens per second and must be positive.
    pub fn new(capacity: u32, rate: f64) -> Self {
        Self {
            capacity: f64::from(capacity),
            rate: rate.max(f64::MIN_POSITIVE),
            state: Mutex::new(State {
                tokens: f64::from(capacity),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take `n` tokens, or report how long until they will have refilled.
    fn try_take(&self, n: f64) -> Result<(), Duration> {
        let mut state = self.state.lock().unwrap();

        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= n {
            state.tokens -= n;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((n - state.tokens) / self.rate))
        }
    }
}

#[async_trait::async_trait]
impl Limiter for TokenBucket {
    async fn allow_n(&self, _cx: &Context, n: u32) -> bool {
        self.try_take(f64::from(n)).is_ok()
    }

    async fn wait(&self, cx: &Context) -> Result<(), Error> {
        loop {
            let shortfall = match self.try_take(1.0) {
                Ok(()) => return Ok(()),
                Err(shortfall) => shortfall,
            };
            tokio::select! {
                () = cx.done() => {
                    return Err(cx.err().unwrap_or(endpoint::Error::Cancelled).into())
                }
                () = tokio::time::sleep(shortfall) => (),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_then_refill() {
        let cx = Context::background();
        let bucket = TokenBucket::new(2, 2.0);

        assert!(bucket.allow(&cx).await);
        assert!(bucket.allow(&cx).await);
        assert!(!bucket.allow(&cx).await);

        // 2 tokens/sec: one token is back after ~500ms.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(bucket.allow(&cx).await);
        assert!(!bucket.allow(&cx).await);
    }

    #[tokio::test]
    async fn tokens_never_exceed_capacity() {
        let cx = Context::background();
        let bucket = TokenBucket::new(3, 1000.0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(bucket.allow_n(&cx, 3).await);
        assert!(!bucket.allow(&cx).await);
    }

    #[tokio::test]
    async fn wait_blocks_until_refill() {
        let cx = Context::background();
        let bucket = TokenBucket::new(1, 4.0);
        assert!(bucket.allow(&cx).await);

        let started = std::time::Instant::now();
        bucket.wait(&cx).await.unwrap();
        // One token refills in 250ms at 4/sec.
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn wait_observes_cancellation() {
        let cx = Context::background().with_timeout(Duration::from_millis(20));
        let bucket = TokenBucket::new(1, 0.0001);
        assert!(bucket.allow(&cx).await);

        match bucket.wait(&cx).await {
            Err(Error::Context(endpoint::Error::DeadlineExceeded)) => (),
            other => panic!("expected deadline error, got {other:?}"),
        }
    }
}

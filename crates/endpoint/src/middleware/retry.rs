use crate::{BoxError, Endpoint, Middleware};
use std::sync::Arc;
use std::time::Duration;

/// Delay growth between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Every pause equals the base delay.
    Fixed,
    /// base, 2*base, 3*base, ...
    Linear,
    /// base, 2*base, 4*base, ... (doubles per attempt).
    #[default]
    Exponential,
}

impl Backoff {
    pub fn delay(&self, attempt: u32, base: Duration) -> Duration {
        match self {
            Backoff::Fixed => base,
            Backoff::Linear => base.saturating_mul(attempt),
            Backoff::Exponential => base.saturating_mul(1u32 << (attempt - 1).min(31)),
        }
    }
}

/// Retry policy applied around an endpoint. An attempt is retried only while
/// the budget allows, the predicate approves the error, and the context is
/// live; exhaustion surfaces the last error unchanged.
pub struct Retry {
    max_attempts: u32,
    delay: Duration,
    backoff: Backoff,
    retry_if: Arc<dyn Fn(&BoxError) -> bool + Send + Sync>,
}

impl Retry {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            backoff: Backoff::default(),
            retry_if: Arc::new(|_| true),
        }
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn retry_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&BoxError) -> bool + Send + Sync + 'static,
    {
        self.retry_if = Arc::new(predicate);
        self
    }

    pub fn into_middleware<Req, Resp>(self) -> Middleware<Req, Resp>
    where
        Req: Clone + Send + 'static,
        Resp: 'static,
    {
        let Self {
            max_attempts,
            delay,
            backoff,
            retry_if,
        } = self;

        Middleware::new(move |next| {
            let retry_if = retry_if.clone();
            Endpoint::new(move |cx, req: Req| {
                let (next, retry_if) = (next.clone(), retry_if.clone());
                async move {
                    let mut attempt = 1u32;
                    loop {
                        if let Some(err) = cx.err() {
                            return Err(err.into());
                        }
                        let err = match next.call(cx.clone(), req.clone()).await {
                            Ok(resp) => return Ok(resp),
                            Err(err) => err,
                        };
                        if attempt >= max_attempts || !retry_if(&err) {
                            return Err(err);
                        }
                        tracing::debug!(attempt, error = %err, "retrying endpoint");

                        tokio::select! {
                            () = cx.done() => {
                                return Err(cx.err().unwrap_or(crate::Error::Cancelled).into())
                            }
                            () = tokio::time::sleep(backoff.delay(attempt, delay)) => (),
                        }
                        attempt += 1;
                    }
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Context;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn flaky(fail_times: u32) -> (Endpoint<(), u32>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let ep = Endpoint::new(move |_cx, ()| {
            let calls = counter.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < fail_times {
                    Err(anyhow::anyhow!("transient").into())
                } else {
                    Ok(n)
                }
            }
        });
        (ep, calls)
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures_with_exponential_backoff() {
        let (ep, calls) = flaky(2);
        let ep = Retry::new(3, Duration::from_millis(10))
            .into_middleware()
            .apply(ep);

        let started = std::time::Instant::now();
        let out = ep.call(Context::background(), ()).await.unwrap();

        assert_eq!(out, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Two pauses: 10ms then 20ms.
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn exhaustion_surfaces_the_last_error() {
        let (ep, calls) = flaky(u32::MAX);
        let ep = Retry::new(2, Duration::from_millis(1))
            .into_middleware()
            .apply(ep);

        let err = ep.call(Context::background(), ()).await.unwrap_err();
        assert_eq!(err.to_string(), "transient");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn predicate_rejection_stops_immediately() {
        let (ep, calls) = flaky(u32::MAX);
        let ep = Retry::new(5, Duration::from_millis(1))
            .retry_if(|_| false)
            .into_middleware()
            .apply(ep);

        let _ = ep.call(Context::background(), ()).await.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_backoff_sleep() {
        let (ep, _calls) = flaky(u32::MAX);
        let ep = Retry::new(10, Duration::from_secs(30))
            .into_middleware()
            .apply(ep);

        let cx = Context::background();
        let canceller = cx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let err = ep.call(cx, ()).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<crate::Error>(),
            Some(&crate::Error::Cancelled)
        );
    }

    #[test]
    fn backoff_growth() {
        let base = Duration::from_millis(10);
        assert_eq!(Backoff::Fixed.delay(3, base), base);
        assert_eq!(Backoff::Linear.delay(3, base), base * 3);
        assert_eq!(Backoff::Exponential.delay(3, base), base * 4);
    }
}

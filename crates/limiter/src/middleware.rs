//! Endpoint-layer adapters. Protocol-specific adapters (HTTP 429/504, RPC
//! ResourceExhausted/DeadlineExceeded) live with the servers.

use crate::Limiter;
use endpoint::{Endpoint, Middleware};
use response::Code;
use std::sync::Arc;

/// Non-blocking admission: rejected calls fail with a rate-limited business
/// error without reaching the endpoint.
pub fn limit<Req, Resp>(limiter: Arc<dyn Limiter>) -> Middleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: 'static,
{
    Middleware::new(move |next| {
        let limiter = limiter.clone();
        Endpoint::new(move |cx, req| {
            let (next, limiter) = (next.clone(), limiter.clone());
            async move {
                if !limiter.allow(&cx).await {
                    return Err(response::Error::new(Code::RATE_LIMITED).into());
                }
                next.call(cx, req).await
            }
        })
    })
}

/// Blocking admission: waits for a slot; a context cancelled or expired while
/// waiting surfaces the context's error.
pub fn limit_wait<Req, Resp>(limiter: Arc<dyn Limiter>) -> Middleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: 'static,
{
    Middleware::new(move |next| {
        let limiter = limiter.clone();
        Endpoint::new(move |cx, req| {
            let (next, limiter) = (next.clone(), limiter.clone());
            async move {
                limiter.wait(&cx).await?;
                next.call(cx, req).await
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FixedWindow;
    use endpoint::Context;
    use std::time::Duration;

    fn ok_endpoint() -> Endpoint<(), &'static str> {
        Endpoint::new(|_cx, ()| async { Ok("served") })
    }

    #[tokio::test]
    async fn rejection_maps_to_the_rate_limited_code() {
        let limiter = Arc::new(FixedWindow::new(1, Duration::from_secs(60)));
        let ep = limit(limiter as _).apply(ok_endpoint());

        assert_eq!(ep.call(Context::background(), ()).await.unwrap(), "served");

        let err = ep.call(Context::background(), ()).await.unwrap_err();
        assert_eq!(response::code_of(&*err), Code::RATE_LIMITED);
    }

    #[tokio::test]
    async fn blocking_variant_returns_the_context_error_on_expiry() {
        let limiter = Arc::new(FixedWindow::new(1, Duration::from_secs(60)));
        let ep = limit_wait(limiter as _).apply(ok_endpoint());

        let cx = Context::background();
        assert!(ep.call(cx.clone(), ()).await.is_ok());

        let cx = cx.with_timeout(Duration::from_millis(20));
        let err = ep.call(cx, ()).await.unwrap_err();
        let limit_err = err.downcast_ref::<crate::Error>().unwrap();
        assert!(matches!(
            limit_err,
            crate::Error::Context(endpoint::Error::DeadlineExceeded)
        ));
    }
}

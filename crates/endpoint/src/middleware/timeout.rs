use crate::{Endpoint, Error, Middleware};
use std::time::Duration;

/// Derives a per-call deadline context. The inner endpoint observes the
/// deadline through its context; if it has not returned by expiry the call
/// resolves to `Error::DeadlineExceeded` and the inner future is dropped.
pub fn timeout<Req, Resp>(after: Duration) -> Middleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: 'static,
{
    Middleware::new(move |next| {
        Endpoint::new(move |cx, req| {
            let next = next.clone();
            async move {
                let cx = cx.with_timeout(after);
                tokio::select! {
                    result = next.call(cx.clone(), req) => result,
                    () = cx.done() => {
                        Err(cx.err().unwrap_or(Error::DeadlineExceeded).into())
                    }
                }
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Context;

    #[tokio::test]
    async fn slow_endpoint_is_cut_off() {
        let ep: Endpoint<(), ()> = Endpoint::new(|_cx, ()| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        });
        let ep = timeout(Duration::from_millis(20)).apply(ep);

        let started = std::time::Instant::now();
        let err = ep.call(Context::background(), ()).await.unwrap_err();

        assert_eq!(
            err.downcast_ref::<Error>(),
            Some(&Error::DeadlineExceeded)
        );
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn deadline_is_visible_to_the_inner_endpoint() {
        let ep: Endpoint<(), bool> =
            Endpoint::new(|cx: Context, ()| async move { Ok(cx.deadline().is_some()) });
        let ep = timeout(Duration::from_secs(5)).apply(ep);

        assert!(ep.call(Context::background(), ()).await.unwrap());
    }
}

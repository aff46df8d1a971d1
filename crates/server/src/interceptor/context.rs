use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use endpoint::Context;
use limiter::extract::ClientIp;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Per-request context derivation: every request gets a child of the server's
/// shutdown token, plus the configured request deadline.
#[derive(Clone)]
pub struct CtxState {
    pub root: CancellationToken,
    pub timeout: Option<Duration>,
}

pub async fn with_context(
    State(state): State<CtxState>,
    mut req: Request,
    next: Next,
) -> Response {
    let mut cx = Context::with_cancel(state.root.child_token());
    if let Some(timeout) = state.timeout {
        cx = cx.with_timeout(timeout);
    }
    req.extensions_mut().insert(cx);
    next.run(req).await
}

/// Resolve the caller address from forwarding headers into the `ClientIp`
/// extension consumed by key extractors and handlers.
pub async fn client_ip(mut req: Request, next: Next) -> Response {
    if req.extensions().get::<ClientIp>().is_none() {
        let resolved = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|chain| chain.split(',').next())
            .map(|ip| ip.trim().to_string())
            .or_else(|| {
                req.headers()
                    .get("x-real-ip")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            });
        if let Some(ip) = resolved {
            req.extensions_mut().insert(ClientIp(ip));
        }
    }
    next.run(req).await
}

/// The request context installed by `with_context`, for use inside handlers.
pub fn request_context(req: &Request) -> Context {
    req.extensions()
        .get::<Context>()
        .cloned()
        .unwrap_or_else(Context::background)
}

use super::grpc_error;
use crate::interceptor::context::request_context;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use limiter::Keyed;
use response::{Code, Reply};

/// Whether admission failures reject immediately or wait for a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Reject,
    Wait,
}

#[derive(Clone)]
pub struct RateLimitState {
    pub keyed: Keyed<Request>,
    pub mode: Mode,
}

/// HTTP admission control: rejections are 429; a wait cut short by the
/// request deadline is 504.
pub async fn http_rate_limit(
    State(state): State<RateLimitState>,
    req: Request,
    next: Next,
) -> Response {
    let cx = request_context(&req);
    match state.mode {
        Mode::Reject => {
            if state.keyed.allow(&cx, &req).await {
                next.run(req).await
            } else {
                Reply::error(&response::Error::new(Code::RATE_LIMITED)).into_response()
            }
        }
        Mode::Wait => match state.keyed.wait(&cx, &req).await {
            Ok(()) => next.run(req).await,
            Err(error) => {
                tracing::debug!(%error, "gave up waiting for rate limit admission");
                Reply::error(&response::Error::new(Code::TIMEOUT)).into_response()
            }
        },
    }
}

/// RPC admission control: ResourceExhausted on rejection, DeadlineExceeded
/// when a wait is cut short.
pub async fn grpc_rate_limit(
    State(state): State<RateLimitState>,
    req: Request,
    next: Next,
) -> Response {
    let cx = request_context(&req);
    match state.mode {
        Mode::Reject => {
            if state.keyed.allow(&cx, &req).await {
                next.run(req).await
            } else {
                grpc_error(tonic::Code::ResourceExhausted, "rate limit exceeded")
            }
        }
        Mode::Wait => match state.keyed.wait(&cx, &req).await {
            Ok(()) => next.run(req).await,
            Err(_) => grpc_error(tonic::Code::DeadlineExceeded, "rate limit wait expired"),
        },
    }
}

//! Cross-cutting request interceptors assembled by the server adapters.
//! All of them operate at the tower/axum level so the same implementations
//! serve plain HTTP and gRPC-over-HTTP/2.

mod auth_mw;
mod context;
mod panic_handler;
mod ratelimit;

pub use auth_mw::{credentials_from_headers, grpc_auth, http_auth, GrpcAuthState, HttpAuthState};
pub use context::{client_ip, request_context, with_context, CtxState};
pub use panic_handler::{grpc_panic, http_panic};
pub use ratelimit::{grpc_rate_limit, http_rate_limit, Mode, RateLimitState};

/// A gRPC trailers-only error response, usable from any tower layer.
pub(crate) fn grpc_error(code: tonic::Code, message: &str) -> axum::response::Response {
    http::Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/grpc")
        .header("grpc-status", (code as i32).to_string())
        .header("grpc-message", message)
        .body(axum::body::Body::empty())
        .expect("static grpc error response")
}

use super::grpc_error;
use crate::interceptor::context::request_context;
use auth::{Authenticator, Credentials, MethodSkipper, PathSkipper};
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http::HeaderMap;
use response::{Code, Reply};
use std::sync::Arc;

/// Derive unverified credentials from request headers: `Authorization:
/// Bearer`/`Basic`, or `x-api-key`.
pub fn credentials_from_headers(headers: &HeaderMap) -> Option<Credentials> {
    if let Some(authorization) = headers.get(http::header::AUTHORIZATION) {
        let value = authorization.to_str().ok()?;
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(Credentials::bearer(token));
        }
        if let Some(token) = value.strip_prefix("Basic ") {
            return Some(Credentials::basic(token));
        }
        return None;
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(Credentials::api_key)
}

#[derive(Clone)]
pub struct HttpAuthState {
    pub authenticator: Arc<dyn Authenticator>,
    pub skipper: PathSkipper,
}

/// HTTP authentication with a path-based skipper. Verified principals land in
/// request extensions; failures are JSON replies with the auth code space.
pub async fn http_auth(
    State(state): State<HttpAuthState>,
    mut req: Request,
    next: Next,
) -> Response {
    if state.skipper.matches(req.uri().path()) {
        return next.run(req).await;
    }

    let Some(credentials) = credentials_from_headers(req.headers()) else {
        return Reply::error(&response::Error::new(Code::UNAUTHENTICATED)).into_response();
    };

    let cx = request_context(&req);
    match state.authenticator.authenticate(&cx, credentials).await {
        Ok(principal) if principal.is_valid() => {
            req.extensions_mut().insert(principal);
            next.run(req).await
        }
        Ok(_) => Reply::error(&response::Error::new(Code::TOKEN_EXPIRED)).into_response(),
        Err(error) => {
            tracing::warn!(%error, path = %req.uri().path(), "authentication failed");
            Reply::error(&response::Error::new(Code::UNAUTHENTICATED)).into_response()
        }
    }
}

#[derive(Clone)]
pub struct GrpcAuthState {
    pub authenticator: Arc<dyn Authenticator>,
    pub skipper: MethodSkipper,
}

/// RPC authentication over call metadata, with a full-method skipper
/// (`/pkg.Service/Method` or `/pkg.Service/*`). Failures map to
/// Unauthenticated.
pub async fn grpc_auth(
    State(state): State<GrpcAuthState>,
    mut req: Request,
    next: Next,
) -> Response {
    if state.skipper.matches(req.uri().path()) {
        return next.run(req).await;
    }

    let Some(credentials) = credentials_from_headers(req.headers()) else {
        return grpc_error(tonic::Code::Unauthenticated, "missing credentials");
    };

    let cx = request_context(&req);
    match state.authenticator.authenticate(&cx, credentials).await {
        Ok(principal) if principal.is_valid() => {
            req.extensions_mut().insert(principal);
            next.run(req).await
        }
        Ok(_) => grpc_error(tonic::Code::Unauthenticated, "credentials expired"),
        Err(error) => {
            tracing::warn!(%error, method = %req.uri().path(), "authentication failed");
            grpc_error(tonic::Code::Unauthenticated, "unauthenticated")
        }
    }
}

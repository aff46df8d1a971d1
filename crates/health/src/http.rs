//! HTTP surface: `/healthz` (liveness) and `/readyz` (readiness), GET only.
//! UP maps to 200, anything else to 503; bodies are the full JSON report and
//! are never cacheable.

use crate::{Manager, Report, Status};
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use endpoint::Context;
use http::{header, Method, StatusCode};
use std::sync::Arc;

pub const LIVENESS_PATH: &str = "/healthz";
pub const READINESS_PATH: &str = "/readyz";

/// A standalone router serving both health paths.
pub fn router(manager: Arc<Manager>) -> axum::Router {
    axum::Router::new()
        .route(LIVENESS_PATH, axum::routing::get(liveness))
        .route(READINESS_PATH, axum::routing::get(readiness))
        .with_state(manager)
}

/// Intercept the health paths ahead of the wrapped application router.
pub fn layer(router: axum::Router, manager: Arc<Manager>) -> axum::Router {
    router.layer(axum::middleware::from_fn_with_state(manager, intercept))
}

async fn intercept(
    State(manager): State<Arc<Manager>>,
    req: Request,
    next: Next,
) -> Response {
    let report = match req.uri().path() {
        LIVENESS_PATH if req.method() == Method::GET => {
            manager.liveness(&request_context(&req)).await
        }
        READINESS_PATH if req.method() == Method::GET => {
            manager.readiness(&request_context(&req)).await
        }
        LIVENESS_PATH | READINESS_PATH => {
            return StatusCode::METHOD_NOT_ALLOWED.into_response()
        }
        _ => return next.run(req).await,
    };
    respond(report)
}

async fn liveness(State(manager): State<Arc<Manager>>, req: Request) -> Response {
    respond(manager.liveness(&request_context(&req)).await)
}

async fn readiness(State(manager): State<Arc<Manager>>, req: Request) -> Response {
    respond(manager.readiness(&request_context(&req)).await)
}

fn request_context(req: &Request) -> Context {
    req.extensions()
        .get::<Context>()
        .cloned()
        .unwrap_or_else(Context::background)
}

fn respond(report: Report) -> Response {
    let status = if report.status == Status::Up {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        [(header::CACHE_CONTROL, "no-store")],
        axum::Json(report),
    )
        .into_response()
}

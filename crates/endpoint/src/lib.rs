mod context;
pub use context::Context;

pub mod middleware;

use std::sync::Arc;

/// Boxed error type shared by every endpoint. Concrete error types are
/// recovered by walking the source chain (see the `response` crate).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type BoxFuture<T> = futures::future::BoxFuture<'static, T>;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("context canceled")]
    Cancelled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    #[error("recovered from panic: {0}")]
    Panic(String),
}

/// Endpoint is the uniform callable representing one RPC method:
/// `(Context, request) -> response | error`. Endpoints are values and are
/// freely composed; the framework attaches no meaning to the request or
/// response payloads.
pub struct Endpoint<Req, Resp> {
    f: Arc<dyn Fn(Context, Req) -> BoxFuture<Result<Resp, BoxError>> + Send + Sync>,
}

impl<Req, Resp> Clone for Endpoint<Req, Resp> {
    fn clone(&self) -> Self {
        Self { f: self.f.clone() }
    }
}

impl<Req, Resp> Endpoint<Req, Resp> {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Resp, BoxError>> + Send + 'static,
    {
        Self {
            f: Arc::new(move |cx, req| Box::pin(f(cx, req))),
        }
    }

    pub async fn call(&self, cx: Context, req: Req) -> Result<Resp, BoxError> {
        (self.f)(cx, req).await
    }
}

/// Middleware wraps an Endpoint to add cross-cutting behavior.
pub struct Middleware<Req, Resp> {
    f: Arc<dyn Fn(Endpoint<Req, Resp>) -> Endpoint<Req, Resp> + Send + Sync>,
}

impl<Req, Resp> Clone for Middleware<Req, Resp> {
    fn clone(&self) -> Self {
        Self { f: self.f.clone() }
    }
}

impl<Req, Resp> Middleware<Req, Resp> {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Endpoint<Req, Resp>) -> Endpoint<Req, Resp> + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }

    pub fn apply(&self, next: Endpoint<Req, Resp>) -> Endpoint<Req, Resp> {
        (self.f)(next)
    }
}

/// Compose middlewares into one. `chain([m1, m2, m3]).apply(e)` yields
/// `m1(m2(m3(e)))`: m1 is outermost, first on entry and last on unwind.
/// The composition is pure; a middleware that returns `next` unchanged is a
/// no-op.
pub fn chain<Req, Resp>(middlewares: Vec<Middleware<Req, Resp>>) -> Middleware<Req, Resp>
where
    Req: 'static,
    Resp: 'static,
{
    Middleware::new(move |next| {
        middlewares
            .iter()
            .rev()
            .fold(next, |wrapped, mw| mw.apply(wrapped))
    })
}

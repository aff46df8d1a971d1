use crate::interceptor::{
    client_ip, http_auth, http_panic, http_rate_limit, with_context, CtxState, HttpAuthState,
    Mode, RateLimitState,
};
use crate::{Error, Lifecycle, Server};
use auth::{Authenticator, PathSkipper};
use axum::middleware::{from_fn, from_fn_with_state};
use endpoint::Context;
use limiter::Keyed;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub name: String,
    pub addr: SocketAddr,
    /// Paths exempt from authentication: exact, or a `prefix*` pattern.
    pub public_paths: Vec<String>,
    #[serde(with = "humantime_serde::option")]
    pub request_timeout: Option<Duration>,
    /// Resolve the caller address from forwarding headers.
    pub resolve_client_ip: bool,
    /// Serve the Prometheus scrape endpoint on this listener.
    pub serve_metrics: bool,
    /// Upper bound on graceful shutdown; the earlier of this and the stop
    /// context's deadline wins.
    #[serde(with = "humantime_serde")]
    pub graceful_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            name: "http".to_string(),
            addr: "0.0.0.0:8080".parse().expect("static address"),
            public_paths: Vec::new(),
            request_timeout: None,
            resolve_client_ip: false,
            serve_metrics: false,
            graceful_timeout: Duration::from_secs(30),
        }
    }
}

/// HTTP server: a user router wrapped with, outermost first, panic recovery,
/// tracing, request-context derivation, health interception, client-IP
/// resolution, authentication (path skipper), and rate limiting.
pub struct HttpServer {
    config: HttpConfig,
    router: axum::Router,
    health: Arc<health::Manager>,
    authenticator: Option<Arc<dyn Authenticator>>,
    ratelimit: Option<RateLimitState>,
    lifecycle: Lifecycle,
    bound: Mutex<Option<SocketAddr>>,
}

impl HttpServer {
    pub fn new(config: HttpConfig, router: axum::Router) -> Self {
        Self {
            config,
            router,
            health: Arc::new(health::Manager::new()),
            authenticator: None,
            ratelimit: None,
            lifecycle: Lifecycle::new(),
            bound: Mutex::new(None),
        }
    }

    pub fn with_health(mut self, manager: Arc<health::Manager>) -> Self {
        self.health = manager;
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn with_rate_limit(mut self, keyed: Keyed<axum::extract::Request>, mode: Mode) -> Self {
        self.ratelimit = Some(RateLimitState { keyed, mode });
        self
    }

    pub fn health_manager(&self) -> Arc<health::Manager> {
        self.health.clone()
    }

    pub(crate) fn build_router(&self) -> axum::Router {
        let mut app = self.router.clone();

        if self.config.serve_metrics {
            app = app.merge(crate::metrics::build_router());
        }
        if let Some(state) = &self.ratelimit {
            app = app.layer(from_fn_with_state(state.clone(), http_rate_limit));
        }
        if let Some(authenticator) = &self.authenticator {
            let mut public = self.config.public_paths.clone();
            if self.config.serve_metrics {
                public.push("/metrics".to_string());
            }
            let state = HttpAuthState {
                authenticator: authenticator.clone(),
                skipper: PathSkipper::new(public),
            };
            app = app.layer(from_fn_with_state(state, http_auth));
        }
        if self.config.resolve_client_ip {
            app = app.layer(from_fn(client_ip));
        }
        app = health::http::layer(app, self.health.clone());
        app = app.layer(from_fn_with_state(
            CtxState {
                root: self.lifecycle.shutdown.clone(),
                timeout: self.config.request_timeout,
            },
            with_context,
        ));
        app.layer(TraceLayer::new_for_http())
            .layer(CatchPanicLayer::custom(http_panic))
    }
}

#[async_trait::async_trait]
impl Server for HttpServer {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn addr(&self) -> SocketAddr {
        self.bound.lock().unwrap().unwrap_or(self.config.addr)
    }

    async fn start(&self, cx: Context) -> Result<(), Error> {
        self.lifecycle.claim_start()?;

        let listener = match tokio::net::TcpListener::bind(self.config.addr).await {
            Ok(listener) => listener,
            Err(source) => {
                self.lifecycle.mark_done();
                return Err(Error::Bind {
                    addr: self.config.addr,
                    source,
                });
            }
        };
        let local = listener.local_addr()?;
        *self.bound.lock().unwrap() = Some(local);
        tracing::info!(name = %self.config.name, addr = %local, "http server listening");

        let app = self.build_router();
        let shutdown = {
            let cx = cx.clone();
            let token = self.lifecycle.shutdown.clone();
            async move {
                tokio::select! {
                    () = cx.done() => (),
                    () = token.cancelled() => (),
                }
            }
        };

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await;
        self.lifecycle.mark_done();
        tracing::info!(name = %self.config.name, "http server stopped");
        served.map_err(Error::Io)
    }

    async fn stop(&self, cx: Context) -> Result<(), Error> {
        let cx = cx.with_timeout(self.config.graceful_timeout);
        self.lifecycle.stop(&cx).await
    }

    fn health_endpoint(&self) -> Option<String> {
        Some(format!("http://{}{}", self.addr(), health::http::LIVENESS_PATH))
    }
}

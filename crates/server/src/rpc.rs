use crate::interceptor::{
    grpc_auth, grpc_panic, grpc_rate_limit, with_context, CtxState, GrpcAuthState, Mode,
    RateLimitState,
};
use crate::{Error, Lifecycle, Server};
use auth::{Authenticator, MethodSkipper};
use endpoint::Context;
use health::HealthService;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use limiter::Keyed;
use proto_health::v1::health_check_response::ServingStatus;
use proto_health::v1::health_server::HealthServer;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tonic::service::Routes;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub name: String,
    pub addr: SocketAddr,
    /// HTTP/2 keepalive ping cadence and ack deadline.
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub keepalive_timeout: Duration,
    #[serde(with = "humantime_serde::option")]
    pub tcp_keepalive: Option<Duration>,
    /// Full methods exempt from authentication: `/pkg.Service/Method`, or a
    /// service wildcard `/pkg.Service/*`. The health service is always
    /// exempt.
    pub public_methods: Vec<String>,
    #[serde(with = "humantime_serde::option")]
    pub request_timeout: Option<Duration>,
    /// Upper bound on graceful shutdown; the earlier of this and the stop
    /// context's deadline wins.
    #[serde(with = "humantime_serde")]
    pub graceful_timeout: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            name: "rpc".to_string(),
            addr: "0.0.0.0:9000".parse().expect("static address"),
            keepalive_interval: Duration::from_secs(60),
            keepalive_timeout: Duration::from_secs(20),
            tcp_keepalive: Some(Duration::from_secs(60)),
            public_methods: Vec::new(),
            request_timeout: None,
            graceful_timeout: Duration::from_secs(30),
        }
    }
}

/// RPC server: tonic service routes behind, outermost first, panic recovery,
/// tracing, request-context derivation, rate limiting, and authentication,
/// served on a keepalive-tuned HTTP/2 accept loop. The standard health
/// service is always registered.
pub struct RpcServer {
    config: RpcConfig,
    routes: Routes,
    health: Arc<health::Manager>,
    health_service: Arc<HealthService>,
    authenticator: Option<Arc<dyn Authenticator>>,
    ratelimit: Option<RateLimitState>,
    router_hooks: Vec<Box<dyn Fn(axum::Router) -> axum::Router + Send + Sync>>,
    lifecycle: Lifecycle,
    bound: Mutex<Option<SocketAddr>>,
}

impl RpcServer {
    pub fn new(config: RpcConfig, health: Arc<health::Manager>) -> Self {
        let health_service = Arc::new(HealthService::new(health.clone()));
        let routes =
            Routes::default().add_service(HealthServer::from_arc(health_service.clone()));
        Self {
            config,
            routes,
            health,
            health_service,
            authenticator: None,
            ratelimit: None,
            router_hooks: Vec::new(),
            lifecycle: Lifecycle::new(),
            bound: Mutex::new(None),
        }
    }

    /// Register a user service ahead of `start`.
    pub fn add_service<S>(&mut self, svc: S) -> &mut Self
    where
        S: tower::Service<
                http::Request<tonic::body::BoxBody>,
                Response = http::Response<tonic::body::BoxBody>,
                Error = std::convert::Infallible,
            > + tonic::server::NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        let routes = std::mem::take(&mut self.routes);
        self.routes = routes.add_service(svc);
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

    /// Auxiliary user interceptors, applied inside the assembled chain
    /// (after authentication, around the service routes).
    pub fn with_router_layer<F>(mut self, layer: F) -> Self
    where
        F: Fn(axum::Router) -> axum::Router + Send + Sync + 'static,
    {
        self.router_hooks.push(Box::new(layer));
        self
    }

    /// Handle for manual serving-status overrides (pre-shutdown masking).
    pub fn health_service(&self) -> Arc<HealthService> {
        self.health_service.clone()
    }

    pub fn health_manager(&self) -> Arc<health::Manager> {
        self.health.clone()
    }

    pub(crate) fn build_router(&self) -> axum::Router {
        let mut app = self.routes.clone().into_axum_router();

        for hook in &self.router_hooks {
            app = hook(app);
        }
        if let Some(authenticator) = &self.authenticator {
            let mut public = self.config.public_methods.clone();
            public.push(format!("/{}/*", proto_health::v1::health_server::SERVICE_NAME));
            let state = GrpcAuthState {
                authenticator: authenticator.clone(),
                skipper: MethodSkipper::new(public),
            };
            app = app.layer(axum::middleware::from_fn_with_state(state, grpc_auth));
        }
        // Rate limiting wraps authentication; an over-limit caller never
        // reaches the authenticator.
        if let Some(state) = &self.ratelimit {
            app = app.layer(axum::middleware::from_fn_with_state(
                state.clone(),
                grpc_rate_limit,
            ));
        }
        app = app.layer(axum::middleware::from_fn_with_state(
            CtxState {
                root: self.lifecycle.shutdown.clone(),
                timeout: self.config.request_timeout,
            },
            with_context,
        ));
        app.layer(TraceLayer::new_for_grpc())
            .layer(CatchPanicLayer::custom(grpc_panic))
    }
}

#[async_trait::async_trait]
impl Server for RpcServer {
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
        tracing::info!(name = %self.config.name, addr = %local, "rpc server listening");

        let app = self.build_router();
        let graceful = hyper_util::server::graceful::GracefulShutdown::new();

        let mut builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
        builder
            .http2()
            .keep_alive_interval(self.config.keepalive_interval)
            .keep_alive_timeout(self.config.keepalive_timeout);

        loop {
            let (stream, peer) = tokio::select! {
                () = cx.done() => break,
                () = self.lifecycle.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        tracing::warn!(%error, "accept failed");
                        continue;
                    }
                },
            };

            tracing::debug!(%peer, "accepted connection");
            if let Some(keepalive) = self.config.tcp_keepalive {
                let params = socket2::TcpKeepalive::new().with_time(keepalive);
                if let Err(error) = socket2::SockRef::from(&stream).set_tcp_keepalive(&params) {
                    tracing::debug!(%error, %peer, "failed to set tcp keepalive");
                }
            }

            let service = TowerToHyperService::new(app.clone());
            let connection = builder
                .serve_connection_with_upgrades(TokioIo::new(stream), service)
                .into_owned();
            let watched = graceful.watch(connection);
            tokio::spawn(async move {
                if let Err(error) = watched.await {
                    tracing::debug!(error = %error, "connection closed with error");
                }
            });
        }

        // Mask the health status so load balancers drain us, then let
        // in-flight streams finish.
        self.health_service
            .set_serving_status("", ServingStatus::NotServing);
        drop(listener);
        graceful.shutdown().await;

        self.lifecycle.mark_done();
        tracing::info!(name = %self.config.name, "rpc server stopped");
        Ok(())
    }

    async fn stop(&self, cx: Context) -> Result<(), Error> {
        let cx = cx.with_timeout(self.config.graceful_timeout);
        self.lifecycle.stop(&cx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use auth::Credentials;
    use proto_health::v1::health_client::HealthClient;
    use proto_health::v1::HealthCheckRequest;
    use tower::util::ServiceExt;

    struct RejectAll;

    #[async_trait::async_trait]
    impl Authenticator for RejectAll {
        async fn authenticate(
            &self,
            _cx: &Context,
            _credentials: Credentials,
        ) -> Result<auth::Principal, auth::Error> {
            Err(auth::Error::InvalidCredentials)
        }
    }

    fn test_config() -> RpcConfig {
        RpcConfig {
            addr: "127.0.0.1:0".parse().unwrap(),
            ..RpcConfig::default()
        }
    }

    async fn wait_for_addr(server: &RpcServer) -> SocketAddr {
        for _ in 0..100 {
            let addr = server.addr();
            if addr.port() != 0 {
                return addr;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("server never bound");
    }

    #[tokio::test]
    async fn serves_the_health_service_end_to_end() {
        let server = Arc::new(RpcServer::new(
            test_config(),
            Arc::new(health::Manager::new()),
        ));

        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.start(Context::background()).await })
        };
        let addr = wait_for_addr(&server).await;

        let mut client = HealthClient::connect(format!("http://{addr}"))
            .await
            .unwrap();

        let response = client
            .check(HealthCheckRequest {
                service: String::new(),
            })
            .await
            .unwrap();
        assert_eq!(response.into_inner().status(), ServingStatus::Serving);

        let not_found = client
            .check(HealthCheckRequest {
                service: "billing".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(not_found.code(), tonic::Code::NotFound);

        let stop_cx = Context::background().with_timeout(Duration::from_secs(5));
        server.stop(stop_cx).await.unwrap();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unauthenticated_calls_are_rejected_before_dispatch() {
        let server = RpcServer::new(test_config(), Arc::new(health::Manager::new()))
            .with_authenticator(Arc::new(RejectAll));
        let app = server.build_router();

        let response = app
            .oneshot(
                http::Request::post("/api.Orders/Get")
                    .header("content-type", "application/grpc")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response.headers()["grpc-status"],
            (tonic::Code::Unauthenticated as i32).to_string().as_str()
        );
    }

    #[tokio::test]
    async fn health_service_is_always_publicly_reachable() {
        let server = Arc::new(
            RpcServer::new(test_config(), Arc::new(health::Manager::new()))
                .with_authenticator(Arc::new(RejectAll)),
        );

        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.start(Context::background()).await })
        };
        let addr = wait_for_addr(&server).await;

        let mut client = HealthClient::connect(format!("http://{addr}"))
            .await
            .unwrap();
        let response = client
            .check(HealthCheckRequest {
                service: String::new(),
            })
            .await
            .unwrap();
        assert_eq!(response.into_inner().status(), ServingStatus::Serving);

        let stop_cx = Context::background().with_timeout(Duration::from_secs(5));
        server.stop(stop_cx).await.unwrap();
        serving.await.unwrap().unwrap();
    }
}

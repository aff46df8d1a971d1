use crate::{Error, HttpConfig, HttpServer, RpcServer, Server};
use endpoint::Context;
use std::net::SocketAddr;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub name: String,
    pub http_addr: SocketAddr,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            name: "gateway".to_string(),
            http_addr: "0.0.0.0:8080".parse().expect("static address"),
        }
    }
}

/// Dual-protocol server: an embedded RPC server plus an HTTP-to-RPC gateway
/// on a second port. The gateway router proxies into the RPC listener over a
/// lazily-dialed loopback channel, so authentication applied at the RPC
/// interceptor level protects both surfaces. Health is served over HTTP.
pub struct GatewayServer {
    config: GatewayConfig,
    rpc: RpcServer,
    http: HttpServer,
}

impl GatewayServer {
    /// `build_gateway` receives the channel to the embedded RPC server and
    /// returns the HTTP-to-RPC proxy router (typically generated client
    /// handlers).
    pub fn new<F>(
        config: GatewayConfig,
        rpc: RpcServer,
        build_gateway: F,
    ) -> Result<Self, Error>
    where
        F: FnOnce(tonic::transport::Channel) -> axum::Router,
    {
        let channel =
            tonic::transport::Endpoint::from_shared(format!("http://{}", rpc.addr()))?
                .connect_lazy();
        let router = build_gateway(channel);

        let http = HttpServer::new(
            HttpConfig {
                name: format!("{}-http", config.name),
                addr: config.http_addr,
                ..HttpConfig::default()
            },
            router,
        )
        .with_health(rpc.health_manager());

        Ok(Self { config, rpc, http })
    }

    pub fn rpc(&self) -> &RpcServer {
        &self.rpc
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http.addr()
    }
}

#[async_trait::async_trait]
impl Server for GatewayServer {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn addr(&self) -> SocketAddr {
        self.rpc.addr()
    }

    async fn start(&self, cx: Context) -> Result<(), Error> {
        let ((), ()) = futures::try_join!(self.rpc.start(cx.clone()), self.http.start(cx))?;
        Ok(())
    }

    async fn stop(&self, cx: Context) -> Result<(), Error> {
        // Edge traffic first, then the embedded RPC listener.
        self.http.stop(cx.clone()).await?;
        self.rpc.stop(cx).await
    }

    fn health_endpoint(&self) -> Option<String> {
        Some(format!(
            "http://{}{}",
            self.http.addr(),
            health::http::LIVENESS_PATH
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RpcConfig;
    use axum::routing::get;
    use proto_health::v1::health_client::HealthClient;
    use proto_health::v1::HealthCheckRequest;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn free_addr() -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(
                format!("GET {path} HTTP/1.1\r\nhost: gateway\r\nconnection: close\r\n\r\n")
                    .as_bytes(),
            )
            .await
            .unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf).into_owned()
    }

    #[tokio::test]
    async fn serves_both_surfaces_and_proxies_http_into_rpc() {
        let rpc_addr = free_addr().await;
        let rpc = RpcServer::new(
            RpcConfig {
                addr: rpc_addr,
                ..RpcConfig::default()
            },
            Arc::new(health::Manager::new()),
        );

        let gateway = GatewayServer::new(
            GatewayConfig {
                http_addr: "127.0.0.1:0".parse().unwrap(),
                ..GatewayConfig::default()
            },
            rpc,
            |channel| {
                axum::Router::new().route(
                    "/v1/status",
                    get(move || {
                        let channel = channel.clone();
                        async move {
                            let mut client = HealthClient::new(channel);
                            match client
                                .check(HealthCheckRequest {
                                    service: String::new(),
                                })
                                .await
                            {
                                Ok(response) => {
                                    format!("{:?}", response.into_inner().status())
                                }
                                Err(status) => format!("error: {}", status.code()),
                            }
                        }
                    }),
                )
            },
        )
        .unwrap();
        let gateway = Arc::new(gateway);

        let serving = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.start(Context::background()).await })
        };

        let mut http_addr = gateway.http_addr();
        for _ in 0..100 {
            if http_addr.port() != 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            http_addr = gateway.http_addr();
        }

        // Health over the HTTP surface.
        let health = http_get(http_addr, "/healthz").await;
        assert!(health.contains("200 OK"), "{health}");
        assert!(health.contains("UP"));

        // HTTP proxied into the embedded RPC server.
        let proxied = http_get(http_addr, "/v1/status").await;
        assert!(proxied.contains("Serving"), "{proxied}");

        let stop_cx = Context::background().with_timeout(Duration::from_secs(5));
        gateway.stop(stop_cx).await.unwrap();
        serving.await.unwrap().unwrap();
    }
}

//! RPC surface implementing the standard `grpc.health.v1.Health` service.
//!
//! The empty service name and `readiness` resolve against the readiness lane,
//! `liveness` against the liveness lane, and anything else is NOT_FOUND
//! unless a manual override has been installed via `set_serving_status`
//! (used to mask a server DOWN ahead of shutdown).

use crate::{Manager, Status};
use endpoint::Context;
use futures::StreamExt;
use proto_health::v1::health_check_response::ServingStatus;
use proto_health::v1::{health_server, HealthCheckRequest, HealthCheckResponse};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

pub const LIVENESS_SERVICE: &str = "liveness";
pub const READINESS_SERVICE: &str = "readiness";

pub struct HealthService {
    manager: Arc<Manager>,
    overrides: Mutex<HashMap<String, ServingStatus>>,
}

impl HealthService {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self {
            manager,
            overrides: Mutex::new(HashMap::new()),
        }
    }

    pub fn into_server(self) -> health_server::HealthServer<HealthService> {
        health_server::HealthServer::new(self)
    }

    /// Manually pin the reported status of `service`, masking lane results.
    pub fn set_serving_status(&self, service: &str, status: ServingStatus) {
        self.overrides
            .lock()
            .unwrap()
            .insert(service.to_string(), status);
    }

    /// Drop a manual override, returning `service` to lane dispatch.
    pub fn clear_serving_status(&self, service: &str) {
        self.overrides.lock().unwrap().remove(service);
    }

    async fn resolve(&self, service: &str) -> Result<ServingStatus, tonic::Status> {
        if let Some(pinned) = self.overrides.lock().unwrap().get(service) {
            return Ok(*pinned);
        }

        let cx = Context::background();
        let report = match service {
            "" | READINESS_SERVICE => self.manager.readiness(&cx).await,
            LIVENESS_SERVICE => self.manager.liveness(&cx).await,
            unknown => {
                return Err(tonic::Status::not_found(format!(
                    "unknown service '{unknown}'"
                )))
            }
        };
        Ok(serving_status(report.status))
    }
}

fn serving_status(status: Status) -> ServingStatus {
    match status {
        Status::Up => ServingStatus::Serving,
        Status::Down => ServingStatus::NotServing,
        Status::Unknown => ServingStatus::Unknown,
    }
}

#[tonic::async_trait]
impl health_server::Health for HealthService {
    async fn check(
        &self,
        request: tonic::Request<HealthCheckRequest>,
    ) -> Result<tonic::Response<HealthCheckResponse>, tonic::Status> {
        let status = self.resolve(&request.into_inner().service).await?;
        Ok(tonic::Response::new(HealthCheckResponse {
            status: status as i32,
        }))
    }

    type WatchStream = Pin<
        Box<
            dyn futures::Stream<Item = Result<HealthCheckResponse, tonic::Status>>
                + Send,
        >,
    >;

    /// Minimal-but-conformant watch: the current status is sent once, then
    /// the stream stays open until the client goes away.
    async fn watch(
        &self,
        request: tonic::Request<HealthCheckRequest>,
    ) -> Result<tonic::Response<Self::WatchStream>, tonic::Status> {
        let status = self.resolve(&request.into_inner().service).await?;

        let stream = futures::stream::once(async move {
            Ok(HealthCheckResponse {
                status: status as i32,
            })
        })
        .chain(futures::stream::pending());

        Ok(tonic::Response::new(Box::pin(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{check_fn, CheckResult};
    use proto_health::v1::health_server::Health as _;

    fn service(ready: bool) -> HealthService {
        let manager = Manager::new().add_readiness(check_fn("db", move |_| async move {
            if ready {
                CheckResult::up()
            } else {
                CheckResult::down("gone")
            }
        }));
        HealthService::new(Arc::new(manager))
    }

    fn request(service: &str) -> tonic::Request<HealthCheckRequest> {
        tonic::Request::new(HealthCheckRequest {
            service: service.to_string(),
        })
    }

    #[tokio::test]
    async fn empty_service_name_uses_the_readiness_lane() {
        let response = service(true).check(request("")).await.unwrap();
        assert_eq!(response.into_inner().status(), ServingStatus::Serving);

        let response = service(false).check(request("")).await.unwrap();
        assert_eq!(response.into_inner().status(), ServingStatus::NotServing);
    }

    #[tokio::test]
    async fn liveness_lane_is_independent_of_readiness() {
        let response = service(false).check(request(LIVENESS_SERVICE)).await.unwrap();
        assert_eq!(response.into_inner().status(), ServingStatus::Serving);
    }

    #[tokio::test]
    async fn unknown_service_is_not_found() {
        let status = service(true)
            .check(request("billing"))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn override_masks_lane_dispatch() {
        let svc = service(true);
        svc.set_serving_status("", ServingStatus::NotServing);

        let response = svc.check(request("")).await.unwrap();
        assert_eq!(response.into_inner().status(), ServingStatus::NotServing);

        svc.clear_serving_status("");
        let response = svc.check(request("")).await.unwrap();
        assert_eq!(response.into_inner().status(), ServingStatus::Serving);
    }

    #[tokio::test]
    async fn watch_sends_current_status_then_blocks() {
        let svc = service(true);
        let mut stream = svc.watch(request("")).await.unwrap().into_inner();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.status(), ServingStatus::Serving);

        // No further item arrives; the stream just stays open.
        let pending =
            tokio::time::timeout(std::time::Duration::from_millis(50), stream.next()).await;
        assert!(pending.is_err());
    }
}

//! Composable health tree: liveness and readiness checkers aggregated by a
//! manager and served on both the HTTP (`/healthz`, `/readyz`) and RPC
//! (`grpc.health.v1.Health`) surfaces.

mod checker;
pub mod http;
mod manager;
pub mod rpc;
mod status;

pub use checker::{check_fn, Checker, Composite};
pub use manager::Manager;
pub use rpc::HealthService;
pub use status::{CheckResult, Report, Status};

use crate::{CheckResult, Checker, Report, Status};
use endpoint::Context;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Holds the liveness and readiness checker lists and runs a lane's checkers
/// concurrently under a derived timeout. A lane with no registered checkers
/// reports UP.
pub struct Manager {
    liveness: Vec<Arc<dyn Checker>>,
    readiness: Vec<Arc<dyn Checker>>,
    timeout: Duration,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager {
    pub fn new() -> Self {
        Self {
            liveness: Vec::new(),
            readiness: Vec::new(),
            timeout: DEFAULT_CHECK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn add_liveness(mut self, checker: Arc<dyn Checker>) -> Self {
        self.liveness.push(checker);
        self
    }

    pub fn add_readiness(mut self, checker: Arc<dyn Checker>) -> Self {
        self.readiness.push(checker);
        self
    }

    pub async fn liveness(&self, cx: &Context) -> Report {
        self.run_lane(cx, &self.liveness).await
    }

    pub async fn readiness(&self, cx: &Context) -> Report {
        self.run_lane(cx, &self.readiness).await
    }

    async fn run_lane(&self, cx: &Context, checkers: &[Arc<dyn Checker>]) -> Report {
        let timestamp = OffsetDateTime::now_utc();
        let started = tokio::time::Instant::now();
        let cx = cx.clone().with_timeout(self.timeout);

        let results = futures::future::join_all(
            checkers
                .iter()
                .map(|checker| self.run_one(cx.clone(), checker.clone())),
        )
        .await;

        let status = Status::aggregate(results.iter().map(|(_, r)| r.status));
        Report {
            status,
            timestamp,
            duration: started.elapsed(),
            checks: results.into_iter().collect::<BTreeMap<_, _>>(),
        }
    }

    /// One checker under the lane timeout, isolated so a panic degrades to
    /// DOWN rather than tearing down the caller.
    async fn run_one(
        &self,
        cx: Context,
        checker: Arc<dyn Checker>,
    ) -> (String, CheckResult) {
        let name = checker.name().to_string();
        let started = tokio::time::Instant::now();

        let mut handle = tokio::spawn({
            let cx = cx.clone();
            let checker = checker.clone();
            async move { checker.check(&cx).await }
        });

        let mut result = match tokio::time::timeout(self.timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                let message = match join_error.try_into_panic() {
                    Ok(panic) => format!("checker panicked: {}", panic_message(panic)),
                    Err(join_error) => format!("checker aborted: {join_error}"),
                };
                tracing::error!(checker = %name, %message, "health check failed");
                CheckResult::down(message)
            }
            Err(_) => {
                handle.abort();
                CheckResult::down(format!(
                    "timed out after {}",
                    humantime::format_duration(self.timeout)
                ))
            }
        };

        result.duration = started.elapsed();
        (name, result)
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check_fn;

    #[tokio::test]
    async fn empty_lane_reports_up() {
        let manager = Manager::new();
        let report = manager.readiness(&Context::background()).await;
        assert_eq!(report.status, Status::Up);
        assert!(report.checks.is_empty());
    }

    #[tokio::test]
    async fn lanes_are_disjoint() {
        let manager = Manager::new()
            .add_liveness(check_fn("proc", |_| async { CheckResult::up() }))
            .add_readiness(check_fn("db", |_| async { CheckResult::down("no route") }));

        let live = manager.liveness(&Context::background()).await;
        assert_eq!(live.status, Status::Up);
        assert!(live.checks.contains_key("proc"));

        let ready = manager.readiness(&Context::background()).await;
        assert_eq!(ready.status, Status::Down);
    }

    #[tokio::test]
    async fn slow_checker_degrades_to_down_on_timeout() {
        let manager = Manager::new()
            .with_timeout(Duration::from_millis(50))
            .add_readiness(check_fn("stuck", |_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                CheckResult::up()
            }));

        let report = manager.readiness(&Context::background()).await;
        assert_eq!(report.status, Status::Down);
        assert!(report.checks["stuck"]
            .message
            .as_deref()
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test]
    async fn panicking_checker_degrades_to_down() {
        let manager = Manager::new()
            .add_readiness(check_fn("bad", |_| async { panic!("probe exploded") }))
            .add_readiness(check_fn("good", |_| async { CheckResult::up() }));

        let report = manager.readiness(&Context::background()).await;
        assert_eq!(report.status, Status::Down);
        assert!(report.checks["bad"]
            .message
            .as_deref()
            .unwrap()
            .contains("probe exploded"));
        assert_eq!(report.checks["good"].status, Status::Up);
    }

    #[tokio::test]
    async fn unknown_without_down_yields_unknown() {
        let manager = Manager::new()
            .add_readiness(check_fn("a", |_| async { CheckResult::up() }))
            .add_readiness(check_fn("b", |_| async {
                CheckResult::unknown("still warming up")
            }));

        let report = manager.readiness(&Context::background()).await;
        assert_eq!(report.status, Status::Unknown);
    }
}

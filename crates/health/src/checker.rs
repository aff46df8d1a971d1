use crate::{CheckResult, Status};
use endpoint::Context;
use std::sync::Arc;

/// A named health probe. Implementations must honor context cancellation;
/// the manager treats an overrun of its per-invocation timeout as DOWN.
#[async_trait::async_trait]
pub trait Checker: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self, cx: &Context) -> CheckResult;
}

/// Build a checker from a closure.
pub fn check_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn Checker>
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = CheckResult> + Send + 'static,
{
    struct FnChecker<F> {
        name: String,
        f: F,
    }

    #[async_trait::async_trait]
    impl<F, Fut> Checker for FnChecker<F>
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = CheckResult> + Send + 'static,
    {
        fn name(&self) -> &str {
            &self.name
        }

        async fn check(&self, cx: &Context) -> CheckResult {
            (self.f)(cx.clone()).await
        }
    }

    Arc::new(FnChecker {
        name: name.into(),
        f,
    })
}

/// A checker over inner checkers: children run sequentially, results
/// aggregate per the composite rule, and child outcomes surface as details.
pub struct Composite {
    name: String,
    children: Vec<Arc<dyn Checker>>,
}

impl Composite {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
        }
    }

    pub fn with(mut self, child: Arc<dyn Checker>) -> Self {
        self.children.push(child);
        self
    }
}

#[async_trait::async_trait]
impl Checker for Composite {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, cx: &Context) -> CheckResult {
        let mut statuses = Vec::with_capacity(self.children.len());
        let mut result = CheckResult::up();

        for child in &self.children {
            let started = tokio::time::Instant::now();
            let mut child_result = child.check(cx).await;
            child_result.duration = started.elapsed();

            statuses.push(child_result.status);
            result.details.insert(
                child.name().to_string(),
                serde_json::to_value(&child_result).unwrap_or_default(),
            );
        }

        result.status = Status::aggregate(statuses);
        if result.status != Status::Up {
            result.message = Some("one or more inner checks failed".to_string());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn composite_aggregates_and_exposes_children() {
        let composite = Composite::new("deps")
            .with(check_fn("db", |_cx| async { CheckResult::up() }))
            .with(check_fn("cache", |_cx| async {
                CheckResult::down("connection refused")
            }));

        let result = composite.check(&Context::background()).await;
        assert_eq!(result.status, Status::Down);
        assert_eq!(result.details["db"]["status"], "UP");
        assert_eq!(result.details["cache"]["status"], "DOWN");
    }
}

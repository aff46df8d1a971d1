use crate::Error;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Context is the per-request ambient context threaded through every layer:
/// limiter waits, retry sleeps, broker I/O, handlers, and shutdown all observe
/// the same cancellation signal and deadline.
///
/// Contexts are cheap to clone. Derived contexts (`child`, `with_timeout`)
/// are cancelled when their parent is cancelled, but not vice versa.
#[derive(Clone, Debug, Default)]
pub struct Context {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    values: http::Extensions,
}

impl Context {
    /// An empty root context: never cancelled, no deadline, no values.
    pub fn background() -> Self {
        Self::default()
    }

    /// Build a context driven by an externally-owned cancellation token.
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
            values: http::Extensions::new(),
        }
    }

    /// Derive a child context whose token is cancelled with this one.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
            values: self.values.clone(),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel this context and every context derived from it.
    pub fn cancel(&self) {
        self.cancel.cancel()
    }

    /// Derive a context whose deadline is the earlier of the current deadline
    /// and `deadline`.
    pub fn with_deadline(self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(cur) if cur <= deadline => cur,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            ..self
        }
    }

    /// Derive a context which expires after `timeout`.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time remaining until the deadline, or None if no deadline is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Attach a request-scoped value, keyed by its type.
    pub fn with_value<T>(mut self, value: T) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        self.values.insert(value);
        self
    }

    pub fn value<T>(&self) -> Option<&T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.values.get::<T>()
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// The reason this context is done, if it is.
    pub fn err(&self) -> Option<Error> {
        if self.cancel.is_cancelled() {
            Some(Error::Cancelled)
        } else if matches!(self.deadline, Some(d) if d <= Instant::now()) {
            Some(Error::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    /// Pends forever on a background context.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => tokio::select! {
                () = self.cancel.cancelled() => (),
                () = tokio::time::sleep_until(deadline) => (),
            },
            None => self.cancel.cancelled().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deadline_keeps_the_earlier_of_parent_and_child() {
        let far = Instant::now() + Duration::from_secs(60);
        let near = Instant::now() + Duration::from_millis(1);

        let cx = Context::background().with_deadline(near).with_deadline(far);
        assert_eq!(cx.deadline(), Some(near));

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(cx.err(), Some(Error::DeadlineExceeded));
    }

    #[tokio::test]
    async fn cancel_propagates_to_children_only() {
        let parent = Context::background();
        let child = parent.child();

        child.cancel();
        assert!(parent.err().is_none());
        assert_eq!(child.err(), Some(Error::Cancelled));

        let child2 = parent.child();
        parent.cancel();
        assert_eq!(child2.err(), Some(Error::Cancelled));
    }

    #[tokio::test]
    async fn values_are_type_keyed() {
        #[derive(Clone, PartialEq, Debug)]
        struct Who(&'static str);

        let cx = Context::background().with_value(Who("gull"));
        assert_eq!(cx.value::<Who>(), Some(&Who("gull")));
        assert_eq!(cx.value::<String>(), None);
    }
}

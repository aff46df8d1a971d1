use crate::{Error, Limiter};
use endpoint::Context;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Fixed window counter: O(1) state. A burst straddling a window boundary can
/// admit up to twice the limit, the usual trade-off for this scheme.
pub struct FixedWindow {
    limit: u32,
    window: Duration,
    state: Mutex<State>,
}

struct State {
    window_start: Instant,
    count: u32,
}

impl FixedWindow {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: Mutex::new(State {
                window_start: Instant::now(),
                count: 0,
            }),
        }
    }

    fn try_admit(&self, n: u32) -> Result<(), Instant> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();

        if now.saturating_duration_since(state.window_start) >= self.window {
            state.window_start = now;
            state.count = 0;
        }

        if state.count + n <= self.limit {
            state.count += n;
            Ok(())
        } else {
            Err(state.window_start + self.window)
        }
    }
}

#[async_trait::async_trait]
impl Limiter for FixedWindow {
    async fn allow_n(&self, _cx: &Context, n: u32) -> bool {
        self.try_admit(n).is_ok()
    }

    async fn wait(&self, cx: &Context) -> Result<(), Error> {
        loop {
            let retry_at = match self.try_admit(1) {
                Ok(()) => return Ok(()),
                Err(retry_at) => retry_at,
            };
            tokio::select! {
                () = cx.done() => {
                    return Err(cx.err().unwrap_or(endpoint::Error::Cancelled).into())
                }
                () = tokio::time::sleep_until(retry_at) => (),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn window_resets_after_expiry() {
        let cx = Context::background();
        let window = FixedWindow::new(2, Duration::from_millis(100));

        assert!(window.allow(&cx).await);
        assert!(window.allow(&cx).await);
        assert!(!window.allow(&cx).await);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(window.allow(&cx).await);
    }

    #[tokio::test]
    async fn allow_n_is_all_or_nothing() {
        let cx = Context::background();
        let window = FixedWindow::new(3, Duration::from_secs(60));

        assert!(window.allow_n(&cx, 2).await);
        assert!(!window.allow_n(&cx, 2).await);
        assert!(window.allow(&cx).await);
    }
}

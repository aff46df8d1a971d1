use crate::{Error, Limiter};
use endpoint::Context;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Sliding window: a true rolling admission count over the trailing window.
/// More precise than a fixed window at the cost of O(limit) memory.
pub struct SlidingWindow {
    limit: usize,
    window: Duration,
    admitted: Mutex<VecDeque<Instant>>,
}

impl SlidingWindow {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            admitted: Mutex::new(VecDeque::with_capacity(limit)),
        }
    }

    /// Admit `n`, or report when the oldest in-window entry expires.
    fn try_admit(&self, n: usize) -> Result<(), Instant> {
        let mut admitted = self.admitted.lock().unwrap();
        let now = Instant::now();

        while matches!(admitted.front(), Some(&at) if at + self.window <= now) {
            admitted.pop_front();
        }

        if admitted.len() + n <= self.limit {
            for _ in 0..n {
                admitted.push_back(now);
            }
            Ok(())
        } else {
            // Earliest instant at which another slot frees up.
            Err(admitted.front().copied().unwrap_or(now) + self.window)
        }
    }
}

#[async_trait::async_trait]
impl Limiter for SlidingWindow {
    async fn allow_n(&self, _cx: &Context, n: u32) -> bool {
        self.try_admit(n as usize).is_ok()
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

//! Admission control: token bucket, sliding window, and fixed window limiters
//! behind one trait, plus a distributed variant backed by a shared counter
//! store and a keyed wrapper for per-subject limits.

mod distributed;
pub mod extract;
mod fixed_window;
mod keyed;
pub mod middleware;
mod sliding_window;
mod token_bucket;

pub use distributed::{Distributed, MemoryStore, Store};
pub use fixed_window::FixedWindow;
pub use keyed::Keyed;
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

use endpoint::Context;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Context(#[from] endpoint::Error),
    #[error("limiter store error: {0}")]
    Store(BoxError),
}

/// A rate limiter. `allow`/`allow_n` decide without blocking; `wait` blocks
/// until admission or until the context is done, in which case it returns the
/// context's error. All operations are safe for concurrent use.
#[async_trait::async_trait]
pub trait Limiter: Send + Sync {
    async fn allow(&self, cx: &Context) -> bool {
        self.allow_n(cx, 1).await
    }

    async fn allow_n(&self, cx: &Context, n: u32) -> bool;

    async fn wait(&self, cx: &Context) -> Result<(), Error>;
}

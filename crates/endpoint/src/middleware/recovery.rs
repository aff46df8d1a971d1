use crate::{Endpoint, Error, Middleware};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;

const DEFAULT_MAX_STACK_BYTES: usize = 8 << 10;

/// Converts a panic anywhere below this middleware into an internal error,
/// logging the panic payload and a bounded backtrace instead of unwinding
/// through the server.
pub struct Recovery {
    max_stack_bytes: usize,
}

impl Default for Recovery {
    fn default() -> Self {
        Self {
            max_stack_bytes: DEFAULT_MAX_STACK_BYTES,
        }
    }
}

impl Recovery {
    pub fn max_stack_bytes(mut self, max: usize) -> Self {
        self.max_stack_bytes = max;
        self
    }

    pub fn into_middleware<Req, Resp>(self) -> Middleware<Req, Resp>
    where
        Req: Send + 'static,
        Resp: 'static,
    {
        let max = self.max_stack_bytes;
        Middleware::new(move |next| {
            Endpoint::new(move |cx, req| {
                let next = next.clone();
                async move {
                    match AssertUnwindSafe(next.call(cx, req)).catch_unwind().await {
                        Ok(result) => result,
                        Err(panic) => {
                            let message = panic_message(panic);
                            let mut stack =
                                std::backtrace::Backtrace::force_capture().to_string();
                            stack.truncate(max);
                            tracing::error!(panic = %message, %stack, "recovered from panic");
                            Err(Error::Panic(message).into())
                        }
                    }
                }
            })
        })
    }
}

/// Recovery with the default stack bound.
pub fn recovery<Req, Resp>() -> Middleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: 'static,
{
    Recovery::default().into_middleware()
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

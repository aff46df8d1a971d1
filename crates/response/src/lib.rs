//! Unified response and error-code space: numeric business codes, their
//! protocol mappings, and the JSON reply envelope shared by every HTTP
//! surface.
//!
//! Codes at or above 50000 are internal: their underlying cause is preserved
//! for logs but never surfaced to callers.

mod code;
mod error;
mod reply;

pub use code::Code;
pub use error::{code_of, debug_chain, public_message, status_of, wrap, Error};
pub use reply::{Page, PageInfo, Reply};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

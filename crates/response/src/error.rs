use crate::{BoxError, Code};

/// A business error: a code, an optional message override, and an optional
/// underlying cause retained for logs.
#[derive(Debug, thiserror::Error)]
#[error("[{code}] {}", self.message())]
pub struct Error {
    code: Code,
    message: Option<String>,
    #[source]
    cause: Option<BoxError>,
}

impl Error {
    pub fn new(code: Code) -> Self {
        Self {
            code,
            message: None,
            cause: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn code(&self) -> Code {
        self.code
    }

    /// The override if set, else the code's default.
    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or_else(|| self.code.message())
    }
}

/// Wrap `err` under a business code. The cause is visible to `debug_chain`
/// and to `source()` walkers, but never to callers for internal codes.
pub fn wrap(code: Code, err: impl Into<BoxError>) -> Error {
    Error {
        code,
        message: None,
        cause: Some(err.into()),
    }
}

/// Walk the error chain for the nearest business code.
/// Anything without one is classified internal.
pub fn code_of(err: &(dyn std::error::Error + 'static)) -> Code {
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cur {
        if let Some(business) = e.downcast_ref::<Error>() {
            return business.code();
        }
        cur = e.source();
    }
    Code::INTERNAL
}

/// The caller-safe message for `err`: internal codes (≥ 50000) always yield
/// the code's default message so causes cannot leak; other codes yield the
/// override or the default.
pub fn public_message(err: &(dyn std::error::Error + 'static)) -> String {
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cur {
        if let Some(business) = e.downcast_ref::<Error>() {
            if business.code().is_internal() {
                return business.code().message().to_string();
            }
            return business.message().to_string();
        }
        cur = e.source();
    }
    Code::INTERNAL.message().to_string()
}

/// The full chain, for logs only. Never send this to a caller.
pub fn debug_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut cur = err.source();
    while let Some(e) = cur {
        out.push_str(": ");
        out.push_str(&e.to_string());
        cur = e.source();
    }
    out
}

/// Map an error to its RPC status, message sanitized per `public_message`.
pub fn status_of(err: &(dyn std::error::Error + 'static)) -> tonic::Status {
    tonic::Status::new(code_of(err).grpc_code(), public_message(err))
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        tonic::Status::new(err.code().grpc_code(), public_message(&err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_extraction_walks_the_chain() {
        let inner = wrap(Code::NOT_FOUND, anyhow::anyhow!("row missing"));
        let outer = wrap(Code::NOT_FOUND, inner);
        assert_eq!(code_of(&outer), Code::NOT_FOUND);

        let bare = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        assert_eq!(code_of(&bare), Code::INTERNAL);
    }

    #[test]
    fn extract_of_wrap_is_identity() {
        let err = wrap(Code::CONFLICT, std::io::Error::new(std::io::ErrorKind::Other, "x"));
        assert_eq!(code_of(&err), Code::CONFLICT);
    }

    #[test]
    fn internal_codes_never_leak_their_cause() {
        let err = wrap(
            Code::DATABASE,
            std::io::Error::new(std::io::ErrorKind::Other, "password=secret in DSN"),
        );
        let public = public_message(&err);
        assert_eq!(public, "database error");
        assert!(!public.contains("secret"));

        // The unsafe extractor keeps the whole story for logs.
        assert!(debug_chain(&err).contains("password=secret in DSN"));
    }

    #[test]
    fn non_internal_codes_surface_their_override() {
        let err = Error::new(Code::INVALID_ARGUMENT).with_message("page must be positive");
        assert_eq!(public_message(&err), "page must be positive");
    }

    #[test]
    fn grpc_status_is_sanitized() {
        let err = wrap(Code::DATABASE, std::io::Error::new(std::io::ErrorKind::Other, "dsn"));
        let status = status_of(&err);
        assert_eq!(status.code(), tonic::Code::Internal);
        assert_eq!(status.message(), "database error");
    }
}

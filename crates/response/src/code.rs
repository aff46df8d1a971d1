use http::StatusCode;

/// Numeric business code. 0 is success; ranges partition the failure space:
/// 1xxxx generic, 2xxxx auth, 3xxxx argument, 4xxxx resource, 5xxxx internal,
/// 6xxxx upstream.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct Code(pub u32);

impl Code {
    pub const OK: Code = Code(0);

    pub const UNKNOWN: Code = Code(10001);
    pub const TIMEOUT: Code = Code(10002);
    pub const RATE_LIMITED: Code = Code(10003);

    pub const UNAUTHENTICATED: Code = Code(20001);
    pub const TOKEN_EXPIRED: Code = Code(20002);
    pub const FORBIDDEN: Code = Code(20003);

    pub const INVALID_ARGUMENT: Code = Code(30001);
    pub const MISSING_ARGUMENT: Code = Code(30002);

    pub const NOT_FOUND: Code = Code(40001);
    pub const ALREADY_EXISTS: Code = Code(40002);
    pub const CONFLICT: Code = Code(40003);
    pub const EXHAUSTED: Code = Code(40004);

    pub const INTERNAL: Code = Code(50001);
    pub const SERIALIZATION: Code = Code(50002);
    pub const DATABASE: Code = Code(50003);

    pub const UPSTREAM: Code = Code(60001);
    pub const UPSTREAM_TIMEOUT: Code = Code(60002);
    pub const UNAVAILABLE: Code = Code(60003);

    /// Internal codes surface only their default message to callers.
    pub fn is_internal(&self) -> bool {
        self.0 >= 50000
    }

    pub fn message(&self) -> &'static str {
        match *self {
            Code::OK => "ok",
            Code::UNKNOWN => "unknown error",
            Code::TIMEOUT => "request timed out",
            Code::RATE_LIMITED => "rate limit exceeded",
            Code::UNAUTHENTICATED => "unauthenticated",
            Code::TOKEN_EXPIRED => "token expired",
            Code::FORBIDDEN => "forbidden",
            Code::INVALID_ARGUMENT => "invalid argument",
            Code::MISSING_ARGUMENT => "missing argument",
            Code::NOT_FOUND => "not found",
            Code::ALREADY_EXISTS => "already exists",
            Code::CONFLICT => "conflict",
            Code::EXHAUSTED => "resource exhausted",
            Code::INTERNAL => "internal error",
            Code::SERIALIZATION => "serialization error",
            Code::DATABASE => "database error",
            Code::UPSTREAM => "upstream error",
            Code::UPSTREAM_TIMEOUT => "upstream timed out",
            Code::UNAVAILABLE => "service unavailable",
            Code(n) => match n {
                1..=19999 => "unknown error",
                20000..=29999 => "unauthenticated",
                30000..=39999 => "invalid argument",
                40000..=49999 => "resource error",
                50000..=59999 => "internal error",
                _ => "upstream error",
            },
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match *self {
            Code::OK => StatusCode::OK,
            Code::TIMEOUT | Code::UPSTREAM_TIMEOUT => StatusCode::GATEWAY_TIMEOUT,
            Code::RATE_LIMITED | Code::EXHAUSTED => StatusCode::TOO_MANY_REQUESTS,
            Code::UNAUTHENTICATED | Code::TOKEN_EXPIRED => StatusCode::UNAUTHORIZED,
            Code::FORBIDDEN => StatusCode::FORBIDDEN,
            Code::INVALID_ARGUMENT | Code::MISSING_ARGUMENT => StatusCode::BAD_REQUEST,
            Code::NOT_FOUND => StatusCode::NOT_FOUND,
            Code::ALREADY_EXISTS | Code::CONFLICT => StatusCode::CONFLICT,
            Code::UPSTREAM => StatusCode::BAD_GATEWAY,
            Code::UNAVAILABLE => StatusCode::SERVICE_UNAVAILABLE,
            Code(n) => match n {
                20000..=29999 => StatusCode::UNAUTHORIZED,
                30000..=39999 => StatusCode::BAD_REQUEST,
                40000..=49999 => StatusCode::NOT_FOUND,
                60000..=69999 => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn grpc_code(&self) -> tonic::Code {
        match *self {
            Code::OK => tonic::Code::Ok,
            Code::TIMEOUT | Code::UPSTREAM_TIMEOUT => tonic::Code::DeadlineExceeded,
            Code::RATE_LIMITED | Code::EXHAUSTED => tonic::Code::ResourceExhausted,
            Code::UNAUTHENTICATED | Code::TOKEN_EXPIRED => tonic::Code::Unauthenticated,
            Code::FORBIDDEN => tonic::Code::PermissionDenied,
            Code::INVALID_ARGUMENT | Code::MISSING_ARGUMENT => {
                tonic::Code::InvalidArgument
            }
            Code::NOT_FOUND => tonic::Code::NotFound,
            Code::ALREADY_EXISTS => tonic::Code::AlreadyExists,
            Code::CONFLICT => tonic::Code::Aborted,
            Code::UPSTREAM | Code::UNAVAILABLE => tonic::Code::Unavailable,
            Code(n) => match n {
                0 => tonic::Code::Ok,
                20000..=29999 => tonic::Code::Unauthenticated,
                30000..=39999 => tonic::Code::InvalidArgument,
                40000..=49999 => tonic::Code::NotFound,
                50000..=59999 => tonic::Code::Internal,
                60000..=69999 => tonic::Code::Unavailable,
                _ => tonic::Code::Unknown,
            },
        }
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_boundary_is_50000() {
        assert!(!Code::EXHAUSTED.is_internal());
        assert!(Code::INTERNAL.is_internal());
        assert!(Code::UPSTREAM.is_internal());
        assert!(Code(50000).is_internal());
        assert!(!Code(49999).is_internal());
    }

    #[test]
    fn range_fallbacks_apply_to_unregistered_codes() {
        assert_eq!(Code(30099).http_status(), StatusCode::BAD_REQUEST);
        assert_eq!(Code(30099).grpc_code(), tonic::Code::InvalidArgument);
        assert_eq!(Code(55555).message(), "internal error");
    }
}

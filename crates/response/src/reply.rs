use crate::{code_of, public_message, Code};
use axum::response::IntoResponse;
use serde::Serialize;

/// The uniform HTTP response body:
/// `{"code": N, "message": "...", "data": ..., "pagination": ...}`.
/// `data` is omitted when empty; `pagination` only appears on paginated
/// replies.
#[derive(Debug, Serialize)]
pub struct Reply<T> {
    pub code: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<PageInfo>,
}

impl Reply<()> {
    pub fn empty() -> Self {
        Self {
            code: Code::OK.0,
            message: Code::OK.message().to_string(),
            data: None,
            pagination: None,
        }
    }

    /// An error reply with code and sanitized message per the code space.
    pub fn error(err: &(dyn std::error::Error + 'static)) -> Self {
        let code = code_of(err);
        Self {
            code: code.0,
            message: public_message(err),
            data: None,
            pagination: None,
        }
    }
}

impl<T> Reply<T> {
    pub fn ok(data: T) -> Self {
        Self {
            code: Code::OK.0,
            message: Code::OK.message().to_string(),
            data: Some(data),
            pagination: None,
        }
    }
}

impl<T> Reply<Vec<T>> {
    pub fn paginated(page: Page<T>) -> Self {
        Self {
            code: Code::OK.0,
            message: Code::OK.message().to_string(),
            data: Some(page.items),
            pagination: Some(page.info),
        }
    }
}

impl<T: Serialize> IntoResponse for Reply<T> {
    fn into_response(self) -> axum::response::Response {
        let status = Code(self.code).http_status();
        (status, axum::Json(self)).into_response()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct PageInfo {
    pub page: u64,
    pub page_size: u64,
    pub total: u64,
    pub total_pages: u64,
}

impl PageInfo {
    pub fn new(page: u64, page_size: u64, total: u64) -> Self {
        let total_pages = if page_size == 0 {
            0
        } else {
            total.div_ceil(page_size)
        };
        Self {
            page,
            page_size,
            total,
            total_pages,
        }
    }
}

/// One page of results plus its placement in the whole.
#[derive(Debug)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub info: PageInfo,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, page: u64, page_size: u64, total: u64) -> Self {
        Self {
            items,
            info: PageInfo::new(page, page_size, total),
        }
    }
}

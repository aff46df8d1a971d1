use response::{Code, Reply};

/// Panic-to-response handler for the HTTP surface: a 500 with the uniform
/// JSON envelope and no panic detail leaked to the caller.
pub fn http_panic(panic: Box<dyn std::any::Any + Send + 'static>) -> http::Response<axum::body::Body> {
    let message = panic_message(&panic);
    tracing::error!(panic = %message, "recovered from panic in http handler");

    let reply = Reply::error(&response::Error::new(Code::INTERNAL));
    let body = serde_json::to_vec(&reply).unwrap_or_default();
    http::Response::builder()
        .status(Code::INTERNAL.http_status())
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(axum::body::Body::from(body))
        .expect("static panic response")
}

/// Panic-to-response handler for the RPC surface: trailers-only Internal.
pub fn grpc_panic(panic: Box<dyn std::any::Any + Send + 'static>) -> http::Response<axum::body::Body> {
    let message = panic_message(&panic);
    tracing::error!(panic = %message, "recovered from panic in rpc handler");
    super::grpc_error(tonic::Code::Internal, "internal error")
}

fn panic_message(panic: &Box<dyn std::any::Any + Send + 'static>) -> String {
    if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic".to_string()
    }
}

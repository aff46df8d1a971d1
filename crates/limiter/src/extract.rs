//! Pure request-to-key extractors shared by the HTTP and RPC rate-limit
//! layers (both see `http::Request` at the tower level).

use std::sync::Arc;

/// Client address resolved by the server's client-IP middleware and stashed
/// in request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

pub type KeyFn<B> = Arc<dyn Fn(&http::Request<B>) -> String + Send + Sync>;

/// Key by client IP: the `ClientIp` extension when present, else the first
/// `x-forwarded-for` hop, else `x-real-ip`, else empty.
pub fn by_ip<B>() -> KeyFn<B> {
    Arc::new(|req| {
        if let Some(ClientIp(ip)) = req.extensions().get::<ClientIp>() {
            return ip.clone();
        }
        if let Some(forwarded) = header_str(req, "x-forwarded-for") {
            if let Some(first) = forwarded.split(',').next() {
                return first.trim().to_string();
            }
        }
        header_str(req, "x-real-ip").unwrap_or_default()
    })
}

pub fn by_path<B>() -> KeyFn<B> {
    Arc::new(|req| req.uri().path().to_string())
}

pub fn by_method<B>() -> KeyFn<B> {
    Arc::new(|req| req.method().as_str().to_string())
}

/// Key by a metadata/header value; missing headers key to the empty string.
pub fn by_header<B>(name: &'static str) -> KeyFn<B> {
    Arc::new(move |req| header_str(req, name).unwrap_or_default())
}

/// Join several extractors' keys with `:`.
pub fn composite<B: 'static>(parts: Vec<KeyFn<B>>) -> KeyFn<B> {
    Arc::new(move |req| {
        parts
            .iter()
            .map(|part| part(req))
            .collect::<Vec<_>>()
            .join(":")
    })
}

fn header_str<B>(req: &http::Request<B>, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &str) -> http::Request<()> {
        http::Request::builder()
            .method("POST")
            .uri(format!("http://svc{path}"))
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.2")
            .header("x-tenant", "acme")
            .body(())
            .unwrap()
    }

    #[test]
    fn ip_prefers_extension_then_forwarded_chain() {
        let mut req = request("/orders");
        assert_eq!(by_ip()(&req), "203.0.113.9");

        req.extensions_mut().insert(ClientIp("198.51.100.7".into()));
        assert_eq!(by_ip()(&req), "198.51.100.7");
    }

    #[test]
    fn composite_joins_parts() {
        let key = composite(vec![by_method(), by_path(), by_header("x-tenant")]);
        assert_eq!(key(&request("/orders")), "POST:/orders:acme");
    }
}

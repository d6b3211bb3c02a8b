/// Headers whose values must never end up in logs or spans.
const SENSITIVE_HEADERS: [&str; 3] = ["authorization", "cookie", "set-cookie"];

pub trait Sanitize {
    fn sanitize(&self) -> Self;
}

impl Sanitize for http::HeaderMap {
    fn sanitize(&self) -> Self {
        let mut sanitized = self.clone();
        for header in SENSITIVE_HEADERS {
            if sanitized.remove(header).is_some() {
                sanitized.insert(header, http::HeaderValue::from_static("<redacted>"));
            }
        }
        sanitized
    }
}

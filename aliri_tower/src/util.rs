//! Utilities for generating HTTP responses on authentication failures

use http::{header, HeaderValue, Response, StatusCode};

/// Build a `401 Unauthorized` response with a JSON error body and the
/// appropriate `www-authenticate` header
///
/// The prepared response will have the form:
///
/// ```http
/// HTTP/1.1 401 Unauthorized
/// content-type: application/json
/// www-authenticate: Bearer error="invalid_token"
///
/// {"error":"{message}"}
/// ```
pub fn unauthorized<Body: From<String>>(message: &str) -> Response<Body> {
    unauthorized_with_challenge(message, invalid_token(""))
}

/// Build a `401 Unauthorized` response like [`unauthorized`], but also
/// describing the failure in the `www-authenticate` challenge
///
/// The description provided will be automatically escaped to make sure it
/// is header-friendly.
///
/// ```http
/// www-authenticate: Bearer error="invalid_token" error_description="{message}"
/// ```
pub fn unauthorized_with_description<Body: From<String>>(message: &str) -> Response<Body> {
    unauthorized_with_challenge(message, invalid_token(message))
}

fn unauthorized_with_challenge<Body: From<String>>(
    message: &str,
    challenge: HeaderValue,
) -> Response<Body> {
    let body = serde_json::json!({ "error": message }).to_string();

    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = StatusCode::UNAUTHORIZED;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    resp.headers_mut().insert(header::WWW_AUTHENTICATE, challenge);
    resp
}

fn invalid_token(description: &str) -> HeaderValue {
    const BARE: &str = r#"Bearer error="invalid_token""#;

    if description.is_empty() {
        return HeaderValue::from_static(BARE);
    }

    // `escape_default` leaves only printable ASCII
    HeaderValue::try_from(format!(
        r#"{BARE} error_description="{}""#,
        description.escape_default()
    ))
    .unwrap_or_else(|_| HeaderValue::from_static(BARE))
}

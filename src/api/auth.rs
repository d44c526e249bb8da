use axum::http::{header, HeaderMap};
use subtle::ConstantTimeEq;

use super::error::ApiError;

/// Extract a Bearer token from the Authorization header.
pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Check the request's bearer token against `expected`.
///
/// With no token configured every request passes.
pub fn check_bearer(headers: &HeaderMap, expected: Option<&str>) -> Result<(), ApiError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    match extract_bearer(headers) {
        Some(token) if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) => Ok(()),
        Some(_) => Err(ApiError::AuthInvalid),
        None => Err(ApiError::AuthRequired),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(auth: Option<&'static str>) -> HeaderMap {
        let mut h = HeaderMap::new();
        if let Some(v) = auth {
            h.insert(header::AUTHORIZATION, HeaderValue::from_static(v));
        }
        h
    }

    #[test]
    fn extract_bearer_with_header() {
        assert_eq!(
            extract_bearer(&headers(Some("Bearer my-secret-token"))),
            Some("my-secret-token")
        );
    }

    #[test]
    fn extract_bearer_wrong_scheme() {
        assert_eq!(extract_bearer(&headers(Some("Basic dXNlcjpwYXNz"))), None);
        assert_eq!(extract_bearer(&headers(None)), None);
    }

    #[test]
    fn no_token_configured_allows_all() {
        assert!(check_bearer(&headers(None), None).is_ok());
        assert!(check_bearer(&headers(Some("Bearer anything")), None).is_ok());
    }

    #[test]
    fn correct_token_passes() {
        assert!(check_bearer(&headers(Some("Bearer s3cret")), Some("s3cret")).is_ok());
    }

    #[test]
    fn wrong_token_is_invalid() {
        assert!(matches!(
            check_bearer(&headers(Some("Bearer nope")), Some("s3cret")),
            Err(ApiError::AuthInvalid)
        ));
        assert!(matches!(
            check_bearer(&headers(Some("Bearer s3cret-but-longer")), Some("s3cret")),
            Err(ApiError::AuthInvalid)
        ));
    }

    #[test]
    fn missing_token_is_required() {
        assert!(matches!(
            check_bearer(&headers(None), Some("s3cret")),
            Err(ApiError::AuthRequired)
        ));
    }
}

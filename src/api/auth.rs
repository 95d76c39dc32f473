use super::envelope::ApiError;
use crate::configs::AuthConfig;
use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::sync::Arc;
use tracing::debug;

/// First stage of the request pipeline. Passes everything when no
/// credentials are configured.
pub fn check(auth: Option<&AuthConfig>, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(auth) = auth else {
        return Ok(());
    };
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Basic "))
        .and_then(|encoded| STANDARD.decode(encoded.trim()).ok())
        .and_then(|decoded| String::from_utf8(decoded).ok());
    match presented.as_deref().and_then(|pair| pair.split_once(':')) {
        Some((user, password)) if user == auth.user && password == auth.password => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}

/// `Authorization` header value for the given credentials.
pub fn basic_header(auth: &AuthConfig) -> String {
    format!(
        "Basic {}",
        STANDARD.encode(format!("{}:{}", auth.user, auth.password))
    )
}

pub async fn require_auth(
    State(auth): State<Arc<Option<AuthConfig>>>,
    request: Request,
    next: Next,
) -> Response {
    match check((*auth).as_ref(), request.headers()) {
        Ok(()) => next.run(request).await,
        Err(err) => {
            debug!(uri = %request.uri(), "Rejected unauthenticated request");
            let mut response = err.into_response();
            response.headers_mut().insert(
                WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"custos\""),
            );
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> AuthConfig {
        AuthConfig {
            user: "admin".into(),
            password: "s3cret:with-colon".into(),
        }
    }

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn open_without_credentials() {
        assert!(check(None, &HeaderMap::new()).is_ok());
    }

    #[test]
    fn accepts_matching_credentials() {
        let auth = credentials();
        assert!(check(Some(&auth), &headers(&basic_header(&auth))).is_ok());
    }

    #[test]
    fn rejects_missing_or_wrong_credentials() {
        let auth = credentials();
        assert!(matches!(
            check(Some(&auth), &HeaderMap::new()),
            Err(ApiError::Unauthorized)
        ));
        let wrong = AuthConfig {
            user: "admin".into(),
            password: "nope".into(),
        };
        assert!(check(Some(&auth), &headers(&basic_header(&wrong))).is_err());
        assert!(check(Some(&auth), &headers("Basic !!notbase64")).is_err());
        assert!(check(Some(&auth), &headers("Bearer token")).is_err());
    }
}
